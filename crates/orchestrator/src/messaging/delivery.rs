//! Per-message delivery policy.
//!
//! Every engine message declares a [`MessageClass`]. Commands that start or
//! stop real processes are not retryable: a failed hand-off is reported to
//! the sender as a `DeliveryFailure` and never re-attempted. Everything else
//! is safe to lose and is only logged.

use ractor::{ActorRef, MessagingErr};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::actors::errors::ActorError;
use crate::actors::messages::{
    BenchmarkMessage, ClusterBuilderMessage, DispatcherMessage, NodeBuilderMessage,
};

/// Delivery class of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    /// Side-effecting request, at most once.
    Command,
    /// Repeating it has the same effect as sending it once.
    Idempotent,
    /// Answer to an earlier command.
    Reply,
    /// Ends the conversation on its branch.
    Terminal,
    /// Actor-internal bookkeeping (timers, monitors, queries).
    Internal,
}

/// Delivery metadata carried by every engine message.
pub trait Delivery {
    /// Short name used in logs and errors.
    fn kind(&self) -> &'static str;

    fn class(&self) -> MessageClass;

    /// Whether losing the message may be tolerated.
    fn retryable(&self) -> bool {
        !matches!(self.class(), MessageClass::Command)
    }
}

/// Send `message` once.
///
/// Never retries. A failed hand-off of a non-retryable message becomes
/// `ActorError::DeliveryFailure`; for anything else it is logged and
/// dropped.
///
/// # Errors
///
/// Returns `DeliveryFailure` if a non-retryable message could not be
/// enqueued.
pub fn deliver<M>(target: &ActorRef<M>, message: M) -> Result<(), ActorError>
where
    M: Delivery + ractor::Message,
{
    let kind = message.kind();
    let retryable = message.retryable();
    match target.send_message(message) {
        Ok(()) => {
            debug!(kind, target = %target.get_id(), "Delivered");
            Ok(())
        }
        Err(err) => {
            let reason = match err {
                MessagingErr::SendErr(_) => "mailbox closed",
                MessagingErr::ChannelClosed => "channel closed",
                _ => "invalid actor type",
            };
            if retryable {
                warn!(kind, target = %target.get_id(), reason, "Dropping undeliverable message");
                Ok(())
            } else {
                warn!(kind, target = %target.get_id(), reason, "Could not deliver command");
                Err(ActorError::delivery_failure(kind, target.get_id().to_string()))
            }
        }
    }
}

impl Delivery for BenchmarkMessage {
    fn kind(&self) -> &'static str {
        match self {
            Self::Setup { .. } => "Setup",
            Self::EngineStarted { .. } => "EngineStarted",
            Self::PreparationComplete { .. } => "PreparationComplete",
            Self::TaskFinished { .. } => "TaskFinished",
            Self::BenchmarkComplete { .. } => "BenchmarkComplete",
            Self::EngineStopped => "EngineStopped",
            Self::BenchmarkFailure(_) => "BenchmarkFailure",
            Self::BenchmarkCancelled => "BenchmarkCancelled",
            Self::ChildExited(_) => "ChildExited",
        }
    }

    fn class(&self) -> MessageClass {
        match self {
            Self::Setup { .. } => MessageClass::Command,
            Self::EngineStarted { .. }
            | Self::PreparationComplete { .. }
            | Self::TaskFinished { .. }
            | Self::BenchmarkComplete { .. }
            | Self::EngineStopped => MessageClass::Reply,
            Self::BenchmarkFailure(_) | Self::BenchmarkCancelled => MessageClass::Terminal,
            Self::ChildExited(_) => MessageClass::Internal,
        }
    }
}

impl Delivery for ClusterBuilderMessage {
    fn kind(&self) -> &'static str {
        match self {
            Self::StartEngine { .. } => "StartEngine",
            Self::NodesStarted { .. } => "NodesStarted",
            Self::ResetRelativeTime { .. } => "ResetRelativeTime",
            Self::WakeupResetRelativeTime => "WakeupResetRelativeTime",
            Self::StopEngine => "StopEngine",
            Self::NodesStopped { .. } => "NodesStopped",
            Self::BenchmarkFailure { .. } => "BenchmarkFailure",
            Self::ChildExited(_) => "ChildExited",
            Self::GetStatus { .. } => "GetStatus",
        }
    }

    fn class(&self) -> MessageClass {
        match self {
            Self::StartEngine { .. } | Self::StopEngine => MessageClass::Command,
            Self::NodesStarted { .. } | Self::NodesStopped { .. } => MessageClass::Reply,
            Self::ResetRelativeTime { .. } => MessageClass::Idempotent,
            Self::BenchmarkFailure { .. } => MessageClass::Terminal,
            Self::WakeupResetRelativeTime | Self::ChildExited(_) | Self::GetStatus { .. } => {
                MessageClass::Internal
            }
        }
    }
}

impl Delivery for DispatcherMessage {
    fn kind(&self) -> &'static str {
        match self {
            Self::StartEngine { .. } => "StartEngine",
            Self::HostAvailabilityChanged(_) => "HostAvailabilityChanged",
            Self::RemoteWaitExpired => "RemoteWaitExpired",
            Self::BenchmarkFailure(_) => "BenchmarkFailure",
        }
    }

    fn class(&self) -> MessageClass {
        match self {
            Self::StartEngine { .. } => MessageClass::Command,
            Self::HostAvailabilityChanged(_) | Self::RemoteWaitExpired => MessageClass::Internal,
            Self::BenchmarkFailure(_) => MessageClass::Terminal,
        }
    }
}

impl Delivery for NodeBuilderMessage {
    fn kind(&self) -> &'static str {
        match self {
            Self::StartNodes(_) => "StartNodes",
            Self::FlushMetrics => "FlushMetrics",
            Self::ResetRelativeTime => "ResetRelativeTime",
            Self::StopNodes { .. } => "StopNodes",
        }
    }

    fn class(&self) -> MessageClass {
        match self {
            Self::StartNodes(_) | Self::StopNodes { .. } => MessageClass::Command,
            Self::ResetRelativeTime => MessageClass::Idempotent,
            Self::FlushMetrics => MessageClass::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::errors::FailureSignal;

    #[test]
    fn should_mark_only_process_commands_as_non_retryable() {
        assert!(!ClusterBuilderMessage::StopEngine.retryable());
        assert!(ClusterBuilderMessage::ResetRelativeTime {
            delay: std::time::Duration::ZERO
        }
        .retryable());
        assert!(NodeBuilderMessage::ResetRelativeTime.retryable());
        assert!(NodeBuilderMessage::FlushMetrics.retryable());
        assert!(BenchmarkMessage::BenchmarkCancelled.retryable());
    }

    #[test]
    fn should_classify_failures_as_terminal() {
        let msg = DispatcherMessage::BenchmarkFailure(FailureSignal::new("boom"));
        assert_eq!(msg.class(), MessageClass::Terminal);
        assert_eq!(
            BenchmarkMessage::BenchmarkCancelled.class(),
            MessageClass::Terminal
        );
        assert_eq!(BenchmarkMessage::EngineStopped.class(), MessageClass::Reply);
    }
}
