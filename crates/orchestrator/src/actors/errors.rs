//! Engine error taxonomy and the failure signal that travels between actors.
//!
//! `ActorError` values are returned from spawn helpers and public entry
//! points. Inside the actor tree every error is flattened into a
//! [`FailureSignal`] before it is sent upward, so a failure crosses actor
//! boundaries as plain data and never as a crash.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the orchestration engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActorError {
    /// A precondition was violated before any side effect took place.
    #[error("System setup error: {0}")]
    SystemSetup(String),

    /// The cluster could not be launched at all.
    #[error("Launch error: {0}")]
    Launch(String),

    /// A stage on one host failed while preparing or starting nodes.
    #[error("Could not {stage} on host [{host}]: {reason}")]
    Provisioning {
        host: String,
        stage: String,
        reason: String,
    },

    /// A non-retryable message could not be handed to its receiver.
    #[error("Could not deliver [{message_kind}] to [{target}]")]
    DeliveryFailure {
        message_kind: String,
        target: String,
    },

    /// Failed to spawn an actor.
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    /// Internal invariant violated by a caller.
    #[error("Assertion failed: {0}")]
    Assertion(String),

    /// The benchmark ended in failure.
    #[error("{message}")]
    BenchmarkFailed { message: String, cause: Vec<String> },

    /// Configuration could not be read.
    #[error("Configuration error: {0}")]
    Config(String),

    /// RPC call timed out.
    #[error("RPC timeout after {0:?}")]
    RpcTimeout(Duration),

    /// The actor is not available (stopped or not started).
    #[error("Actor not available")]
    ActorUnavailable,
}

impl ActorError {
    /// Create a system setup error.
    pub fn system_setup(msg: impl Into<String>) -> Self {
        Self::SystemSetup(msg.into())
    }

    /// Create a launch error.
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    /// Create a provisioning error for a stage on a host.
    pub fn provisioning(
        host: impl Into<String>,
        stage: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Provisioning {
            host: host.into(),
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Create a delivery failure error.
    pub fn delivery_failure(message_kind: impl Into<String>, target: impl Into<String>) -> Self {
        Self::DeliveryFailure {
            message_kind: message_kind.into(),
            target: target.into(),
        }
    }

    /// Create a spawn failure error.
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }

    /// Create an assertion error.
    pub fn assertion(msg: impl Into<String>) -> Self {
        Self::Assertion(msg.into())
    }

    /// Create an RPC timeout error.
    pub fn rpc_timeout(duration: Duration) -> Self {
        Self::RpcTimeout(duration)
    }
}

impl From<benchrig_core::Error> for ActorError {
    fn from(e: benchrig_core::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// A fatal failure on its way up the actor tree.
///
/// `cause` holds the rendered error chain, outermost first. Signals are
/// forwarded unchanged; no ancestor rewrites or retries them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignal {
    pub message: String,
    pub cause: Vec<String>,
}

impl FailureSignal {
    /// A failure without an underlying cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: Vec::new(),
        }
    }

    /// Attach an already rendered cause chain.
    #[must_use]
    pub fn with_cause(mut self, cause: Vec<String>) -> Self {
        self.cause = cause;
        self
    }

    /// Wrap an error, keeping its full `source()` chain as the cause.
    pub fn from_error(message: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            message: message.into(),
            cause: error.chain().map(ToString::to_string).collect(),
        }
    }

    /// Turn an engine error into a signal.
    #[must_use]
    pub fn from_actor_error(error: &ActorError) -> Self {
        match error {
            ActorError::BenchmarkFailed { message, cause } => Self {
                message: message.clone(),
                cause: cause.clone(),
            },
            other => Self::new(other.to_string()),
        }
    }
}

impl fmt::Display for FailureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cause.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} (caused by: {})", self.message, self.cause.join(": "))
        }
    }
}

impl From<FailureSignal> for ActorError {
    fn from(signal: FailureSignal) -> Self {
        Self::BenchmarkFailed {
            message: signal.message,
            cause: signal.cause,
        }
    }
}
