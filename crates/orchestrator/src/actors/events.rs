//! Progress reporting handle given to the worker coordinator.

use std::time::Duration;

use ractor::ActorRef;

use crate::results::MetricRecord;

use super::errors::{ActorError, FailureSignal};
use super::messages::BenchmarkMessage;
use crate::messaging::deliver;

/// Sends worker coordinator progress to the benchmark orchestrator.
#[derive(Clone)]
pub struct CoordinatorEvents {
    target: ActorRef<BenchmarkMessage>,
}

impl std::fmt::Debug for CoordinatorEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorEvents")
            .field("target", &self.target.get_id())
            .finish()
    }
}

impl CoordinatorEvents {
    #[must_use]
    pub fn new(target: ActorRef<BenchmarkMessage>) -> Self {
        Self { target }
    }

    /// The workload is prepared on all load generators.
    ///
    /// # Errors
    ///
    /// Never fails; replies are retryable and only logged when undeliverable.
    pub fn preparation_complete(
        &self,
        distribution_flavor: impl Into<String>,
        distribution_version: Option<String>,
        revision: Option<String>,
    ) -> Result<(), ActorError> {
        deliver(
            &self.target,
            BenchmarkMessage::PreparationComplete {
                distribution_flavor: distribution_flavor.into(),
                distribution_version,
                revision,
            },
        )
    }

    /// One task finished. The next one starts after `next_task_scheduled_in`.
    ///
    /// # Errors
    ///
    /// Never fails; see [`Self::preparation_complete`].
    pub fn task_finished(
        &self,
        metrics: Vec<MetricRecord>,
        next_task_scheduled_in: Duration,
    ) -> Result<(), ActorError> {
        deliver(
            &self.target,
            BenchmarkMessage::TaskFinished {
                metrics,
                next_task_scheduled_in,
            },
        )
    }

    /// # Errors
    ///
    /// Never fails; see [`Self::preparation_complete`].
    pub fn benchmark_complete(&self, metrics: Vec<MetricRecord>) -> Result<(), ActorError> {
        deliver(&self.target, BenchmarkMessage::BenchmarkComplete { metrics })
    }

    /// # Errors
    ///
    /// Never fails; see [`Self::preparation_complete`].
    pub fn failure(&self, failure: FailureSignal) -> Result<(), ActorError> {
        deliver(&self.target, BenchmarkMessage::BenchmarkFailure(failure))
    }

    /// # Errors
    ///
    /// Never fails; see [`Self::preparation_complete`].
    pub fn cancelled(&self) -> Result<(), ActorError> {
        deliver(&self.target, BenchmarkMessage::BenchmarkCancelled)
    }
}
