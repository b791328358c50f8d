//! Child monitoring.
//!
//! A parent spawns a child, then hands its join handle to [`supervise`]. A
//! monitor task awaits the handle, marks the child as exited, and reports a
//! [`ChildExit`] to the parent. The returned [`Supervised`] lets the parent
//! stop the child and wait until it has fully released its resources.

use std::time::Duration;

use futures::future::join_all;
use ractor::{ActorId, ActorRef};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::messages::{ChildExit, ChildRole};

/// Handle to a monitored child actor.
pub struct Supervised<M> {
    actor: ActorRef<M>,
    role: ChildRole,
    exited: watch::Receiver<bool>,
}

impl<M: ractor::Message> Clone for Supervised<M> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            role: self.role,
            exited: self.exited.clone(),
        }
    }
}

impl<M: ractor::Message> std::fmt::Debug for Supervised<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervised")
            .field("id", &self.actor.get_id())
            .field("role", &self.role)
            .field("exited", &*self.exited.borrow())
            .finish()
    }
}

impl<M: ractor::Message> Supervised<M> {
    #[must_use]
    pub fn actor(&self) -> &ActorRef<M> {
        &self.actor
    }

    #[must_use]
    pub fn id(&self) -> ActorId {
        self.actor.get_id()
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Request a stop without waiting.
    pub fn stop(&self, reason: &str) {
        if !self.has_exited() {
            self.actor.stop(Some(reason.to_string()));
        }
    }

    /// Wait until the child has exited. Returns `false` on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut exited = self.exited.clone();
        matches!(
            tokio::time::timeout(timeout, exited.wait_for(|done| *done)).await,
            Ok(Ok(_))
        )
    }

    /// Stop the child and wait for it to exit.
    pub async fn stop_and_wait(&self, reason: &str, timeout: Duration) -> bool {
        self.stop(reason);
        let stopped = self.wait(timeout).await;
        if !stopped {
            warn!(child = %self.id(), role = %self.role, timeout_ms = timeout.as_millis(), "Child did not stop in time");
        }
        stopped
    }
}

/// Monitor a freshly spawned child.
///
/// `notify` runs once after the child terminated, for any reason.
pub fn supervise<M, F>(
    actor: ActorRef<M>,
    handle: JoinHandle<()>,
    role: ChildRole,
    notify: F,
) -> Supervised<M>
where
    M: ractor::Message,
    F: FnOnce(ChildExit) + Send + 'static,
{
    let (exited_tx, exited_rx) = watch::channel(false);
    let id = actor.get_id();
    tokio::spawn(async move {
        let reason = match handle.await {
            Ok(()) => "actor exited".to_string(),
            Err(e) if e.is_panic() => format!("actor panicked: {e}"),
            Err(e) => format!("actor task failed: {e}"),
        };
        let _ = exited_tx.send(true);
        debug!(child = %id, role = %role, reason = %reason, "Child exited");
        notify(ChildExit { id, role, reason });
    });
    Supervised {
        actor,
        role,
        exited: exited_rx,
    }
}

/// Stop all children concurrently and wait for each of them.
///
/// Returns how many stopped within `timeout`.
pub async fn stop_all_and_wait<M: ractor::Message>(
    children: &[Supervised<M>],
    reason: &str,
    timeout: Duration,
) -> usize {
    join_all(
        children
            .iter()
            .map(|child| child.stop_and_wait(reason, timeout)),
    )
    .await
    .into_iter()
    .filter(|stopped| *stopped)
    .count()
}
