//! Host membership feed.
//!
//! Remote node builders can only be started once their host has joined.
//! The feed publishes `{address, became_reachable}` events over a
//! broadcast channel and remembers which hosts are currently reachable so a
//! late subscriber does not miss hosts that joined before it subscribed.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

/// Default buffer size of the broadcast channel.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// A host joined or left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAvailability {
    pub address: IpAddr,
    pub became_reachable: bool,
}

impl HostAvailability {
    #[must_use]
    pub fn reachable(address: IpAddr) -> Self {
        Self {
            address,
            became_reachable: true,
        }
    }

    #[must_use]
    pub fn unreachable(address: IpAddr) -> Self {
        Self {
            address,
            became_reachable: false,
        }
    }
}

/// Snapshot plus stream of changes, taken atomically.
#[derive(Debug)]
pub struct MembershipSubscription {
    /// Hosts already reachable when the subscription was created.
    pub reachable: Vec<IpAddr>,
    pub updates: broadcast::Receiver<HostAvailability>,
}

/// Source of host membership changes, consumed read-only.
pub trait DiscoveryFeed: Send + Sync {
    fn subscribe(&self) -> MembershipSubscription;

    /// Hosts currently reachable.
    fn reachable(&self) -> Vec<IpAddr>;
}

struct FeedInner {
    sender: broadcast::Sender<HostAvailability>,
    reachable: Mutex<BTreeSet<IpAddr>>,
    subscriptions: AtomicUsize,
}

/// In-process membership feed.
#[derive(Clone)]
pub struct MembershipFeed {
    inner: Arc<FeedInner>,
}

impl std::fmt::Debug for MembershipFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipFeed")
            .field("reachable", &self.reachable())
            .field("subscriptions_created", &self.subscriptions_created())
            .finish()
    }
}

impl Default for MembershipFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(FeedInner {
                sender,
                reachable: Mutex::new(BTreeSet::new()),
                subscriptions: AtomicUsize::new(0),
            }),
        }
    }

    /// Record a membership change and notify subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: HostAvailability) -> usize {
        let mut reachable = self
            .inner
            .reachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if event.became_reachable {
            reachable.insert(event.address);
        } else {
            reachable.remove(&event.address);
        }
        let receivers = self.inner.sender.send(event).unwrap_or(0);
        debug!(address = %event.address, reachable = event.became_reachable, receivers, "Published host membership change");
        receivers
    }

    /// How many subscriptions were ever created.
    #[must_use]
    pub fn subscriptions_created(&self) -> usize {
        self.inner.subscriptions.load(Ordering::SeqCst)
    }
}

impl DiscoveryFeed for MembershipFeed {
    fn subscribe(&self) -> MembershipSubscription {
        // Hold the lock so no event falls between snapshot and receiver.
        let reachable = self
            .inner
            .reachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let updates = self.inner.sender.subscribe();
        self.inner.subscriptions.fetch_add(1, Ordering::SeqCst);
        MembershipSubscription {
            reachable: reachable.iter().copied().collect(),
            updates,
        }
    }

    fn reachable(&self) -> Vec<IpAddr> {
        self.inner
            .reachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}
