//! Response aggregation for fan-out transitions.

use std::hash::Hash;

use im::HashSet;

/// What recording a response did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// First response from this responder.
    New,
    /// This responder already answered.
    Duplicate,
    /// The set is already full; the response was ignored.
    Excess,
}

/// Set of responders plus a target cardinality fixed at fan-out.
///
/// Responses may arrive in any order; each responder counts once.
#[derive(Debug, Clone)]
pub struct PendingResponses<K: Hash + Eq + Clone> {
    expected: usize,
    responded: HashSet<K>,
}

impl<K: Hash + Eq + Clone> PendingResponses<K> {
    #[must_use]
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            responded: HashSet::new(),
        }
    }

    pub fn record(&mut self, responder: K) -> Recorded {
        if self.responded.contains(&responder) {
            Recorded::Duplicate
        } else if self.is_complete() {
            Recorded::Excess
        } else {
            self.responded.insert(responder);
            Recorded::New
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.responded.len() >= self.expected
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.expected.saturating_sub(self.responded.len())
    }

    #[must_use]
    pub fn expected(&self) -> usize {
        self.expected
    }

    #[must_use]
    pub fn has_responded(&self, responder: &K) -> bool {
        self.responded.contains(responder)
    }
}
