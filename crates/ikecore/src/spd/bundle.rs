//! Outbound bundles
//!
//! A bundle caches, under one policy, the outbound SAs protecting one
//! distinct packet selector. Bundles are created on the first lookup miss
//! and expire with a lifetime timer owned by the policy database.

use tokio::time::Instant;

use super::selector::Selector;

/// Cached selector to SA set binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBundle {
    /// Timer subject identifying this bundle
    pub id: u64,
    /// Packet selector that created the bundle
    pub selector: Selector,
    /// Outbound SA index per policy security entry, 0 when unresolved
    pub sa_indexes: Vec<u32>,
    /// SA requests are not repeated before this instant
    pub sa_request_deadline: Option<Instant>,
}

impl OutboundBundle {
    /// Create an unresolved bundle for `count` security entries
    pub fn new(id: u64, selector: Selector, count: usize) -> Self {
        OutboundBundle {
            id,
            selector,
            sa_indexes: vec![0; count],
            sa_request_deadline: None,
        }
    }

    /// Whether every security entry has a cached SA
    pub fn is_complete(&self) -> bool {
        self.sa_indexes.iter().all(|&index| index != 0)
    }

    /// Whether an SA request may be raised at `now`
    pub fn may_request(&self, now: Instant) -> bool {
        self.sa_request_deadline.map_or(true, |deadline| now >= deadline)
    }

    /// Forget a cached SA index everywhere it appears
    pub fn forget_sa(&mut self, index: u32) {
        for cached in self.sa_indexes.iter_mut().filter(|cached| **cached == index) {
            *cached = 0;
        }
    }
}
