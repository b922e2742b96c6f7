//! Reference-number allocation: hub-initiated counters and subscriber prefix
//! collision resolution, mirroring the handshake algorithm of the command server.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;

use crate::model::message::MTU_REFERENCE_PREFIX;

/// Generates the monotonic `MTU_<n>` reference numbers used for hub-initiated
/// messages (periodic updates, spontaneous transitions, general interrogation
/// replies the hub itself triggers).
#[derive(Debug, Default)]
pub struct MtuReferenceAllocator {
    counter: AtomicU64,
}

impl MtuReferenceAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next hub-initiated reference number. Increments exactly
    /// once per call, so two concurrent callers never observe the same value.
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{MTU_REFERENCE_PREFIX}_{n}")
    }
}

/// Assigns each subscriber a unique reference-number prefix at handshake
/// time. A subscriber requests a human-readable prefix (its application
/// type, e.g. `"HMI"`); if that prefix is already taken the registry appends
/// an incrementing suffix (`HMI_2`, `HMI_3`, ...) until it finds a free one.
/// The `MTU` prefix itself is always rejected: it is reserved for hub-initiated
/// messages.
#[derive(Debug, Default)]
pub struct SubscriberPrefixRegistry {
    assigned: DashSet<String>,
}

impl SubscriberPrefixRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a prefix derived from `requested`, resolving collisions by
    /// suffixing an incrementing counter. Returns `None` if `requested` is
    /// the reserved `MTU` prefix.
    pub fn assign(&self, requested: &str) -> Option<String> {
        if requested.eq_ignore_ascii_case(MTU_REFERENCE_PREFIX) || requested.is_empty() {
            return None;
        }
        if self.assigned.insert(requested.to_string()) {
            return Some(requested.to_string());
        }
        let mut suffix = 2u64;
        loop {
            let candidate = format!("{requested}_{suffix}");
            if self.assigned.insert(candidate.clone()) {
                return Some(candidate);
            }
            suffix += 1;
        }
    }

    pub fn release(&self, prefix: &str) {
        self.assigned.remove(prefix);
    }
}
