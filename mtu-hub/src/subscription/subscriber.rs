//! Subscriber identity: the registry of connected applications, each holding
//! a unique reference-number prefix and its negotiated [`SubscriptionPolicy`].

use std::sync::Arc;

use dashmap::DashMap;
use mtu_shared::model::{IecMsg, SubscriptionPolicy};
use mtu_shared::resilience::SubscriberPrefixRegistry;
use tokio::sync::mpsc;

/// Everything the hub needs to know about one connected subscriber.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    pub subscriber_id: String,
    pub policy: SubscriptionPolicy,
    pub outbox: mpsc::UnboundedSender<IecMsg>,
}

/// Registry of every currently-connected subscriber, keyed by its assigned
/// reference-number prefix.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    prefixes: SubscriberPrefixRegistry,
    subscribers: DashMap<String, SubscriberHandle>,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Completes the handshake: assigns a unique prefix derived from the
    /// subscriber's requested one and registers its outbox for publication.
    pub fn register(
        &self,
        requested_prefix: &str,
        policy: SubscriptionPolicy,
        outbox: mpsc::UnboundedSender<IecMsg>,
    ) -> Option<String> {
        let subscriber_id = self.prefixes.assign(requested_prefix)?;
        self.subscribers.insert(
            subscriber_id.clone(),
            SubscriberHandle {
                subscriber_id: subscriber_id.clone(),
                policy,
                outbox,
            },
        );
        Some(subscriber_id)
    }

    pub fn deregister(&self, subscriber_id: &str) {
        self.subscribers.remove(subscriber_id);
        self.prefixes.release(subscriber_id);
    }

    #[must_use]
    pub fn get(&self, subscriber_id: &str) -> Option<SubscriberHandle> {
        self.subscribers.get(subscriber_id).map(|s| s.clone())
    }

    /// Publishes a message to every registered subscriber whose policy
    /// accepts it, skipping subscribers whose channel has already closed.
    pub fn broadcast(&self, msg: &IecMsg, accepts: impl Fn(&SubscriptionPolicy, &IecMsg) -> bool) {
        for entry in self.subscribers.iter() {
            if accepts(&entry.policy, msg) {
                let _ = entry.outbox.send(msg.clone());
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtu_shared::model::{Confirmation, IecMsg};

    #[test]
    fn register_assigns_and_deregister_frees_prefix() {
        let registry = SubscriberRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry
            .register("HMI", SubscriptionPolicy::default(), tx)
            .unwrap();
        assert_eq!(id, "HMI");
        assert_eq!(registry.len(), 1);

        registry.deregister(&id);
        assert!(registry.is_empty());

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let id2 = registry
            .register("HMI", SubscriptionPolicy::default(), tx2)
            .unwrap();
        assert_eq!(id2, "HMI");
    }

    #[test]
    fn broadcast_respects_the_accepts_predicate() {
        let registry = SubscriberRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("HMI", SubscriptionPolicy::default(), tx);

        let msg = IecMsg::Confirmation(Confirmation::successful_send("MTU_1", 0));
        registry.broadcast(&msg, |_, _| false);
        assert!(rx.try_recv().is_err());

        registry.broadcast(&msg, |_, _| true);
        assert!(rx.try_recv().is_ok());
    }
}
