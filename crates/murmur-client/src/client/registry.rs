// Registry of live subscription configurations, keyed by
// "topic:subscription". Written once per subscribe, read by every dispatch so
// a re-subscribe governs the very next decision. Entries are never removed;
// they live as long as the client.
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::client::retry::AckMode;
use crate::client::subscription::MessageListener;
use crate::codec::Codec;

pub struct SubscriptionEntry {
    pub topic: String,
    pub subscription_name: String,
    pub ack_mode: AckMode,
    /// Normalized at subscribe time (zero becomes the default) but clamped
    /// only at decision time.
    pub retry_limit: u32,
    pub listener: Arc<dyn MessageListener>,
    pub codec: Arc<dyn Codec>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Arc<SubscriptionEntry>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(topic: &str, subscription_name: &str) -> String {
        format!("{topic}:{subscription_name}")
    }

    /// Last write wins; a second subscribe with the same key replaces the
    /// stored configuration wholesale.
    pub fn store(&self, entry: Arc<SubscriptionEntry>) {
        let key = Self::key(&entry.topic, &entry.subscription_name);
        self.entries.write().insert(key, entry);
    }

    pub fn lookup(
        &self,
        topic: &str,
        subscription_name: &str,
    ) -> Option<Arc<SubscriptionEntry>> {
        self.entries
            .read()
            .get(&Self::key(topic, subscription_name))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::subscription::InboundMessage;
    use crate::codec::JsonStringCodec;

    struct NoopListener;

    #[async_trait::async_trait]
    impl MessageListener for NoopListener {
        async fn on_message(&self, _message: InboundMessage) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn entry(topic: &str, subscription: &str, retry_limit: u32) -> Arc<SubscriptionEntry> {
        Arc::new(SubscriptionEntry {
            topic: topic.into(),
            subscription_name: subscription.into(),
            ack_mode: AckMode::AckWithRetry,
            retry_limit,
            listener: Arc::new(NoopListener),
            codec: Arc::new(JsonStringCodec),
        })
    }

    #[test]
    fn lookup_misses_unknown_keys() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.lookup("orders", "audit").is_none());
    }

    #[test]
    fn store_is_last_write_wins() {
        let registry = SubscriptionRegistry::new();
        registry.store(entry("orders", "audit", 5));
        registry.store(entry("orders", "audit", 9));
        let current = registry.lookup("orders", "audit").expect("entry");
        assert_eq!(current.retry_limit, 9);
    }

    #[test]
    fn keys_are_scoped_by_topic_and_subscription() {
        let registry = SubscriptionRegistry::new();
        registry.store(entry("orders", "audit", 1));
        registry.store(entry("invoices", "audit", 2));
        registry.store(entry("orders", "billing", 3));
        assert_eq!(registry.lookup("orders", "audit").expect("a").retry_limit, 1);
        assert_eq!(
            registry.lookup("invoices", "audit").expect("b").retry_limit,
            2
        );
        assert_eq!(
            registry.lookup("orders", "billing").expect("c").retry_limit,
            3
        );
    }
}
