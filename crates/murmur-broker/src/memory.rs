// In-process broker used by tests, examples, and single-process embeddings.
// Every subscription receives each message published while it exists; the
// subscription type controls which consumer inside the subscription gets it.
// Nacked messages are redelivered after the consumer's nack delay with an
// incremented redelivery count. Messages stay pending until acked.
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

use crate::{
    BrokerConnection, BrokerConnector, BrokerConsumer, BrokerError, ConnectOptions,
    ConsumerRequest, Delivery, MessageId, Result, SendOptions, SubscriptionType,
};

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: Mutex<HashMap<String, TopicState>>,
    closed: AtomicBool,
    producer_seq: AtomicU64,
}

#[derive(Debug, Default)]
struct TopicState {
    next_seq: u64,
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Debug)]
struct SubscriptionState {
    subscription_type: SubscriptionType,
    // Live consumer channels; closed senders are pruned on use.
    consumers: Vec<mpsc::Sender<Delivery>>,
    rr: usize,
    // Delivered-but-unacked message ids.
    pending: HashSet<MessageId>,
}

impl SubscriptionState {
    fn new(subscription_type: SubscriptionType) -> Self {
        Self {
            subscription_type,
            consumers: Vec::new(),
            rr: 0,
            pending: HashSet::new(),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of delivered-but-unacked messages for one subscription.
    pub fn pending_count(&self, topic: &str, subscription_name: &str) -> usize {
        let topics = self.state.topics.lock();
        topics
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription_name))
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }

    /// Number of live consumers attached to one subscription.
    pub fn consumer_count(&self, topic: &str, subscription_name: &str) -> usize {
        let topics = self.state.topics.lock();
        topics
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription_name))
            .map(|s| s.consumers.iter().filter(|c| !c.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn BrokerConnection>> {
        if options.service_url.is_empty() {
            return Err(BrokerError::Connect("service url is empty".into()));
        }
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let producer_seq = self.state.producer_seq.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(url = %options.service_url, "in-process broker connection opened");
        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            producer_name: format!("producer-{producer_seq}"),
        }))
    }
}

#[derive(Debug)]
struct MemoryConnection {
    state: Arc<BrokerState>,
    producer_name: String,
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    async fn subscribe(
        &self,
        request: ConsumerRequest,
        deliveries: mpsc::Sender<Delivery>,
    ) -> Result<Arc<dyn BrokerConsumer>> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        {
            let mut topics = self.state.topics.lock();
            let topic = topics.entry(request.topic.clone()).or_default();
            let subscription = topic
                .subscriptions
                .entry(request.subscription_name.clone())
                .or_insert_with(|| SubscriptionState::new(request.subscription_type));
            subscription.consumers.retain(|c| !c.is_closed());
            let exclusive = subscription.subscription_type == SubscriptionType::Exclusive
                || request.subscription_type == SubscriptionType::Exclusive;
            if exclusive && !subscription.consumers.is_empty() {
                return Err(BrokerError::SubscribeRejected {
                    topic: request.topic.clone(),
                    subscription: request.subscription_name.clone(),
                    reason: "exclusive subscription already has a consumer".into(),
                });
            }
            subscription.subscription_type = request.subscription_type;
            subscription.consumers.push(deliveries);
        }
        tracing::debug!(
            topic = %request.topic,
            subscription = %request.subscription_name,
            consumer = %request.consumer_name,
            "consumer attached"
        );
        Ok(Arc::new(MemoryConsumer {
            state: Arc::clone(&self.state),
            topic: request.topic,
            subscription_name: request.subscription_name,
            nack_delay: request.nack_redelivery_delay,
        }))
    }

    async fn send(&self, topic: &str, payload: Bytes, options: SendOptions) -> Result<MessageId> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let seq = {
            let mut topics = self.state.topics.lock();
            let topic_state = topics.entry(topic.to_string()).or_default();
            let seq = topic_state.next_seq;
            topic_state.next_seq += 1;
            seq
        };
        let id = MessageId::new(topic, seq);
        let publish_time = SystemTime::now();
        let delay = options.deliver_after.or_else(|| {
            options
                .deliver_at
                .and_then(|at| at.duration_since(SystemTime::now()).ok())
        });
        match delay {
            Some(delay) if !delay.is_zero() => {
                let state = Arc::clone(&self.state);
                let topic = topic.to_string();
                let producer_name = self.producer_name.clone();
                let deferred = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    fan_out(&state, &topic, deferred, payload, producer_name, publish_time).await;
                });
            }
            _ => {
                fan_out(
                    &self.state,
                    topic,
                    id.clone(),
                    payload,
                    self.producer_name.clone(),
                    publish_time,
                )
                .await;
            }
        }
        Ok(id)
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        // Dropping the topic map drops every delivery sender, which ends the
        // consumer streams.
        let dropped = {
            let mut topics = self.state.topics.lock();
            std::mem::take(&mut *topics)
        };
        drop(dropped);
        tracing::debug!("in-process broker connection closed");
    }
}

async fn fan_out(
    state: &Arc<BrokerState>,
    topic: &str,
    id: MessageId,
    payload: Bytes,
    producer_name: String,
    publish_time: SystemTime,
) {
    let subscription_names: Vec<String> = {
        let topics = state.topics.lock();
        match topics.get(topic) {
            Some(topic_state) => topic_state.subscriptions.keys().cloned().collect(),
            None => return,
        }
    };
    for subscription_name in subscription_names {
        let delivery = Delivery {
            id: id.clone(),
            topic: topic.to_string(),
            subscription_name,
            producer_name: producer_name.clone(),
            payload: payload.clone(),
            redelivery_count: 0,
            publish_time,
        };
        deliver(state, delivery).await;
    }
}

async fn deliver(state: &Arc<BrokerState>, delivery: Delivery) {
    // Pick the target consumer under the lock, then push outside of it so a
    // full channel blocks only this delivery.
    let sender = {
        let mut topics = state.topics.lock();
        let subscription = match topics
            .get_mut(&delivery.topic)
            .and_then(|t| t.subscriptions.get_mut(&delivery.subscription_name))
        {
            Some(subscription) => subscription,
            None => return,
        };
        subscription.consumers.retain(|c| !c.is_closed());
        if subscription.consumers.is_empty() {
            return;
        }
        let index = match subscription.subscription_type {
            SubscriptionType::Exclusive | SubscriptionType::Failover => 0,
            // No per-message key on this surface; key-shared falls back to
            // shared round-robin.
            SubscriptionType::Shared | SubscriptionType::KeyShared => {
                let index = subscription.rr % subscription.consumers.len();
                subscription.rr = subscription.rr.wrapping_add(1);
                index
            }
        };
        subscription.pending.insert(delivery.id.clone());
        subscription.consumers[index].clone()
    };
    if let Err(err) = sender.send(delivery).await {
        let lost = err.0;
        let mut topics = state.topics.lock();
        if let Some(subscription) = topics
            .get_mut(&lost.topic)
            .and_then(|t| t.subscriptions.get_mut(&lost.subscription_name))
        {
            subscription.pending.remove(&lost.id);
        }
    }
}

#[derive(Debug)]
struct MemoryConsumer {
    state: Arc<BrokerState>,
    topic: String,
    subscription_name: String,
    nack_delay: Duration,
}

#[async_trait::async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn ack(&self, delivery: &Delivery) {
        let mut topics = self.state.topics.lock();
        if let Some(subscription) = topics
            .get_mut(&self.topic)
            .and_then(|t| t.subscriptions.get_mut(&self.subscription_name))
        {
            subscription.pending.remove(&delivery.id);
        }
    }

    async fn nack(&self, delivery: &Delivery) {
        {
            let mut topics = self.state.topics.lock();
            if let Some(subscription) = topics
                .get_mut(&self.topic)
                .and_then(|t| t.subscriptions.get_mut(&self.subscription_name))
            {
                subscription.pending.remove(&delivery.id);
            }
        }
        let state = Arc::clone(&self.state);
        let delay = self.nack_delay;
        let redelivery = Delivery {
            redelivery_count: delivery.redelivery_count + 1,
            ..delivery.clone()
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            deliver(&state, redelivery).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn connect_options() -> ConnectOptions {
        ConnectOptions {
            service_url: "memory://local".into(),
            connection_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
            max_connections_per_broker: 1,
        }
    }

    fn consumer_request(
        topic: &str,
        subscription: &str,
        subscription_type: SubscriptionType,
    ) -> ConsumerRequest {
        ConsumerRequest {
            topic: topic.into(),
            subscription_name: subscription.into(),
            subscription_type,
            consumer_name: format!("{subscription}-consumer"),
            nack_redelivery_delay: Duration::from_millis(10),
        }
    }

    async fn recv(
        rx: &mut mpsc::Receiver<Delivery>,
    ) -> Delivery {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("delivery timeout")
            .expect("delivery stream ended")
    }

    #[tokio::test]
    async fn connect_with_empty_url_is_rejected() {
        let broker = MemoryBroker::new();
        let mut options = connect_options();
        options.service_url = String::new();
        let err = broker.connect(options).await.expect_err("connect");
        assert!(matches!(err, BrokerError::Connect(_)));
    }

    #[tokio::test]
    async fn shared_subscription_round_robins_across_consumers() {
        let broker = MemoryBroker::new();
        let connection = broker.connect(connect_options()).await.expect("connect");
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        connection
            .subscribe(consumer_request("orders", "workers", SubscriptionType::Shared), tx_a)
            .await
            .expect("subscribe a");
        connection
            .subscribe(consumer_request("orders", "workers", SubscriptionType::Shared), tx_b)
            .await
            .expect("subscribe b");
        for payload in [&b"one"[..], b"two"] {
            connection
                .send("orders", Bytes::from_static(payload), SendOptions::default())
                .await
                .expect("send");
        }
        let first = recv(&mut rx_a).await;
        let second = recv(&mut rx_b).await;
        assert_eq!(first.payload, Bytes::from_static(b"one"));
        assert_eq!(second.payload, Bytes::from_static(b"two"));
        assert_eq!(broker.pending_count("orders", "workers"), 2);
    }

    #[tokio::test]
    async fn exclusive_subscription_rejects_second_consumer() {
        let broker = MemoryBroker::new();
        let connection = broker.connect(connect_options()).await.expect("connect");
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);
        connection
            .subscribe(
                consumer_request("orders", "solo", SubscriptionType::Exclusive),
                tx_a,
            )
            .await
            .expect("first consumer");
        let err = connection
            .subscribe(
                consumer_request("orders", "solo", SubscriptionType::Exclusive),
                tx_b,
            )
            .await
            .expect_err("second consumer");
        assert!(matches!(err, BrokerError::SubscribeRejected { .. }));
        assert_eq!(broker.consumer_count("orders", "solo"), 1);
    }

    #[tokio::test]
    async fn nack_redelivers_with_incremented_count_and_same_id() {
        let broker = MemoryBroker::new();
        let connection = broker.connect(connect_options()).await.expect("connect");
        let (tx, mut rx) = mpsc::channel(8);
        let consumer = connection
            .subscribe(
                consumer_request("orders", "retrier", SubscriptionType::Shared),
                tx,
            )
            .await
            .expect("subscribe");
        connection
            .send("orders", Bytes::from_static(b"flaky"), SendOptions::default())
            .await
            .expect("send");
        let first = recv(&mut rx).await;
        assert_eq!(first.redelivery_count, 0);
        consumer.nack(&first).await;
        let second = recv(&mut rx).await;
        assert_eq!(second.redelivery_count, 1);
        assert_eq!(second.id, first.id);
        consumer.ack(&second).await;
        assert_eq!(broker.pending_count("orders", "retrier"), 0);
    }

    #[tokio::test]
    async fn delayed_send_defers_visibility() {
        let broker = MemoryBroker::new();
        let connection = broker.connect(connect_options()).await.expect("connect");
        let (tx, mut rx) = mpsc::channel(8);
        connection
            .subscribe(
                consumer_request("orders", "later", SubscriptionType::Shared),
                tx,
            )
            .await
            .expect("subscribe");
        connection
            .send(
                "orders",
                Bytes::from_static(b"deferred"),
                SendOptions {
                    deliver_after: Some(Duration::from_millis(500)),
                    deliver_at: None,
                },
            )
            .await
            .expect("send");
        assert!(
            timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
            "delayed message arrived early"
        );
        let delivery = recv(&mut rx).await;
        assert_eq!(delivery.payload, Bytes::from_static(b"deferred"));
    }

    #[tokio::test]
    async fn close_ends_delivery_streams_and_fails_sends() {
        let broker = MemoryBroker::new();
        let connection = broker.connect(connect_options()).await.expect("connect");
        let (tx, mut rx) = mpsc::channel(8);
        connection
            .subscribe(
                consumer_request("orders", "doomed", SubscriptionType::Shared),
                tx,
            )
            .await
            .expect("subscribe");
        connection.close().await;
        let ended = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("stream should end");
        assert!(ended.is_none());
        let err = connection
            .send("orders", Bytes::from_static(b"late"), SendOptions::default())
            .await
            .expect_err("send after close");
        assert!(matches!(err, BrokerError::Closed));
    }
}
