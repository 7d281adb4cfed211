// Broker capability surface shared by the messaging client and broker
// implementations. The client never speaks a wire protocol itself; it drives
// a `BrokerConnection` and receives deliveries over a bounded channel that it
// hands to `subscribe`.
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

pub mod memory;

pub use memory::MemoryBroker;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("broker connect failed: {0}")]
    Connect(String),
    #[error("subscribe rejected: topic={topic} subscription={subscription}: {reason}")]
    SubscribeRejected {
        topic: String,
        subscription: String,
        reason: String,
    },
    #[error("send failed: topic={topic}: {reason}")]
    SendFailed { topic: String, reason: String },
    #[error("broker connection closed")]
    Closed,
}

/// Broker-side fan-out policy among consumers sharing one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    Exclusive,
    Shared,
    Failover,
    KeyShared,
}

/// Identifier assigned by the broker when a message is accepted.
///
/// Stable across redeliveries of the same message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    topic: String,
    seq: u64,
}

impl MessageId {
    pub fn new(topic: impl Into<String>, seq: u64) -> Self {
        Self {
            topic: topic.into(),
            seq,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.seq)
    }
}

/// One message handed to a consumer. Read-only on the consuming side; the
/// broker takes back ownership once it is acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: MessageId,
    pub topic: String,
    pub subscription_name: String,
    pub producer_name: String,
    pub payload: Bytes,
    pub redelivery_count: u32,
    pub publish_time: SystemTime,
}

/// Broker-side publish options. `deliver_after`/`deliver_at` defer visibility
/// to consumers; ordering relative to undelayed messages is broker-defined.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub deliver_after: Option<Duration>,
    pub deliver_at: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub service_url: String,
    pub connection_timeout: Duration,
    pub operation_timeout: Duration,
    pub max_connections_per_broker: usize,
}

#[derive(Debug, Clone)]
pub struct ConsumerRequest {
    pub topic: String,
    pub subscription_name: String,
    pub subscription_type: SubscriptionType,
    pub consumer_name: String,
    /// Delay before a nacked message becomes visible again.
    pub nack_redelivery_delay: Duration,
}

/// Factory for broker connections. Implementations decide what the service
/// URL means and how timeouts are enforced.
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn BrokerConnection>>;
}

/// One established broker connection, shared by producers and consumers.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + fmt::Debug {
    /// Open a consumer on `request.topic`. Deliveries are pushed into
    /// `deliveries`; the broker blocks on a full channel, which is the only
    /// throttle on consumption rate. Dropping the receiver ends the stream.
    async fn subscribe(
        &self,
        request: ConsumerRequest,
        deliveries: mpsc::Sender<Delivery>,
    ) -> Result<Arc<dyn BrokerConsumer>>;

    /// Publish one message and wait for the broker to accept it.
    async fn send(&self, topic: &str, payload: Bytes, options: SendOptions) -> Result<MessageId>;

    /// Release the connection. Behavior of in-flight consumers and later
    /// sends is implementation-defined beyond "they stop succeeding".
    async fn close(&self);
}

/// Ack surface for one consumer. Exactly one of `ack`/`nack` is expected per
/// delivery.
#[async_trait::async_trait]
pub trait BrokerConsumer: Send + Sync + fmt::Debug {
    /// The message was processed; never redeliver it.
    async fn ack(&self, delivery: &Delivery);

    /// Redeliver the message after the consumer's nack delay.
    async fn nack(&self, delivery: &Delivery);
}
