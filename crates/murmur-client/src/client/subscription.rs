// Subscription loop and per-message dispatch.
//
// One long-lived task per subscription pulls deliveries off the bounded
// broker channel and spawns one dispatch task per message, never waiting for
// it. Backpressure comes only from the delivery channel; a slow listener ties
// up its own task and nothing else. Each dispatch ends in exactly one
// ack/nack, decided against the registry entry current at that moment.
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;

use murmur_broker::{
    BrokerConnection, BrokerConsumer, ConsumerRequest, Delivery, MessageId, SubscriptionType,
};

use crate::client::registry::{SubscriptionEntry, SubscriptionRegistry};
use crate::client::retry::{decide, AckDecision, AckMode};
use crate::codec::{Codec, JsonStringCodec};
use crate::config::{DEFAULT_CHANNEL_CAPACITY, MAX_RETRY_LIMIT};

/// What a listener sees for one delivered message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Codec-decoded payload; empty when decoding failed.
    pub value: String,
    pub payload: bytes::Bytes,
    pub redelivery_count: u32,
    pub subscription_name: String,
    pub id: MessageId,
}

/// User handler invoked once per delivered message. Failures (and panics)
/// are routed into the retry decision; they never reach the loop.
#[async_trait::async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: InboundMessage) -> anyhow::Result<()>;
}

/// Per-subscription settings supplied by the caller.
///
/// Zero values are normalized at subscribe time: `retry_limit` 0 becomes the
/// retry ceiling, `channel_capacity` 0 becomes 200.
pub struct SubscriptionOptions {
    pub topic: String,
    pub subscription_name: String,
    pub subscription_type: SubscriptionType,
    pub ack_mode: AckMode,
    pub retry_limit: u32,
    pub channel_capacity: usize,
    pub listener: Arc<dyn MessageListener>,
    pub codec: Arc<dyn Codec>,
}

impl SubscriptionOptions {
    pub fn new(
        topic: impl Into<String>,
        subscription_name: impl Into<String>,
        listener: Arc<dyn MessageListener>,
    ) -> Self {
        Self {
            topic: topic.into(),
            subscription_name: subscription_name.into(),
            subscription_type: SubscriptionType::Shared,
            ack_mode: AckMode::AlwaysAck,
            retry_limit: 0,
            channel_capacity: 0,
            listener,
            codec: Arc::new(JsonStringCodec),
        }
    }
}

pub(crate) struct SubscriptionLoopConfig {
    pub(crate) connection: Arc<dyn BrokerConnection>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) options: SubscriptionOptions,
    pub(crate) consumer_name: String,
    pub(crate) nack_redelivery_delay: std::time::Duration,
}

/// Long-lived per-subscription loop. Runs until the broker closes the
/// delivery channel; a rejected subscribe is fatal to this loop and is not
/// retried.
pub(crate) async fn run_subscription_loop(config: SubscriptionLoopConfig) {
    let SubscriptionLoopConfig {
        connection,
        registry,
        options,
        consumer_name,
        nack_redelivery_delay,
    } = config;

    let retry_limit = if options.retry_limit == 0 {
        MAX_RETRY_LIMIT
    } else {
        options.retry_limit
    };
    let channel_capacity = if options.channel_capacity == 0 {
        DEFAULT_CHANNEL_CAPACITY
    } else {
        options.channel_capacity
    };

    let (deliveries_tx, mut deliveries_rx) = mpsc::channel(channel_capacity);
    let request = ConsumerRequest {
        topic: options.topic.clone(),
        subscription_name: options.subscription_name.clone(),
        subscription_type: options.subscription_type,
        consumer_name: consumer_name.clone(),
        nack_redelivery_delay,
    };
    let consumer = match connection.subscribe(request, deliveries_tx).await {
        Ok(consumer) => consumer,
        Err(err) => {
            tracing::error!(
                error = %err,
                topic = %options.topic,
                subscription = %options.subscription_name,
                "subscribe rejected, subscription loop aborted"
            );
            return;
        }
    };

    let entry = Arc::new(SubscriptionEntry {
        topic: options.topic.clone(),
        subscription_name: options.subscription_name.clone(),
        ack_mode: options.ack_mode,
        retry_limit,
        listener: options.listener,
        codec: options.codec,
    });
    registry.store(Arc::clone(&entry));
    tracing::info!(
        topic = %options.topic,
        subscription = %options.subscription_name,
        consumer = %consumer_name,
        retry_limit,
        channel_capacity,
        "subscription started"
    );

    while let Some(delivery) = deliveries_rx.recv().await {
        tokio::spawn(dispatch(
            delivery,
            Arc::clone(&consumer),
            Arc::clone(&entry),
            Arc::clone(&registry),
        ));
    }
    tracing::info!(
        topic = %options.topic,
        subscription = %options.subscription_name,
        "delivery channel closed, subscription loop ended"
    );
}

/// Handle one delivered message and issue exactly one ack or nack.
async fn dispatch(
    delivery: Delivery,
    consumer: Arc<dyn BrokerConsumer>,
    entry: Arc<SubscriptionEntry>,
    registry: Arc<SubscriptionRegistry>,
) {
    tracing::info!(
        subscription = %delivery.subscription_name,
        id = %delivery.id,
        redelivery_count = delivery.redelivery_count,
        publish_time = ?delivery.publish_time,
        producer = %delivery.producer_name,
        "delivery received"
    );

    let handled = {
        let listener = Arc::clone(&entry.listener);
        let codec = Arc::clone(&entry.codec);
        let message = delivery.clone();
        // Decode and handle inside a separate task so a panic surfaces here
        // as a JoinError instead of unwinding the subscription loop.
        tokio::spawn(async move {
            let value = match codec.decode(&message.payload) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        subscription = %message.subscription_name,
                        id = %message.id,
                        "payload decode failed, handing empty value to listener"
                    );
                    String::new()
                }
            };
            listener
                .on_message(InboundMessage {
                    value,
                    payload: message.payload.clone(),
                    redelivery_count: message.redelivery_count,
                    subscription_name: message.subscription_name.clone(),
                    id: message.id.clone(),
                })
                .await
        })
        .await
    };

    let result = match handled {
        Ok(result) => result,
        Err(join_err) => Err(isolation_failure(join_err)),
    };

    match result {
        Ok(()) => {
            metrics::counter!("murmur_client_dispatch_acked_total").increment(1);
            consumer.ack(&delivery).await;
        }
        Err(err) => {
            metrics::counter!("murmur_client_handler_errors_total").increment(1);
            tracing::error!(
                error = %err,
                subscription = %delivery.subscription_name,
                id = %delivery.id,
                redelivery_count = delivery.redelivery_count,
                "listener failed"
            );
            // Read the registry fresh so a re-subscribe governs this very
            // decision. The lookup pairs the loop's own topic with the
            // delivered message's subscription name.
            let (ack_mode, retry_limit) =
                match registry.lookup(&entry.topic, &delivery.subscription_name) {
                    Some(current) => (current.ack_mode, current.retry_limit),
                    None => {
                        tracing::error!(
                            topic = %entry.topic,
                            subscription = %delivery.subscription_name,
                            "no stored subscription configuration, acknowledging without retry"
                        );
                        (AckMode::AlwaysAck, 0)
                    }
                };
            match decide(ack_mode, delivery.redelivery_count, retry_limit) {
                AckDecision::Nack => {
                    metrics::counter!("murmur_client_dispatch_nacked_total").increment(1);
                    tracing::info!(
                        subscription = %delivery.subscription_name,
                        id = %delivery.id,
                        redelivery_count = delivery.redelivery_count,
                        retry_limit,
                        ack_mode = ?ack_mode,
                        "listener failed, message will be redelivered"
                    );
                    consumer.nack(&delivery).await;
                }
                AckDecision::Ack => {
                    metrics::counter!("murmur_client_dispatch_acked_total").increment(1);
                    tracing::info!(
                        subscription = %delivery.subscription_name,
                        id = %delivery.id,
                        redelivery_count = delivery.redelivery_count,
                        retry_limit,
                        ack_mode = ?ack_mode,
                        "listener failed and retries are exhausted, acknowledging"
                    );
                    consumer.ack(&delivery).await;
                }
            }
        }
    }
}

/// Convert an escaped task fault (panic or cancellation) into the failure
/// consumed by the retry decision.
fn isolation_failure(join_err: JoinError) -> anyhow::Error {
    if join_err.is_panic() {
        metrics::counter!("murmur_client_handler_panics_total").increment(1);
        let payload = join_err.into_panic();
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        anyhow::anyhow!("listener panicked: {message}")
    } else {
        anyhow::anyhow!("listener task cancelled")
    }
}
