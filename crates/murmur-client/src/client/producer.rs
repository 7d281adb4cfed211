// Producer send path: thin request/response plumbing over the broker
// connection. Synchronous variants wait for broker acceptance; async
// variants are fire-and-forget and surface failures only through logs.
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use murmur_broker::{MessageId, SendOptions};

use crate::client::client::Client;
use crate::error::Result;

impl Client {
    /// Publish and wait for the broker to accept the message.
    pub async fn send(&self, topic: &str, payload: impl Into<Bytes>) -> Result<MessageId> {
        self.do_send(topic, payload.into(), SendOptions::default())
            .await
    }

    /// Publish a message that stays invisible to consumers for `delay`.
    pub async fn send_delay(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        delay: Duration,
    ) -> Result<MessageId> {
        self.do_send(
            topic,
            payload.into(),
            SendOptions {
                deliver_after: Some(delay),
                deliver_at: None,
            },
        )
        .await
    }

    /// Publish a message that becomes visible to consumers at `deliver_at`.
    pub async fn send_delay_at(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        deliver_at: SystemTime,
    ) -> Result<MessageId> {
        self.do_send(
            topic,
            payload.into(),
            SendOptions {
                deliver_after: None,
                deliver_at: Some(deliver_at),
            },
        )
        .await
    }

    /// Fire-and-forget publish; failures are logged, never returned.
    pub fn send_async(&self, topic: &str, payload: impl Into<Bytes>) {
        self.spawn_send(topic, payload.into(), SendOptions::default());
    }

    /// Fire-and-forget delayed publish.
    pub fn send_delay_async(&self, topic: &str, payload: impl Into<Bytes>, delay: Duration) {
        self.spawn_send(
            topic,
            payload.into(),
            SendOptions {
                deliver_after: Some(delay),
                deliver_at: None,
            },
        );
    }

    /// Fire-and-forget publish visible at an absolute time.
    pub fn send_delay_at_async(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        deliver_at: SystemTime,
    ) {
        self.spawn_send(
            topic,
            payload.into(),
            SendOptions {
                deliver_after: None,
                deliver_at: Some(deliver_at),
            },
        );
    }

    async fn do_send(&self, topic: &str, payload: Bytes, options: SendOptions) -> Result<MessageId> {
        match self.connection.send(topic, payload, options).await {
            Ok(id) => {
                metrics::counter!("murmur_client_sends_total").increment(1);
                Ok(id)
            }
            Err(err) => {
                metrics::counter!("murmur_client_send_errors_total").increment(1);
                Err(err.into())
            }
        }
    }

    fn spawn_send(&self, topic: &str, payload: Bytes, options: SendOptions) {
        let connection = Arc::clone(&self.connection);
        let topic = topic.to_string();
        tokio::spawn(async move {
            match connection.send(&topic, payload, options).await {
                Ok(_) => {
                    metrics::counter!("murmur_client_sends_total").increment(1);
                }
                Err(err) => {
                    metrics::counter!("murmur_client_send_errors_total").increment(1);
                    tracing::error!(error = %err, topic = %topic, "async send failed");
                }
            }
        });
    }
}
