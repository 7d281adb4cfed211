//! Connection handle and subscription registration.
//!
//! # Purpose
//! Owns the broker connection, the subscription registry, and the client
//! identity used to name consumers. Subscribe and send paths both fan out
//! from here.
//!
//! # Design notes
//! There is no hidden process-global client. Embedders that want one shared
//! connection construct a [`Client`] once and pass it around, or park it in a
//! [`LazyClient`] cell, which guarantees at most one connection no matter how
//! many tasks race the first use.
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

use murmur_broker::{BrokerConnection, BrokerConnector};

use crate::client::registry::SubscriptionRegistry;
use crate::client::subscription::{
    run_subscription_loop, SubscriptionLoopConfig, SubscriptionOptions,
};
use crate::config::ClientConfig;
use crate::error::Result;

/// Handle to one broker connection, shared by consumers and producers.
///
/// ```
/// use std::sync::Arc;
/// use murmur_broker::MemoryBroker;
/// use murmur_client::{Client, ClientConfig, InboundMessage, MessageListener, SubscriptionOptions};
///
/// struct Print;
///
/// #[async_trait::async_trait]
/// impl MessageListener for Print {
///     async fn on_message(&self, message: InboundMessage) -> anyhow::Result<()> {
///         println!("got: {}", message.value);
///         Ok(())
///     }
/// }
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = MemoryBroker::new();
///     let client = Client::connect(ClientConfig::new("memory://local"), &broker)
///         .await
///         .expect("connect");
///     client.subscribe(SubscriptionOptions::new("updates", "printer", Arc::new(Print)));
///     tokio::time::sleep(std::time::Duration::from_millis(100)).await;
///     client.send("updates", "\"hello\"").await.expect("send");
/// });
/// ```
pub struct Client {
    pub(crate) connection: Arc<dyn BrokerConnection>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) app_name: String,
    pub(crate) nack_redelivery_delay: std::time::Duration,
}

impl Client {
    /// Establish the broker connection described by `config`. Construction
    /// failure is returned, not panicked; the caller decides whether it is
    /// fatal.
    pub async fn connect(config: ClientConfig, connector: &dyn BrokerConnector) -> Result<Self> {
        let options = config.connect_options();
        tracing::info!(url = %options.service_url, "connecting to broker");
        let connection = connector.connect(options).await?;
        tracing::info!("broker connection established");
        Ok(Self {
            connection,
            registry: Arc::new(SubscriptionRegistry::new()),
            app_name: config.app_name.clone(),
            nack_redelivery_delay: config.nack_redelivery_delay(),
        })
    }

    /// Register a subscription. Non-blocking: the loop runs in its own task
    /// for the life of the subscription, and per-message outcomes are only
    /// observable through logs and redelivery behavior.
    pub fn subscribe(&self, options: SubscriptionOptions) {
        let config = SubscriptionLoopConfig {
            connection: Arc::clone(&self.connection),
            registry: Arc::clone(&self.registry),
            options,
            consumer_name: consumer_name(&self.app_name),
            nack_redelivery_delay: self.nack_redelivery_delay,
        };
        tokio::spawn(run_subscription_loop(config));
    }

    /// Register several subscriptions at once.
    pub fn subscribes(&self, options: impl IntoIterator<Item = SubscriptionOptions>) {
        for entry in options {
            self.subscribe(entry);
        }
    }

    /// Release the broker connection. Sends and subscribes issued afterwards
    /// fail; running loops end when their delivery channels close.
    pub async fn close(&self) {
        self.connection.close().await;
    }
}

// Consumer names carry the application name plus a fresh suffix so parallel
// subscription instances stay distinguishable on the broker side.
fn consumer_name(app_name: &str) -> String {
    let suffix = Uuid::new_v4().to_string();
    if app_name.is_empty() {
        suffix
    } else {
        format!("{app_name}-{suffix}")
    }
}

/// Caller-owned once cell around a [`Client`].
///
/// `get_or_connect` is idempotent under arbitrary concurrency: whichever
/// caller wins performs the single connect, every other caller waits and
/// receives the same handle. A failed connect leaves the cell empty so a
/// later call can retry.
pub struct LazyClient {
    config: ClientConfig,
    connector: Arc<dyn BrokerConnector>,
    cell: OnceCell<Arc<Client>>,
}

impl LazyClient {
    pub fn new(config: ClientConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            config,
            connector,
            cell: OnceCell::new(),
        }
    }

    pub async fn get_or_connect(&self) -> Result<Arc<Client>> {
        self.cell
            .get_or_try_init(|| async {
                Client::connect(self.config.clone(), self.connector.as_ref())
                    .await
                    .map(Arc::new)
            })
            .await
            .cloned()
    }

    /// The connected client, if initialization already happened.
    pub fn get(&self) -> Option<Arc<Client>> {
        self.cell.get().cloned()
    }
}
