// At-least-once publish/subscribe client over an abstract broker.
//
// CLIENT DESIGN NOTES (murmur-client)
//
// The hard part of this crate is the consumption pipeline:
//
// - One long-lived loop per subscription pulls deliveries off a bounded
//   channel the broker pushes into. The channel bound is the only throttle
//   on consumption rate.
// - Every delivery is dispatched on its own task; the loop never waits for a
//   handler. A slow or hung listener costs one task, nothing more.
// - Dispatch is an isolation boundary: listener failures and panics are
//   converted into a typed failure that feeds the retry decision, so one bad
//   message can never take the loop down.
// - The ack/nack decision reads the subscription registry fresh on every
//   failure. Re-subscribing with the same topic and subscription name
//   replaces the stored configuration (last write wins) and governs the next
//   decision.
// - Retry budgets are bounded: the configured limit is clamped to a hard
//   ceiling, and an exhausted budget acknowledges the message so the broker
//   stops redelivering it. There is no dead-letter routing; terminal
//   failures are only logged.
//
// The broker itself (transport, protocol, persistence) sits behind the
// `murmur_broker` capability traits and is out of scope here.
pub mod client;
pub mod codec;
pub mod config;
pub mod error;


pub use client::client::{Client, LazyClient};
pub use client::registry::{SubscriptionEntry, SubscriptionRegistry};
pub use client::retry::{decide, AckDecision, AckMode};
pub use client::subscription::{InboundMessage, MessageListener, SubscriptionOptions};
pub use codec::{Codec, JsonStringCodec, Utf8Codec};
pub use config::{ClientConfig, MAX_RETRY_LIMIT};
pub use error::{ClientError, Result};
pub use murmur_broker::{Delivery, MessageId, SubscriptionType};
