// Ack/nack decision for a failed message. Pure so it can be exercised
// without a broker.
use crate::config::MAX_RETRY_LIMIT;

/// Policy applied when a listener fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Acknowledge no matter what; failures are logged, never redelivered.
    #[default]
    AlwaysAck,
    /// Negative-acknowledge until the retry limit is exhausted.
    AckWithRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Nack,
}

/// Decide the outcome for a failed message. `retry_limit` is clamped to
/// [`MAX_RETRY_LIMIT`] regardless of what was configured; once the broker has
/// already redelivered `retry_limit` times the failure is terminal and the
/// message is acknowledged to stop the loop.
pub fn decide(ack_mode: AckMode, redelivery_count: u32, retry_limit: u32) -> AckDecision {
    let limit = retry_limit.min(MAX_RETRY_LIMIT);
    match ack_mode {
        AckMode::AlwaysAck => AckDecision::Ack,
        AckMode::AckWithRetry if redelivery_count < limit => AckDecision::Nack,
        AckMode::AckWithRetry => AckDecision::Ack,
    }
}
