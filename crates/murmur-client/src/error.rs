// Client-facing error type. Broker failures pass through; configuration
// loading gets its own variants so callers can tell a bad file from a bad
// connection.
use murmur_broker::BrokerError;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("read client config: {path}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse client config yaml")]
    ConfigParse(#[source] serde_yaml::Error),
}
