// Client-side defaults and configuration loading.
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use murmur_broker::ConnectOptions;

use crate::error::{ClientError, Result};

pub(crate) const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_NACK_REDELIVERY_DELAY: Duration = Duration::from_secs(15);
pub(crate) const DEFAULT_CHANNEL_CAPACITY: usize = 200;

/// Hard ceiling on the per-subscription retry limit. Values configured above
/// this are clamped at decision time, so a bad config cannot produce an
/// effectively unbounded redelivery loop.
pub const MAX_RETRY_LIMIT: u32 = 50;

/// Connection-level settings for one broker client.
///
/// Zero values mean "use the default": 5 s connection timeout, 30 s operation
/// timeout, 15 s nack redelivery delay.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub service_url: String,
    pub connection_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    /// Prefix for generated consumer names; may be empty.
    pub app_name: String,
    pub nack_redelivery_delay_ms: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    service_url: Option<String>,
    connection_timeout_secs: Option<u64>,
    operation_timeout_secs: Option<u64>,
    app_name: Option<String>,
    nack_redelivery_delay_ms: Option<u64>,
}

impl ClientConfig {
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            ..Self::default()
        }
    }

    /// Build a config from defaults, then `MURMUR_*` environment variables,
    /// then an optional YAML override file (explicit path wins over
    /// `MURMUR_CLIENT_CONFIG`). Zero values in the file are ignored.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("MURMUR_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path).map_err(|source| ClientError::ConfigRead {
                path: path.to_string(),
                source,
            })?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).map_err(ClientError::ConfigParse)?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("MURMUR_SERVICE_URL") {
            config.service_url = value;
        }
        if let Some(value) = read_u64_env("MURMUR_CONNECTION_TIMEOUT_SECS") {
            config.connection_timeout_secs = value;
        }
        if let Some(value) = read_u64_env("MURMUR_OPERATION_TIMEOUT_SECS") {
            config.operation_timeout_secs = value;
        }
        if let Ok(value) = std::env::var("MURMUR_APP_NAME") {
            config.app_name = value;
        }
        if let Some(value) = read_u64_env("MURMUR_NACK_DELAY_MS") {
            config.nack_redelivery_delay_ms = value;
        }
        config
    }

    pub(crate) fn connection_timeout(&self) -> Duration {
        if self.connection_timeout_secs > 0 {
            Duration::from_secs(self.connection_timeout_secs)
        } else {
            DEFAULT_CONNECTION_TIMEOUT
        }
    }

    pub(crate) fn operation_timeout(&self) -> Duration {
        if self.operation_timeout_secs > 0 {
            Duration::from_secs(self.operation_timeout_secs)
        } else {
            DEFAULT_OPERATION_TIMEOUT
        }
    }

    pub(crate) fn nack_redelivery_delay(&self) -> Duration {
        if self.nack_redelivery_delay_ms > 0 {
            Duration::from_millis(self.nack_redelivery_delay_ms)
        } else {
            DEFAULT_NACK_REDELIVERY_DELAY
        }
    }

    pub(crate) fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            service_url: self.service_url.clone(),
            connection_timeout: self.connection_timeout(),
            operation_timeout: self.operation_timeout(),
            max_connections_per_broker: std::thread::available_parallelism()
                .map(|value| value.get())
                .unwrap_or(1),
        }
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = &self.service_url
            && !value.is_empty()
        {
            config.service_url = value.clone();
        }
        if let Some(value) = self.connection_timeout_secs
            && value > 0
        {
            config.connection_timeout_secs = value;
        }
        if let Some(value) = self.operation_timeout_secs
            && value > 0
        {
            config.operation_timeout_secs = value;
        }
        if let Some(value) = &self.app_name
            && !value.is_empty()
        {
            config.app_name = value.clone();
        }
        if let Some(value) = self.nack_redelivery_delay_ms
            && value > 0
        {
            config.nack_redelivery_delay_ms = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn zero_timeouts_fall_back_to_defaults() {
        let config = ClientConfig::new("memory://local");
        assert_eq!(config.connection_timeout(), DEFAULT_CONNECTION_TIMEOUT);
        assert_eq!(config.operation_timeout(), DEFAULT_OPERATION_TIMEOUT);
        assert_eq!(config.nack_redelivery_delay(), DEFAULT_NACK_REDELIVERY_DELAY);
    }

    #[test]
    fn explicit_timeouts_are_kept() {
        let mut config = ClientConfig::new("memory://local");
        config.connection_timeout_secs = 2;
        config.operation_timeout_secs = 7;
        config.nack_redelivery_delay_ms = 250;
        assert_eq!(config.connection_timeout(), Duration::from_secs(2));
        assert_eq!(config.operation_timeout(), Duration::from_secs(7));
        assert_eq!(config.nack_redelivery_delay(), Duration::from_millis(250));
    }

    #[test]
    #[serial_test::serial]
    fn config_from_env_variables() {
        unsafe {
            std::env::set_var("MURMUR_SERVICE_URL", "memory://env");
            std::env::set_var("MURMUR_CONNECTION_TIMEOUT_SECS", "3");
            std::env::set_var("MURMUR_OPERATION_TIMEOUT_SECS", "11");
            std::env::set_var("MURMUR_APP_NAME", "env-app");
            std::env::set_var("MURMUR_NACK_DELAY_MS", "500");
        }

        let config = ClientConfig::from_env_or_yaml(None).expect("config");
        assert_eq!(config.service_url, "memory://env");
        assert_eq!(config.connection_timeout_secs, 3);
        assert_eq!(config.operation_timeout_secs, 11);
        assert_eq!(config.app_name, "env-app");
        assert_eq!(config.nack_redelivery_delay_ms, 500);

        unsafe {
            std::env::remove_var("MURMUR_SERVICE_URL");
            std::env::remove_var("MURMUR_CONNECTION_TIMEOUT_SECS");
            std::env::remove_var("MURMUR_OPERATION_TIMEOUT_SECS");
            std::env::remove_var("MURMUR_APP_NAME");
            std::env::remove_var("MURMUR_NACK_DELAY_MS");
        }
    }

    #[test]
    #[serial_test::serial]
    fn config_from_yaml_file() {
        let yaml = r#"
service_url: "memory://file"
connection_timeout_secs: 9
operation_timeout_secs: 0
app_name: "file-app"
nack_redelivery_delay_ms: 20
"#;
        let mut temp_file = NamedTempFile::new().expect("temp file");
        temp_file.write_all(yaml.as_bytes()).expect("write");
        let path = temp_file.path().to_str().expect("path");

        let config = ClientConfig::from_env_or_yaml(Some(path)).expect("config");
        assert_eq!(config.service_url, "memory://file");
        assert_eq!(config.connection_timeout_secs, 9);
        // Zero values in the file are ignored, defaults stay in effect.
        assert_eq!(config.operation_timeout_secs, 0);
        assert_eq!(config.operation_timeout(), DEFAULT_OPERATION_TIMEOUT);
        assert_eq!(config.app_name, "file-app");
        assert_eq!(config.nack_redelivery_delay_ms, 20);
    }

    #[test]
    fn config_invalid_yaml_file_returns_error() {
        let mut temp_file = NamedTempFile::new().expect("temp file");
        temp_file
            .write_all(b"service_url: [invalid")
            .expect("write");
        let path = temp_file.path().to_str().expect("path");
        let result = ClientConfig::from_env_or_yaml(Some(path));
        assert!(matches!(result, Err(ClientError::ConfigParse(_))));
    }

    #[test]
    fn config_nonexistent_file_returns_error() {
        let result = ClientConfig::from_env_or_yaml(Some("/nonexistent/murmur.yaml"));
        assert!(matches!(result, Err(ClientError::ConfigRead { .. })));
    }

    #[test]
    fn connect_options_carry_normalized_timeouts() {
        let config = ClientConfig::new("memory://local");
        let options = config.connect_options();
        assert_eq!(options.service_url, "memory://local");
        assert_eq!(options.connection_timeout, DEFAULT_CONNECTION_TIMEOUT);
        assert_eq!(options.operation_timeout, DEFAULT_OPERATION_TIMEOUT);
        assert!(options.max_connections_per_broker >= 1);
    }
}
