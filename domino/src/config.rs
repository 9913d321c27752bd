use anyhow::Result;
use serde_derive::Deserialize;
use std::time::Duration;
use url::Url;

pub const DEFAULT_URL: &str = "amqp://localhost";
pub const DEFAULT_BROADCAST_EXCHANGE: &str = "domino_broadcast";

/// Configuration of a `Messenger` and the driver behind it.
///
/// ```toml
/// [driver]
/// url = "amqp://localhost"
/// broadcast_exchange = "domino_broadcast"
///
/// [request]
/// timeout_ms = 5000
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessengerConfig {
    pub driver: DriverConfig,
    pub request: RequestConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    /// Where the broker lives. Drivers which don't connect anywhere just log it.
    pub url: Url,
    /// The topic exchange which carries broadcasts.
    pub broadcast_exchange: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    /// Default time to wait for a reply. Without it requests wait forever.
    pub timeout_ms: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            // DEFAULT_URL is a constant valid url, parsing cannot fail
            url: Url::parse(DEFAULT_URL).expect("default broker url"),
            broadcast_exchange: DEFAULT_BROADCAST_EXCHANGE.to_string(),
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

pub fn parse_config(path: &str) -> Result<MessengerConfig> {
    let cfg = std::fs::read_to_string(path)?;

    from_str(&cfg)
}

pub fn from_str(cfg: &str) -> Result<MessengerConfig> {
    Ok(toml::from_str(cfg)?)
}
