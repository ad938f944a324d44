use std::path::PathBuf;
use std::time::Duration;

use probelink_wire::DEFAULT_MAX_PAYLOAD;
use serde::Deserialize;

/// Default socket the device service listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/probelink.sock";

/// Transport settings for [`UdsConnector`](crate::UdsConnector).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub socket_path: PathBuf,
    /// Bound on waiting for the service's ready/refused answer.
    #[serde(rename = "handshake_timeout_ms", with = "millis")]
    pub handshake_timeout: Duration,
    pub max_payload_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            handshake_timeout: Duration::from_secs(5),
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// (De)serializes a `Duration` as whole milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
