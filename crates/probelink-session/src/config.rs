use std::time::Duration;

use probelink_wire::ImageConfig;
use serde::Deserialize;

use crate::error::{Result, SessionError};

/// Session engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name announced in the register request.
    pub client_name: String,
    /// Frame shape requested after every successful registration.
    pub image: ImageConfig,
    /// How long to wait for the unregister reply before releasing anyway.
    #[serde(
        rename = "unregister_timeout_ms",
        with = "probelink_channel::config::millis"
    )]
    pub unregister_timeout: Duration,
    /// Cap on frames buffered between the channel and the observers.
    ///
    /// `None` buffers without limit and never skips a frame. With a cap, at
    /// most that many frames wait for decoding and at most that many decoded
    /// frames wait for delivery; past that the oldest undecoded frame is
    /// dropped.
    pub decode_queue_capacity: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_name: "probelink".to_string(),
            image: ImageConfig::default(),
            unregister_timeout: Duration::from_secs(2),
            decode_queue_capacity: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.client_name.trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "client_name must not be empty".to_string(),
            ));
        }
        if self.image.width == 0 || self.image.height == 0 {
            return Err(SessionError::InvalidConfig(format!(
                "image size must be non-zero (got {}x{})",
                self.image.width, self.image.height
            )));
        }
        if self.image.compression_quality > 100 {
            return Err(SessionError::InvalidConfig(format!(
                "compression_quality must be 0-100 (got {})",
                self.image.compression_quality
            )));
        }
        if self.decode_queue_capacity == Some(0) {
            return Err(SessionError::InvalidConfig(
                "decode_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.unregister_timeout.is_zero() {
            return Err(SessionError::InvalidConfig(
                "unregister_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
