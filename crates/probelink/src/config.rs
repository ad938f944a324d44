use std::path::Path;

use probelink_channel::ChannelConfig;
use probelink_session::SessionConfig;
use serde::Deserialize;

use crate::exit::{io_error, CliError, CliResult, USAGE};

/// Settings file accepted by `--config`.
///
/// ```toml
/// [channel]
/// socket_path = "/run/device/service.sock"
/// handshake_timeout_ms = 2000
///
/// [session]
/// client_name = "bench"
/// unregister_timeout_ms = 1500
/// # omit to keep every frame
/// decode_queue_capacity = 4
///
/// [session.image]
/// width = 640
/// height = 480
/// compression_format = "raw"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub channel: ChannelConfig,
    pub session: SessionConfig,
}

impl CliConfig {
    pub fn load(path: Option<&Path>) -> CliResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .map_err(|err| io_error(&format!("read config {}", path.display()), err))?;
        Self::parse(&text)
            .map_err(|err| CliError::new(USAGE, format!("config {}: {err}", path.display())))
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use probelink_wire::CompressionFormat;

    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = CliConfig::parse("").unwrap();
        assert_eq!(config.session.client_name, "probelink");
        assert_eq!(config.channel.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.session.decode_queue_capacity, None);
        assert_eq!(config.session.image.compression_format, CompressionFormat::Raw);
    }

    #[test]
    fn frame_cap_is_opt_in() {
        let config = CliConfig::parse("[session]\ndecode_queue_capacity = 4\n").unwrap();
        assert_eq!(config.session.decode_queue_capacity, Some(4));
    }

    #[test]
    fn nested_tables_override_defaults() {
        let config = CliConfig::parse(
            r#"
            [channel]
            socket_path = "/tmp/dev.sock"

            [session]
            unregister_timeout_ms = 300

            [session.image]
            width = 640
            compression_format = "png"
            "#,
        )
        .unwrap();

        assert_eq!(config.channel.socket_path, Path::new("/tmp/dev.sock"));
        assert_eq!(config.session.unregister_timeout, Duration::from_millis(300));
        assert_eq!(config.session.image.width, 640);
        assert_eq!(config.session.image.height, 400);
        assert_eq!(config.session.image.compression_format, CompressionFormat::Png);
    }

    #[test]
    fn unknown_section_rejected() {
        assert!(CliConfig::parse("[render]\nfps = 30\n").is_err());
    }
}
