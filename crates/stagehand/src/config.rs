//! # Configuration
//!
//! Tunables for the bridge, the stream pipes, list polling and sockets, loaded from TOML.
//! Every section and field has a default, so an empty document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{section}.{field} must be greater than zero")]
    Zero {
        section: &'static str,
        field: &'static str,
    },

    #[error("logging.output = \"file\" requires logging.file_path")]
    MissingLogFile,

    #[error("unknown log level '{0}'")]
    UnknownLevel(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagehandConfig {
    pub bridge: BridgeConfig,
    pub streams: StreamsConfig,
    pub poll: PollConfig,
    pub sockets: SocketsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Requests that may queue for the I/O context before callers wait for room
    pub channel_capacity: usize,
    /// Watchdog for a single call. Elapsing is fatal for the bridge.
    pub call_timeout_ms: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            call_timeout_ms: None,
        }
    }
}

impl BridgeConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Bytes buffered per stream pipe; the write permit never exceeds this
    pub buffer_capacity: usize,
    /// Largest single read issued against a native source
    pub read_chunk_size: usize,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64 * 1024,
            read_chunk_size: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub deadline_recheck_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            deadline_recheck_ms: 50,
        }
    }
}

impl PollConfig {
    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.deadline_recheck_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketsConfig {
    pub default_backlog: u32,
    /// Received datagrams held per incoming stream; further arrivals are dropped
    pub datagram_queue_capacity: usize,
    /// Datagrams granted by one `check-send`
    pub send_permit: u64,
    pub max_datagram_size: usize,
}

impl Default for SocketsConfig {
    fn default() -> Self {
        Self {
            default_backlog: 128,
            datagram_queue_capacity: 256,
            send_permit: 64,
            max_datagram_size: 65_507,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub output: LogOutput,
    pub file_path: Option<PathBuf>,
    /// Keep a `CallEvent` per call in the context's event log
    pub record_calls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    File,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stdout,
            file_path: None,
            record_calls: false,
        }
    }
}

impl LoggingConfig {
    pub fn tracing_level(&self) -> Result<tracing::Level, ConfigError> {
        self.level
            .parse()
            .map_err(|_| ConfigError::UnknownLevel(self.level.clone()))
    }
}

impl StagehandConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: StagehandConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    ///
    /// ## Returns
    ///
    /// * `Ok(StagehandConfig)` - The parsed configuration
    /// * `Err(anyhow::Error)` - If the file cannot be read, is not valid TOML, or fails
    ///   [`StagehandConfig::validate`]
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn zero(section: &'static str, field: &'static str) -> Result<(), ConfigError> {
            Err(ConfigError::Zero { section, field })
        }
        if self.bridge.channel_capacity == 0 {
            return zero("bridge", "channel_capacity");
        }
        if self.streams.buffer_capacity == 0 {
            return zero("streams", "buffer_capacity");
        }
        if self.streams.read_chunk_size == 0 {
            return zero("streams", "read_chunk_size");
        }
        if self.sockets.default_backlog == 0 {
            return zero("sockets", "default_backlog");
        }
        if self.sockets.datagram_queue_capacity == 0 {
            return zero("sockets", "datagram_queue_capacity");
        }
        if self.sockets.send_permit == 0 {
            return zero("sockets", "send_permit");
        }
        if self.sockets.max_datagram_size == 0 {
            return zero("sockets", "max_datagram_size");
        }
        if self.logging.output == LogOutput::File && self.logging.file_path.is_none() {
            return Err(ConfigError::MissingLogFile);
        }
        self.logging.tracing_level()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_document_is_default() {
        let config = StagehandConfig::from_toml_str("").unwrap();
        assert_eq!(config, StagehandConfig::default());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = StagehandConfig::from_toml_str(
            r#"
            [sockets]
            send_permit = 4

            [poll]
            deadline_recheck_ms = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.sockets.send_permit, 4);
        assert_eq!(config.sockets.default_backlog, 128);
        assert_eq!(config.poll.recheck_interval(), Duration::from_millis(5));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = StagehandConfig::default();
        config.streams.buffer_capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                section: "streams",
                field: "buffer_capacity"
            })
        );
    }

    #[test]
    fn test_file_output_needs_path() {
        let err = StagehandConfig::from_toml_str("[logging]\noutput = \"file\"").unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::MissingLogFile)
        );
    }

    #[test]
    fn test_unknown_level_rejected() {
        let mut config = StagehandConfig::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownLevel(_))));
    }
}
