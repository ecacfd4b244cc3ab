use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub player: PlayerConfig,
    pub transport_stream: TransportStreamConfig,
    pub hls: HlsConfig,
    pub http: HttpConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Session-level playback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Upper bound on the whole adapter cascade, not on each adapter
    pub negotiation_timeout_seconds: u64,
    /// Idle period after which the controls overlay hides
    pub controls_hide_seconds: u64,
    pub autoplay: bool,
    pub start_muted: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_seconds: 30,
            controls_hide_seconds: 3,
            autoplay: true,
            start_muted: false,
        }
    }
}

impl PlayerConfig {
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_seconds)
    }

    #[must_use]
    pub const fn controls_hide_delay(&self) -> Duration {
        Duration::from_secs(self.controls_hide_seconds)
    }
}

/// Raw MPEG-TS demuxer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportStreamConfig {
    /// Consecutive 0x47 sync bytes (at 188-byte stride) needed to lock on
    pub sync_packets: usize,
    /// Bytes read without a valid PAT before the stream is declared not-TS
    pub probe_bytes: usize,
}

impl Default for TransportStreamConfig {
    fn default() -> Self {
        Self {
            sync_packets: 3,
            probe_bytes: 1024 * 1024,
        }
    }
}

/// Manifest-based segmented stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub max_consecutive_failures: u32,
    /// How many segments behind the live edge playback starts
    pub live_edge_segments: usize,
    /// Maximum master -> media playlist indirections followed
    pub max_playlist_depth: usize,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            live_edge_segments: 3,
            max_playlist_depth: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_seconds: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 10,
            user_agent: concat!("livetv/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Capabilities of the playback runtime, consulted by each adapter's probe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Sink accepts demuxed bytes pushed by an in-process demuxer
    pub media_source: bool,
    /// Sink can play an HLS URL by itself
    pub native_hls: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            media_source: true,
            native_hls: false,
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then environment variables.
    ///
    /// Environment keys use the `LIVETV_` prefix and `__` between sections,
    /// e.g. `LIVETV_PLAYER__NEGOTIATION_TIMEOUT_SECONDS=45`.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("LIVETV")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Collect every configuration problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.player.negotiation_timeout_seconds == 0 {
            errors.push("player.negotiation_timeout_seconds must be greater than 0".to_string());
        }
        if self.player.controls_hide_seconds == 0 {
            errors.push("player.controls_hide_seconds must be greater than 0".to_string());
        }
        if self.transport_stream.sync_packets == 0 {
            errors.push("transport_stream.sync_packets must be greater than 0".to_string());
        }
        if self.transport_stream.probe_bytes < 188 {
            errors.push(format!(
                "transport_stream.probe_bytes must hold at least one packet (got {})",
                self.transport_stream.probe_bytes
            ));
        }
        if self.hls.max_playlist_depth == 0 {
            errors.push("hls.max_playlist_depth must be greater than 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\" (got {:?})",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
