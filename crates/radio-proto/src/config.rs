use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;
use crate::quality::QualityLevel;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "RADIO_CLIENT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub station: StationConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub streams: StreamsConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Static station identity used for fallbacks and share text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default = "default_station_name")]
    pub name: String,
    #[serde(default = "default_tagline")]
    pub tagline: String,
    #[serde(default = "default_logo_url")]
    pub logo_url: String,
    /// Shown when the metadata endpoint has no artwork for the song.
    #[serde(default = "default_logo_url")]
    pub default_art_url: String,
    #[serde(default = "default_web_url")]
    pub web_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_url")]
    pub url: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_schedule_url")]
    pub url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    #[serde(default = "default_high_url")]
    pub high_url: String,
    #[serde(default = "default_mid_url")]
    pub mid_url: String,
    #[serde(default = "default_low_url")]
    pub low_url: String,
    /// Level selected at startup.
    #[serde(default)]
    pub default_quality: QualityLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    /// host:port opened to decide whether the internet is reachable.
    #[serde(default = "default_probe_address")]
    pub probe_address: String,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    /// Reconnect a failed session when connectivity comes back.
    /// Off by default: failures wait for the user.
    #[serde(default)]
    pub reconnect_on_network_recovery: bool,
    /// Start the stream as soon as the client is up.
    #[serde(default)]
    pub autoplay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "default_volume")]
    pub volume: f32,
    /// Explicit mpv binary; searched beside the exe and on PATH otherwise.
    #[serde(default)]
    pub binary: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogConfig {
    /// Write logs to `data_dir()/client.log` instead of stderr.
    #[serde(default)]
    pub to_file: bool,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            name: default_station_name(),
            tagline: default_tagline(),
            logo_url: default_logo_url(),
            default_art_url: default_logo_url(),
            web_url: default_web_url(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            url: default_metadata_url(),
            poll_interval_secs: default_poll_interval_secs(),
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            url: default_schedule_url(),
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            high_url: default_high_url(),
            mid_url: default_mid_url(),
            low_url: default_low_url(),
            default_quality: QualityLevel::default(),
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_address: default_probe_address(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            binary: None,
        }
    }
}

fn default_station_name() -> String {
    "MCC Radio".to_string()
}

fn default_tagline() -> String {
    "Your Home for the Best in Southern Gospel".to_string()
}

fn default_logo_url() -> String {
    "https://radio.mccmarion.org/static/uploads/album_art.1732477227.jpg".to_string()
}

fn default_web_url() -> String {
    "https://mccmarion.org/radio_live.html".to_string()
}

fn default_metadata_url() -> String {
    "https://radio.mccmarion.org/api/nowplaying/mcc_radio".to_string()
}

fn default_schedule_url() -> String {
    "https://mccmarion.org/schedule.json".to_string()
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_high_url() -> String {
    "https://radio.mccmarion.org/hls/mcc_radio/aac_hifi.m3u8".to_string()
}

fn default_mid_url() -> String {
    "https://radio.mccmarion.org/hls/mcc_radio/aac_midfi.m3u8".to_string()
}

fn default_low_url() -> String {
    "https://radio.mccmarion.org/hls/mcc_radio/aac_lofi.m3u8".to_string()
}

fn default_probe_address() -> String {
    "radio.mccmarion.org:443".to_string()
}

fn default_probe_interval_secs() -> u64 {
    5
}

fn default_probe_timeout_secs() -> u64 {
    3
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_volume() -> f32 {
    0.8
}

impl Config {
    /// Load the config file if present.  A missing file means defaults; the
    /// file is never written back.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn config_path() -> PathBuf {
        if let Ok(p) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(p);
        }
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8990);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.metadata.poll_interval_secs, 15);
        assert_eq!(config.metadata.timeout_secs, 10);
        assert_eq!(config.streams.default_quality, QualityLevel::High);
        assert!(!config.session.reconnect_on_network_recovery);
        assert!(!config.session.autoplay);
        assert!(config.metadata.url.starts_with("https://"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
            [station]
            name = "Test FM"

            [streams]
            default_quality = "low"

            [session]
            reconnect_on_network_recovery = true
            "#,
        )
        .unwrap();
        assert_eq!(config.station.name, "Test FM");
        assert_eq!(config.station.tagline, default_tagline());
        assert_eq!(config.streams.default_quality, QualityLevel::Low);
        assert!(config.streams.high_url.ends_with("aac_hifi.m3u8"));
        assert!(config.session.reconnect_on_network_recovery);
        assert_eq!(config.metadata.poll_interval_secs, 15);
    }

    #[test]
    fn test_missing_file_is_default() {
        let path = std::env::temp_dir().join("radio-client-no-such-config.toml");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.station.name, "MCC Radio");
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(Config::from_toml_str("[http]\nport = \"nope\"").is_err());
    }
}
