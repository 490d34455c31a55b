//! YAML configuration with built-in defaults.
//!
//! Lookup order: explicit path, then `COWATCH_CONFIG`, then `config.yaml` in
//! the platform config directory, then defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "COWATCH_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub chat: ChatConfig,
    pub network: NetworkConfig,
    pub voice: VoiceConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub drift_tolerance_secs: f64,
    pub drift_interval_ms: u64,
    pub state_request_timeout_ms: u64,
    pub state_request_retries: u32,
    pub reply_window_ms: u64,
    pub echo_guard_ms: u64,
    /// Host heartbeat `state_sync` period; disabled when unset.
    pub host_resync_interval_ms: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drift_tolerance_secs: 0.5,
            drift_interval_ms: 3_000,
            state_request_timeout_ms: 4_000,
            state_request_retries: 2,
            reply_window_ms: 1_000,
            echo_guard_ms: 750,
            host_resync_interval_ms: None,
        }
    }
}

impl SyncConfig {
    pub fn drift_interval(&self) -> Duration {
        Duration::from_millis(self.drift_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub notice_dedup_window_ms: u64,
    pub max_entries: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            notice_dedup_window_ms: 3_000,
            max_entries: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub topic_prefix: String,
    pub listen: Vec<String>,
    pub dial: Vec<String>,
    pub self_echo: bool,
    pub heartbeat_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "cowatch/room/".to_string(),
            listen: vec![
                "/ip4/0.0.0.0/tcp/0".to_string(),
                "/ip4/0.0.0.0/udp/0/quic-v1".to_string(),
            ],
            dial: Vec::new(),
            self_echo: true,
            heartbeat_secs: 1,
        }
    }
}

impl NetworkConfig {
    pub fn topic_for(&self, room_code: &str) -> String {
        format!("{}{}", self.topic_prefix, room_code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub ice_servers: Vec<String>,
    /// Minimum gap between `webrtc-join` re-announcements while a present
    /// member has no voice link.
    pub rejoin_interval_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            rejoin_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9857 }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file per the lookup order and load it.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load_from_file(path);
        }
        match default_config_path() {
            Some(path) if path.is_file() => {
                info!("Loading config from {:?}", path);
                Self::load_from_file(path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sync.drift_tolerance_secs > 0.0) {
            return Err(ConfigError::Invalid(
                "sync.drift_tolerance_secs must be positive".into(),
            ));
        }
        if self.sync.drift_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.drift_interval_ms must be positive".into(),
            ));
        }
        if self.sync.host_resync_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "sync.host_resync_interval_ms must be positive when set".into(),
            ));
        }
        if self.voice.rejoin_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "voice.rejoin_interval_ms must be positive".into(),
            ));
        }
        if self.network.topic_prefix.is_empty() {
            return Err(ConfigError::Invalid("network.topic_prefix is empty".into()));
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "cowatch", "Cowatch").map(|p| p.config_dir().join("config.yaml"))
}
