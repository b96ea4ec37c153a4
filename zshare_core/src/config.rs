use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::transfer::constants::{
    DEFAULT_ACCEPT_TIMEOUT_SECS, DEFAULT_BUFFERED_AMOUNT_HIGH, DEFAULT_BUFFERED_AMOUNT_LOW,
    DEFAULT_CHUNK_SIZE, DEFAULT_DRAIN_TIMEOUT_SECS, DEFAULT_MAX_CONSECUTIVE_DECODE_ERRORS,
    DEFAULT_MAX_FILE_SIZE, DEFAULT_STALL_TIMEOUT_SECS, MAX_CHUNK_SIZE, PROGRESS_UPDATE_STEP,
};

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "zshare";
const APP_NAME: &str = "zshare";
const CONFIG_FILE: &str = "config.json";

/// Directory override, mostly for tests
pub const CONFIG_DIR_ENV: &str = "ZSHARE_CONFIG_DIR";

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    pub is_encrypt: bool,
    pub chunk_size: usize,
    /// Handed to whoever builds the peer connection; opaque here
    pub ice_server: String,
    pub accept_timeout_secs: u64,
    pub buffered_amount_high: usize,
    pub buffered_amount_low: usize,
    pub drain_timeout_secs: u64,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            is_encrypt: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            ice_server: DEFAULT_ICE_SERVER.to_string(),
            accept_timeout_secs: DEFAULT_ACCEPT_TIMEOUT_SECS,
            buffered_amount_high: DEFAULT_BUFFERED_AMOUNT_HIGH,
            buffered_amount_low: DEFAULT_BUFFERED_AMOUNT_LOW,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
        }
    }
}

impl SendOptions {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveOptions {
    pub auto_accept: bool,
    pub max_size: u64,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            auto_accept: false,
            max_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Percentage points between two progress notifications
    pub progress_step: u8,
    pub stall_timeout_secs: u64,
    pub max_consecutive_decode_errors: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            progress_step: PROGRESS_UPDATE_STEP,
            stall_timeout_secs: DEFAULT_STALL_TIMEOUT_SECS,
            max_consecutive_decode_errors: DEFAULT_MAX_CONSECUTIVE_DECODE_ERRORS,
        }
    }
}

impl SessionOptions {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub send: SendOptions,
    pub receive: ReceiveOptions,
    pub session: SessionOptions,
}

impl EngineConfig {
    fn config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Some(PathBuf::from(dir).join(CONFIG_FILE));
        }
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Config file contents (or defaults), then environment overrides
    pub fn load() -> Self {
        let mut config = match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        };
        config.apply_env_overrides();
        config
    }

    /// Defaults when the file is missing or unreadable
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring malformed config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => {
                debug!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self) -> std::io::Result<PathBuf> {
        let path = Self::config_path().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no config directory")
        })?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_value("ZSHARE_CHUNK_SIZE") {
            self.send.chunk_size = v;
        }
        if let Some(v) = env_flag("ZSHARE_ENCRYPT") {
            self.send.is_encrypt = v;
        }
        if let Some(v) = env_flag("ZSHARE_AUTO_ACCEPT") {
            self.receive.auto_accept = v;
        }
        if let Some(v) = env_value("ZSHARE_MAX_SIZE") {
            self.receive.max_size = v;
        }
        if let Some(v) = env_value("ZSHARE_ACCEPT_TIMEOUT") {
            self.send.accept_timeout_secs = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunk = self.send.chunk_size;
        if chunk == 0 || chunk > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkSize {
                size: chunk,
                max: MAX_CHUNK_SIZE,
            });
        }
        if self.send.buffered_amount_low > self.send.buffered_amount_high {
            return Err(ConfigError::Watermarks {
                low: self.send.buffered_amount_low,
                high: self.send.buffered_amount_high,
            });
        }
        if self.session.progress_step == 0 || self.session.progress_step > 100 {
            return Err(ConfigError::ProgressStep);
        }
        Ok(())
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", name, raw);
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match parse_flag(&raw) {
        Some(v) => Some(v),
        None => {
            warn!("Ignoring invalid {}={:?}", name, raw);
            None
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Where received files go when the caller does not say
pub fn default_download_dir() -> PathBuf {
    UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        .or_else(|| UserDirs::new().map(|dirs| dirs.home_dir().join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("zshare")
}
