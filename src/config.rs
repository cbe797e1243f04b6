use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::translation::Provider;

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("addon directory not found: {0}")]
    MissingWatchDir(PathBuf),
    #[error("chat file path has no file name: {0}")]
    InvalidChatFile(String),
    #[error("unsupported target language: {0}")]
    UnsupportedLanguage(String),
}

// ─── Persisted config ────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AppConfig {
    /// Root of the game's addon folder.
    pub addon_dir: String,
    /// Chat file written by the addon, relative to `addon_dir`.
    pub chat_file: String,
    pub target_language: String,
    pub provider: Provider,
    /// DeepL key file, relative to the config directory unless absolute.
    pub api_key_file: String,
    pub debounce_ms: u64,
    pub read_retries: u32,
    pub read_retry_delay_ms: u64,
    pub watch_refresh_secs: u64,
    pub stale_check_secs: u64,
    pub translate_timeout_secs: u64,
    pub monitor_secs: u64,
    pub log_level: String,
    pub save_history: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            addon_dir: String::new(),
            chat_file: "Japaneseplay/to_be_translated.lua".into(),
            target_language: "ja".into(),
            provider: Provider::Google,
            api_key_file: "deepl_api_key.txt".into(),
            debounce_ms: 500,
            read_retries: 5,
            read_retry_delay_ms: 100,
            watch_refresh_secs: 60,
            stale_check_secs: 60,
            translate_timeout_secs: 10,
            monitor_secs: 30,
            log_level: "info".into(),
            save_history: false,
        }
    }
}

pub fn config_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024; // 10 MB

/// Move `path` aside to `<name>.old` once it grows past 10 MB.
pub fn rotate_file(path: &Path) {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() >= MAX_LOG_SIZE {
            let old = path.with_extension("old");
            let _ = std::fs::rename(path, old);
        }
    }
}

impl AppConfig {
    pub fn load() -> Self {
        let path = config_dir().join("config.toml");
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                info!("Loaded config from {}", path.display());
                Self::from_toml(&content)
            }
            Err(_) => {
                info!("No config file found, creating default config");
                let config = Self::default();
                config.save();
                config
            }
        }
    }

    pub fn from_toml(content: &str) -> Self {
        toml::from_str(content).unwrap_or_else(|e| {
            error!("Failed to parse config, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn save(&self) {
        let path = config_dir().join("config.toml");
        match toml::to_string_pretty(self) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&path, content) {
                    error!("Failed to save config: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize config: {}", e),
        }
    }

    /// Full path of the watched chat file.
    pub fn chat_file_path(&self) -> PathBuf {
        Path::new(&self.addon_dir).join(&self.chat_file)
    }

    /// Split the chat file into (directory to watch, file name), checking that
    /// the directory exists.
    pub fn watch_target(&self) -> Result<(PathBuf, String), ConfigError> {
        let path = self.chat_file_path();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ConfigError::InvalidChatFile(self.chat_file.clone()))?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if !dir.is_dir() {
            return Err(ConfigError::MissingWatchDir(dir));
        }
        Ok((dir, file_name))
    }

    pub fn api_key_path(&self) -> PathBuf {
        let p = Path::new(&self.api_key_file);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            config_dir().join(p)
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or_else(|_| {
            eprintln!("Unknown log level '{}', using info", self.log_level);
            log::LevelFilter::Info
        })
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    pub fn watch_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.watch_refresh_secs.max(1))
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_secs(self.stale_check_secs.max(1))
    }

    pub fn translate_timeout(&self) -> Duration {
        Duration::from_secs(self.translate_timeout_secs.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_secs.max(1))
    }
}

// ─── DeepL credential ────────────────────────────────────────────────

/// Read the DeepL key. A missing or unreadable file yields an empty key; the
/// DeepL provider then fails at request time.
pub fn load_api_key(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let key = content.trim().to_string();
            if key.is_empty() {
                warn!("DeepL key file {} is empty", path.display());
            } else {
                info!("Loaded DeepL API key from {}", path.display());
            }
            key
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("DeepL API key not set, file does not exist: {}", path.display());
            String::new()
        }
        Err(e) => {
            error!("Failed to read DeepL key file {}: {}", path.display(), e);
            String::new()
        }
    }
}
