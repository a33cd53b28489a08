use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub mod adapters;
pub mod daemon;
pub mod downloads;
pub mod peek;
pub mod search;
pub mod store;

pub use daemon::{Daemon, NotchState, Surface};
pub use peek::{PeekController, PeekKind, SneakPeek};
pub use search::{SearchHandle, SearchResults};
pub use store::{ClipboardEntry, ClipboardStore, ContentKind, Pasteboard, RawItem};

pub const PASTEBOARD_POLL_INTERVAL_MS: u64 = 100;
pub const VOLUME_POLL_INTERVAL_MS: u64 = 100;
pub const BRIGHTNESS_POLL_INTERVAL_MS: u64 = 400;
pub const DOWNLOAD_POLL_INTERVAL_MS: u64 = 1000;
pub const PEEK_DISMISS_MS: u64 = 1500;
pub const SEARCH_DEBOUNCE_MS: u64 = 300;
pub const VOLUME_DELTA: f32 = 1e-2;
pub const HASH_PREFIX_LEN: usize = 8;
pub const MAX_CAPTURE_SIZE: usize = 100 * 1024 * 1024; // 100MB
pub(crate) const DECODED_CACHE_SIZE: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub history_path: PathBuf,
    pub max_records: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    pub compress_threshold: usize,
    pub trim_whitespace: bool,
    pub ignored_producers: Vec<String>,
    #[serde(default)]
    pub downloads_dir: Option<PathBuf>,
    #[serde(default = "default_backlight_step")]
    pub backlight_step: f32,
}

fn default_retention_days() -> u32 {
    30
}

fn default_backlight_step() -> f32 {
    0.1
}

impl Default for Config {
    fn default() -> Self {
        let history_path = dirs::document_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("notchd")
            .join("history.json");

        Self {
            history_path,
            max_records: 1000,
            retention_days: 30,
            compress_threshold: 4096,
            trim_whitespace: true,
            ignored_producers: Vec::new(),
            downloads_dir: dirs::download_dir(),
            backlight_step: 0.1,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = dirs::config_dir()
            .unwrap_or_default()
            .join("notchd")
            .join("config.toml");

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&config_path, toml::to_string_pretty(&config)?)?;
            Ok(config)
        }
    }
}
