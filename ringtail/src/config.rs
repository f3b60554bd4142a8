use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Pinned ring buffer map to drain. Without one, ringtail feeds an
    /// in-process ring from a demo producer.
    #[serde(default)]
    pub pin_path: Option<PathBuf>,

    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub max_records: Option<u64>,

    #[serde(default = "default_demo_interval_ms")]
    pub demo_interval_ms: u64,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pin_path: None,
            capacity: default_capacity(),
            timeout_ms: default_timeout_ms(),
            max_records: None,
            demo_interval_ms: default_demo_interval_ms(),
            log_filter: default_log_filter(),
        }
    }
}

fn default_capacity() -> usize {
    1 << 16
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_demo_interval_ms() -> u64 {
    100
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
