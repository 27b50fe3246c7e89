use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Pipeline configuration. Every field has a default so a missing file or a
/// partial one still yields a runnable setup; CLI flags override the file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub collect: CollectConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    /// Days before the window end the aggregation reaches back;
    /// 1 means "yesterday through today".
    #[serde(default = "default_days_back")]
    pub days_back: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectConfig {
    /// JSON feed file written by the external scraping process.
    #[serde(default)]
    pub feed: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config from {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("failed to parse config TOML")?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            window: WindowConfig::default(),
            collect: CollectConfig::default(),
            forecast: ForecastConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            days_back: default_days_back(),
        }
    }
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            feed: None,
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizon_days: default_horizon_days(),
        }
    }
}

fn default_db_path() -> String {
    "./pricewatch.sqlite3".to_string()
}

fn default_days_back() -> i64 {
    1
}

fn default_max_attempts() -> u32 {
    6
}

fn default_horizon_days() -> u32 {
    3
}
