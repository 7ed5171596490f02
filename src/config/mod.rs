//! Settings handling
//!
//! The engine consumes a YAML key/value bag maintained by the shell. Only the
//! fields that affect collection are modelled here; unknown keys are ignored
//! on load and therefore owned by whoever wrote them.

pub mod constants;
mod ticker_config;

pub use ticker_config::{enabled_tickers, TickerConfig};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Collection-relevant application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_key: String,
    pub api_subscription_tiers: Vec<String>,
    /// true = collect every endpoint in the enabled tiers,
    /// false = chart-display subset only
    pub collect_all_endpoints: bool,
    pub data_directory: String,
    /// Plots hidden on charts; lets the planner skip endpoints whose every
    /// plot is hidden
    pub hidden_plots: Vec<String>,
    pub ticker_configs: HashMap<String, TickerConfig>,
    /// Presentation order only; does not affect collection
    pub ticker_order: Vec<String>,
    /// Presentation only: display times in ET instead of local time
    pub use_market_time: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_subscription_tiers: vec!["classic".to_string()],
            collect_all_endpoints: false,
            data_directory: "Tickers".to_string(),
            hidden_plots: Vec::new(),
            ticker_configs: HashMap::new(),
            ticker_order: Vec::new(),
            use_market_time: false,
        }
    }
}

impl Settings {
    /// Subscription tiers with the documented default applied.
    pub fn subscription_tiers(&self) -> Vec<String> {
        if self.api_subscription_tiers.is_empty() {
            vec!["classic".to_string()]
        } else {
            self.api_subscription_tiers.clone()
        }
    }

    /// Tickers enabled for collection.
    pub fn enabled_tickers(&self) -> Vec<String> {
        enabled_tickers(&self.ticker_configs)
    }

    /// Data directory with the documented default applied.
    pub fn data_directory(&self) -> &str {
        if self.data_directory.is_empty() {
            "Tickers"
        } else {
            &self.data_directory
        }
    }
}

/// Loads and saves the settings file
pub struct SettingsManager {
    config_file: PathBuf,
}

impl SettingsManager {
    pub fn new(config_file: Option<PathBuf>) -> Self {
        Self {
            config_file: config_file
                .unwrap_or_else(|| PathBuf::from(constants::CONFIG_FILE_NAME)),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file
    }

    /// Load settings from disk. A missing file yields defaults; the
    /// `GEXBOT_API_KEY` environment variable overrides the file's key.
    pub fn load(&self) -> Result<Settings> {
        let mut settings = if self.config_file.exists() {
            let raw = std::fs::read_to_string(&self.config_file)?;
            serde_yaml::from_str(&raw)?
        } else {
            warn!(
                "Settings file {} not found, using defaults",
                self.config_file.display()
            );
            Settings::default()
        };

        if let Ok(key) = std::env::var(constants::API_KEY_ENV_VAR) {
            if !key.is_empty() {
                info!("API key loaded from {}", constants::API_KEY_ENV_VAR);
                settings.api_key = key;
            }
        }

        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.config_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_yaml::to_string(settings)?;
        std::fs::write(&self.config_file, raw)?;
        Ok(())
    }
}
