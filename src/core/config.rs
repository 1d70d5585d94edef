use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};
use tracing::debug;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: usize,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_retries() -> usize {
    3
}

fn default_freshness_hours() -> i64 {
    24
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            base_url: "https://www.cbr-xml-daily.ru".to_string(),
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub source: SourceConfig,
    /// The source publishes once daily; a cached rate set older than this
    /// is refreshed before the next match.
    #[serde(default = "default_freshness_hours")]
    pub freshness_hours: i64,
    pub data_path: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            source: SourceConfig::default(),
            freshness_hours: default_freshness_hours(),
            data_path: None,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        if !config_path.exists() {
            debug!("No config file at {}, using defaults", config_path.display());
            return Ok(Self::default());
        }
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("rs", "kurs", "kurs")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn default_data_path(&self) -> Result<PathBuf> {
        if let Some(custom_path) = &self.data_path {
            return Ok(PathBuf::from(custom_path));
        }
        let proj_dirs = ProjectDirs::from("rs", "kurs", "kurs")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.data_dir().to_path_buf())
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }
}
