use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH};
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::enrich::JoinSpec;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    #[serde(default)]
    pub references: HashMap<String, ReferenceConfig>,
    #[serde(default)]
    pub marketplaces: Vec<MarketplaceConfig>,
    /// Directory the config file lives in; relative paths resolve against it
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    pub mapping_dir: PathBuf,
    pub master_dir: PathBuf,
    pub reference_dir: PathBuf,
    pub report_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceConfig {
    pub file: PathBuf,
    /// Member holding the row array, when the rows are not top-level
    #[serde(default)]
    pub records: Option<String>,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketplaceConfig {
    pub name: String,
    pub mapping: PathBuf,
    pub master: PathBuf,
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
}

impl PipelineConfig {
    /// Loads the config named by `EC_PIPELINE_CONFIG`, falling back to
    /// `config/pipeline.toml`. A `.env` file is honoured.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        let path = std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_toml_str(&content, base_dir)
    }

    pub fn from_toml_str(content: &str, base_dir: PathBuf) -> Result<Self> {
        let mut config: PipelineConfig = toml::from_str(content)?;
        config.base_dir = base_dir;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = Vec::new();
        for market in &self.marketplaces {
            if seen.contains(&market.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "marketplace '{}' configured twice",
                    market.name
                )));
            }
            seen.push(market.name.as_str());
            for join in &market.joins {
                if !self.references.contains_key(&join.reference) {
                    return Err(PipelineError::Config(format!(
                        "marketplace '{}' joins unknown reference '{}'",
                        market.name, join.reference
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn marketplace(&self, name: &str) -> Result<&MarketplaceConfig> {
        self.marketplaces
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| PipelineError::Config(format!("unknown marketplace '{}'", name)))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn mapping_path(&self, market: &MarketplaceConfig) -> PathBuf {
        self.resolve(&self.paths.mapping_dir).join(&market.mapping)
    }

    pub fn master_path(&self, market: &MarketplaceConfig) -> PathBuf {
        self.resolve(&self.paths.master_dir).join(&market.master)
    }

    pub fn reference_path(&self, reference: &ReferenceConfig) -> PathBuf {
        self.resolve(&self.paths.reference_dir).join(&reference.file)
    }

    pub fn report_dir(&self) -> PathBuf {
        self.resolve(&self.paths.report_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.paths.log_dir)
    }
}
