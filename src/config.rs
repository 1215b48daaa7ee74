//! Configuration
//!
//! Settings for the schema generation side of the crate: which model the
//! external generator should use and how sample documents are reduced before
//! they are handed to it. The extraction engine takes no configuration.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, ScrapeError};

static GLOBAL_CONFIG: OnceCell<ScraperConfig> = OnceCell::new();

/// Top-level configuration, usually loaded from a TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub generator: GeneratorConfig,
    pub reduction: ReductionConfig,
    /// Base URL used by the `absolute_url` transform when the document has none
    pub base_url: Option<String>,
}

/// Model/provider settings forwarded to an external generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub model: String,
    pub api_base: Option<String>,
    /// Name of the environment variable holding the credential
    pub api_key_env: String,
    pub temperature: f32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_base: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.0,
        }
    }
}

/// How a sample document is shrunk before schema generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    /// Consecutive siblings with the same tag and class kept before truncating
    pub max_repeated_siblings: usize,
    /// Upper bound on the reduced markup, in bytes
    pub max_length: usize,
    /// Elements dropped entirely, with their content
    pub strip_tags: Vec<String>,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            max_repeated_siblings: 3,
            max_length: 60_000,
            strip_tags: [
                "script", "style", "noscript", "svg", "iframe", "template", "link", "meta",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl ScraperConfig {
    pub fn validate(&self) -> Result<()> {
        if self.generator.model.trim().is_empty() {
            return Err(ScrapeError::Config("generator.model must not be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.generator.temperature) {
            return Err(ScrapeError::Config(format!(
                "generator.temperature must be within 0.0..=2.0, got {}",
                self.generator.temperature
            )));
        }
        if self.reduction.max_repeated_siblings == 0 {
            return Err(ScrapeError::Config(
                "reduction.max_repeated_siblings must be greater than 0".to_string(),
            ));
        }
        if self.reduction.max_length == 0 {
            return Err(ScrapeError::Config(
                "reduction.max_length must be greater than 0".to_string(),
            ));
        }
        if let Some(base) = &self.base_url {
            url::Url::parse(base)
                .map_err(|e| ScrapeError::Config(format!("base_url {:?}: {}", base, e)))?;
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: ScraperConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ScrapeError::Config(format!("Failed to serialize to TOML: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }
}

/// Install the process-wide configuration. Fails if one is already installed.
pub fn init_config(config: ScraperConfig) -> Result<()> {
    config.validate()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| ScrapeError::Config("configuration already initialized".to_string()))
}

/// The process-wide configuration, or the defaults if none was installed
pub fn config() -> &'static ScraperConfig {
    GLOBAL_CONFIG.get_or_init(ScraperConfig::default)
}
