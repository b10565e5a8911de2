//! Configuration types for Parley

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::conversation::SummarizerConfig;
use crate::error::{ParleyError, Result};
use crate::llm::RetryPolicy;
use crate::llm::providers::{DEFAULT_BASE_URL, DEFAULT_MODEL, OpenAICompatibleProvider};
use crate::session::{BudgetConfig, SessionConfig};

/// Environment variables checked for an API key, in order
pub const API_KEY_VARS: [&str; 2] = ["GITHUB_TOKEN", "OPENAI_API_KEY"];

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ParleyConfig {
    /// Completion service connection
    pub llm: LlmConfig,

    /// Context budget per session
    pub budget: BudgetConfig,

    /// Retry behaviour for completion calls
    pub retry: RetryPolicy,

    /// Summary call settings
    pub summarizer: SummarizerConfig,

    /// Instructions and action-loop limits
    pub session: SessionConfig,
}

/// Completion service connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model identifier
    pub model: String,

    /// OpenAI-compatible endpoint
    pub base_url: String,

    /// API key; falls back to [`API_KEY_VARS`] when unset
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Per-request HTTP timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
        }
    }
}

impl LlmConfig {
    /// Configured key, else the first non-empty key variable
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| {
                API_KEY_VARS
                    .iter()
                    .filter_map(|name| std::env::var(name).ok())
                    .find(|value| !value.is_empty())
            })
    }

    /// Build the provider these settings describe
    ///
    /// # Errors
    ///
    /// Returns an error if no API key is available or the HTTP client cannot
    /// be built.
    pub fn build_provider(&self) -> Result<OpenAICompatibleProvider> {
        let api_key = self.resolve_api_key().ok_or_else(|| {
            ParleyError::Configuration(format!(
                "no API key configured; set llm.api_key or one of {}",
                API_KEY_VARS.join(", ")
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ParleyError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(
            OpenAICompatibleProvider::with_base_url(api_key, &self.model, &self.base_url)
                .with_client(client),
        )
    }
}

impl ParleyConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `parley.toml` in the working directory
    /// 3. The file named by `PARLEY_CONFIG_PATH`
    /// 4. `PARLEY_`-prefixed environment variables, `__` separating sections
    ///    (e.g. `PARLEY_BUDGET__MAX_TOTAL_SIZE=4000`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is invalid or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Like [`load`](Self::load), with `path` taking the place of
    /// `PARLEY_CONFIG_PATH` in the third layer
    ///
    /// # Errors
    ///
    /// Returns an error if `path` does not exist, a configuration file is
    /// invalid or validation fails.
    pub fn load_with(path: Option<&Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(ParleyConfig::default()))
            .merge(Toml::file("parley.toml"));

        match path {
            Some(path) => {
                if !path.is_file() {
                    return Err(ParleyError::Configuration(format!(
                        "configuration file {} not found",
                        path.display()
                    )));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                if let Ok(path) = std::env::var("PARLEY_CONFIG_PATH") {
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        let config: ParleyConfig = figment
            .merge(Env::prefixed("PARLEY_").split("__"))
            .extract()
            .map_err(|e| {
                ParleyError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or validation fails.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: ParleyConfig = Figment::from(Serialized::defaults(ParleyConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .extract()
            .map_err(|e| {
                ParleyError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no session could run with
    pub fn validate(&self) -> Result<()> {
        self.budget.validate()?;

        self.retry.validate()?;
        if self.session.max_tool_rounds == 0 {
            return Err(ParleyError::Configuration(
                "session.max_tool_rounds must be at least 1".to_string(),
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ParleyError::Configuration("llm.model must not be empty".to_string()));
        }
        Ok(())
    }
}
