use std::path::Path;

use anyhow::{bail, Context, Result};
use hivesift_schema::SourceKind;
use serde::{Deserialize, Serialize};

fn default_preferred_order() -> Vec<SourceKind> {
    vec![SourceKind::Stream, SourceKind::Rest]
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_feed_timeout_secs() -> u64 {
    10
}

fn default_page_size() -> usize {
    50
}

fn default_max_parallel() -> usize {
    4
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_budget_chars() -> usize {
    48_000
}

fn default_excerpt_chars() -> usize {
    240
}

fn default_model_id() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_model_timeout_secs() -> u64 {
    60
}

fn default_window_days() -> i64 {
    7
}

fn default_max_concurrent() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestSourceConfig {
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSourceConfig {
    pub feed_base: String,
    #[serde(default = "default_feed_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_preferred_order")]
    pub preferred_order: Vec<SourceKind>,
    pub rest: RestSourceConfig,
    pub stream: StreamSourceConfig,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_budget_chars")]
    pub budget_chars: usize,
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            budget_chars: default_budget_chars(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_id")]
    pub id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub pricing: Option<PricingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeConfig {
    #[serde(default = "default_window_days")]
    pub default_window_days: i64,
}

impl Default for TimeframeConfig {
    fn default() -> Self {
        Self {
            default_window_days: default_window_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainConfig {
    pub sources: SourcesConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub timeframe: TimeframeConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl MainConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.preferred_order.is_empty() {
            bail!("sources.preferred_order must name at least one source");
        }
        let mut seen = Vec::new();
        for kind in &self.sources.preferred_order {
            if seen.contains(kind) {
                bail!("sources.preferred_order lists {kind} twice");
            }
            seen.push(*kind);
        }
        if self.compression.budget_chars == 0 {
            bail!("compression.budget_chars must be positive");
        }
        if self.runtime.max_concurrent == 0 {
            bail!("runtime.max_concurrent must be positive");
        }
        Ok(())
    }
}
