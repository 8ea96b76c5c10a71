//! Layered configuration: CLI flags > environment variables (`PUBLINK_*`)
//! > an optional TOML file (`--config`, default `publink.toml` if
//! present) > built-in defaults. `ConfigError` is raised eagerly, before
//! any network call, for anything that would otherwise fail deep inside
//! a run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::PublinkError;
use crate::sources::llm::ReasoningEffort;

#[derive(Debug, Clone)]
pub struct Config {
    pub models: ModelConfig,
    pub reasoning: ReasoningConfig,
    pub strategies: Vec<String>,
    pub max_tokens_query_v1: u32,
    pub max_tokens_query_v2: u32,
    pub max_tokens_results: u32,
    pub max_requests_per_batch: u32,
    pub max_bytes_per_batch: u64,
    pub safety_buffer: f64,
    pub max_tokens_per_day: u64,
    pub completion_window: String,
    pub cache_ttl: HashMap<String, u64>,
    pub system_prompts: SystemPrompts,
    pub pricing: HashMap<String, ModelPricing>,
    pub http_no_cache: bool,
    pub registries: RegistryBases,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub query_v1: String,
    pub query_v2: String,
    pub results: String,
}

#[derive(Debug, Clone)]
pub struct ReasoningConfig {
    pub query_v1: ReasoningEffort,
    pub query_v2: ReasoningEffort,
    pub results: ReasoningEffort,
}

#[derive(Debug, Clone)]
pub struct SystemPrompts {
    pub query_v1: PathBuf,
    pub query_v2: PathBuf,
    pub results: PathBuf,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryBases {
    pub ctgov_base: Option<String>,
    pub euctr_base: Option<String>,
    pub drks_base: Option<String>,
}

const DEFAULT_CACHE_TTL_DEFAULT: u64 = 7 * 24 * 3600;

impl Default for Config {
    fn default() -> Self {
        let mut cache_ttl = HashMap::new();
        cache_ttl.insert("default".to_string(), DEFAULT_CACHE_TTL_DEFAULT);
        cache_ttl.insert("pubmed-naive".to_string(), 7 * 24 * 3600);
        cache_ttl.insert("linked-at-registration".to_string(), 30 * 24 * 3600);
        cache_ttl.insert("gpt-query".to_string(), 90 * 24 * 3600);

        let mut pricing = HashMap::new();
        pricing.insert(
            "gpt-5".to_string(),
            ModelPricing { input_per_million: 5.0, output_per_million: 15.0 },
        );

        Self {
            models: ModelConfig {
                query_v1: "gpt-5".to_string(),
                query_v2: "gpt-5".to_string(),
                results: "gpt-5".to_string(),
            },
            reasoning: ReasoningConfig {
                query_v1: ReasoningEffort::Low,
                query_v2: ReasoningEffort::Low,
                results: ReasoningEffort::Medium,
            },
            strategies: crate::model::ALL_STRATEGY_IDS.iter().map(|s| s.to_string()).collect(),
            max_tokens_query_v1: 512,
            max_tokens_query_v2: 1024,
            max_tokens_results: 256,
            max_requests_per_batch: 5_000,
            max_bytes_per_batch: 100 * 1024 * 1024,
            safety_buffer: 0.9,
            max_tokens_per_day: 2_000_000,
            completion_window: "24h".to_string(),
            cache_ttl,
            system_prompts: SystemPrompts {
                query_v1: PathBuf::from("prompts/query_v1.txt"),
                query_v2: PathBuf::from("prompts/query_v2.txt"),
                results: PathBuf::from("prompts/results.txt"),
            },
            pricing,
            http_no_cache: false,
            registries: RegistryBases::default(),
        }
    }
}

impl Config {
    /// Effective byte cap a chunk must not exceed: `floor(maxBytesPerBatch * safetyBuffer)`.
    pub fn effective_max_bytes(&self) -> u64 {
        (self.max_bytes_per_batch as f64 * self.safety_buffer).floor() as u64
    }

    pub fn cache_ttl_for(&self, cache_type: &str) -> u64 {
        self.cache_ttl
            .get(cache_type)
            .copied()
            .unwrap_or(DEFAULT_CACHE_TTL_DEFAULT)
    }

    /// Load the config file (if present) and apply environment overrides,
    /// then validate. Does not touch the network.
    pub fn load(config_path: Option<&Path>) -> Result<Self, PublinkError> {
        let mut config = Config::default();

        let file_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("publink.toml"));
        if file_path.exists() {
            let text = std::fs::read_to_string(&file_path).map_err(PublinkError::CacheIo)?;
            let raw: RawConfig = toml::from_str(&text)
                .map_err(|err| PublinkError::config(format!("invalid config file {}: {err}", file_path.display())))?;
            raw.apply(&mut config);
        } else if config_path.is_some() {
            return Err(PublinkError::config(format!(
                "config file not found: {}",
                file_path.display()
            )));
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("PUBLINK_NO_CACHE") {
            self.http_no_cache = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("PUBLINK_MAX_TOKENS_PER_DAY")
            && let Ok(parsed) = v.parse()
        {
            self.max_tokens_per_day = parsed;
        }
        if let Ok(v) = std::env::var("PUBLINK_MAX_REQUESTS_PER_BATCH")
            && let Ok(parsed) = v.parse()
        {
            self.max_requests_per_batch = parsed;
        }
        if let Ok(v) = std::env::var("PUBLINK_CTGOV_BASE") {
            self.registries.ctgov_base = Some(v);
        }
        if let Ok(v) = std::env::var("PUBLINK_EUCTR_BASE") {
            self.registries.euctr_base = Some(v);
        }
        if let Ok(v) = std::env::var("PUBLINK_DRKS_BASE") {
            self.registries.drks_base = Some(v);
        }
    }

    fn validate(&self) -> Result<(), PublinkError> {
        for strategy in &self.strategies {
            if !crate::model::ALL_STRATEGY_IDS.contains(&strategy.as_str()) {
                return Err(PublinkError::config(format!("unknown strategy in batch.strategies: {strategy}")));
            }
        }
        if !(0.0 < self.safety_buffer && self.safety_buffer <= 1.0) {
            return Err(PublinkError::config(format!(
                "batch.safetyBuffer must be in (0, 1], got {}",
                self.safety_buffer
            )));
        }
        if self.max_requests_per_batch == 0 {
            return Err(PublinkError::config("batch.maxRequestsPerBatch must be > 0"));
        }
        for path in [
            &self.system_prompts.query_v1,
            &self.system_prompts.query_v2,
            &self.system_prompts.results,
        ] {
            if !path.exists() {
                return Err(PublinkError::config(format!(
                    "configured system prompt file does not exist: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    models: Option<RawModels>,
    reasoning: Option<RawReasoning>,
    batch: Option<RawBatch>,
    cache: Option<RawCache>,
    #[serde(rename = "systemPrompts")]
    system_prompts: Option<RawSystemPrompts>,
}

#[derive(Debug, Default, Deserialize)]
struct RawModels {
    #[serde(rename = "queryV1")]
    query_v1: Option<String>,
    #[serde(rename = "queryV2")]
    query_v2: Option<String>,
    results: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReasoning {
    #[serde(rename = "queryV1")]
    query_v1: Option<ReasoningEffort>,
    #[serde(rename = "queryV2")]
    query_v2: Option<ReasoningEffort>,
    results: Option<ReasoningEffort>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBatch {
    strategies: Option<Vec<String>>,
    #[serde(rename = "maxTokensQueryV1")]
    max_tokens_query_v1: Option<u32>,
    #[serde(rename = "maxTokensQueryV2")]
    max_tokens_query_v2: Option<u32>,
    #[serde(rename = "maxTokensResults")]
    max_tokens_results: Option<u32>,
    #[serde(rename = "maxRequestsPerBatch")]
    max_requests_per_batch: Option<u32>,
    #[serde(rename = "maxBytesPerBatch")]
    max_bytes_per_batch: Option<u64>,
    #[serde(rename = "safetyBuffer")]
    safety_buffer: Option<f64>,
    #[serde(rename = "maxTokensPerDay")]
    max_tokens_per_day: Option<u64>,
    #[serde(rename = "completionWindow")]
    completion_window: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCache {
    ttl: Option<HashMap<String, u64>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSystemPrompts {
    #[serde(rename = "queryV1")]
    query_v1: Option<PathBuf>,
    #[serde(rename = "queryV2")]
    query_v2: Option<PathBuf>,
    results: Option<PathBuf>,
}

impl RawConfig {
    fn apply(self, config: &mut Config) {
        if let Some(models) = self.models {
            if let Some(v) = models.query_v1 {
                config.models.query_v1 = v;
            }
            if let Some(v) = models.query_v2 {
                config.models.query_v2 = v;
            }
            if let Some(v) = models.results {
                config.models.results = v;
            }
        }
        if let Some(reasoning) = self.reasoning {
            if let Some(v) = reasoning.query_v1 {
                config.reasoning.query_v1 = v;
            }
            if let Some(v) = reasoning.query_v2 {
                config.reasoning.query_v2 = v;
            }
            if let Some(v) = reasoning.results {
                config.reasoning.results = v;
            }
        }
        if let Some(batch) = self.batch {
            if let Some(v) = batch.strategies {
                config.strategies = v;
            }
            if let Some(v) = batch.max_tokens_query_v1 {
                config.max_tokens_query_v1 = v;
            }
            if let Some(v) = batch.max_tokens_query_v2 {
                config.max_tokens_query_v2 = v;
            }
            if let Some(v) = batch.max_tokens_results {
                config.max_tokens_results = v;
            }
            if let Some(v) = batch.max_requests_per_batch {
                config.max_requests_per_batch = v;
            }
            if let Some(v) = batch.max_bytes_per_batch {
                config.max_bytes_per_batch = v;
            }
            if let Some(v) = batch.safety_buffer {
                config.safety_buffer = v;
            }
            if let Some(v) = batch.max_tokens_per_day {
                config.max_tokens_per_day = v;
            }
            if let Some(v) = batch.completion_window {
                config.completion_window = v;
            }
        }
        if let Some(cache) = self.cache
            && let Some(ttl) = cache.ttl
        {
            for (cache_type, seconds) in ttl {
                config.cache_ttl.insert(cache_type, seconds);
            }
        }
        if let Some(system_prompts) = self.system_prompts {
            if let Some(v) = system_prompts.query_v1 {
                config.system_prompts.query_v1 = v;
            }
            if let Some(v) = system_prompts.query_v2 {
                config.system_prompts.query_v2 = v;
            }
            if let Some(v) = system_prompts.results {
                config.system_prompts.results = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        // System prompt paths are checked for existence; point at files
        // that ship with the repo's default prompt set for this test.
        let mut config = Config::default();
        config.system_prompts = SystemPrompts {
            query_v1: PathBuf::from("Cargo.toml"),
            query_v2: PathBuf::from("Cargo.toml"),
            results: PathBuf::from("Cargo.toml"),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_strategy() {
        let mut config = Config::default();
        config.system_prompts = SystemPrompts {
            query_v1: PathBuf::from("Cargo.toml"),
            query_v2: PathBuf::from("Cargo.toml"),
            results: PathBuf::from("Cargo.toml"),
        };
        config.strategies = vec!["not_a_real_strategy".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_safety_buffer() {
        let mut config = Config::default();
        config.system_prompts = SystemPrompts {
            query_v1: PathBuf::from("Cargo.toml"),
            query_v2: PathBuf::from("Cargo.toml"),
            results: PathBuf::from("Cargo.toml"),
        };
        config.safety_buffer = 0.0;
        assert!(config.validate().is_err());
        config.safety_buffer = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_max_requests_per_batch() {
        let mut config = Config::default();
        config.system_prompts = SystemPrompts {
            query_v1: PathBuf::from("Cargo.toml"),
            query_v2: PathBuf::from("Cargo.toml"),
            results: PathBuf::from("Cargo.toml"),
        };
        config.max_requests_per_batch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn raw_config_applies_every_documented_toml_knob() {
        let toml_text = r#"
            [models]
            queryV1 = "gpt-5-mini"

            [reasoning]
            results = "high"

            [batch]
            maxTokensPerDay = 500000
            maxBytesPerBatch = 1024
            completionWindow = "48h"
            strategies = ["linked_at_registration"]

            [cache.ttl]
            default = 60
            "gpt-query" = 120

            [systemPrompts]
            results = "custom/results.txt"
        "#;
        let raw: RawConfig = toml::from_str(toml_text).unwrap();
        let mut config = Config::default();
        raw.apply(&mut config);

        assert_eq!(config.models.query_v1, "gpt-5-mini");
        assert_eq!(config.reasoning.results, ReasoningEffort::High);
        assert_eq!(config.max_tokens_per_day, 500_000);
        assert_eq!(config.max_bytes_per_batch, 1024);
        assert_eq!(config.completion_window, "48h");
        assert_eq!(config.strategies, vec!["linked_at_registration".to_string()]);
        assert_eq!(config.cache_ttl_for("default"), 60);
        assert_eq!(config.cache_ttl_for("gpt-query"), 120);
        assert_eq!(config.system_prompts.results, PathBuf::from("custom/results.txt"));
    }

    #[test]
    fn effective_max_bytes_applies_safety_buffer() {
        let mut config = Config::default();
        config.max_bytes_per_batch = 1000;
        config.safety_buffer = 0.9;
        assert_eq!(config.effective_max_bytes(), 900);
    }
}
