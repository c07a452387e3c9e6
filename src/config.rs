/// Configuration for the context assembly engine.
///
/// Handles loading, validating, and providing default configuration values.
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./contextloom.db".to_string()
}

fn default_model_name() -> String {
    "loom-mini".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_target_chunk_tokens() -> usize {
    512
}

fn default_overlap_tokens() -> usize {
    128
}

fn default_max_chunk_tokens() -> usize {
    8_000
}

fn default_token_budget() -> usize {
    500_000
}

fn default_safety_margin() -> usize {
    2_000
}

fn default_top_k() -> usize {
    500
}

fn default_similarity_weight() -> f64 {
    0.55
}

fn default_recency_weight() -> f64 {
    0.20
}

fn default_hot_path_weight() -> f64 {
    0.15
}

fn default_conversation_weight() -> f64 {
    0.10
}

fn default_recency_window_secs() -> i64 {
    3_600
}

fn default_min_similarity() -> f64 {
    0.6
}

fn default_cache_capacity() -> usize {
    64
}

fn default_session_ttl_secs() -> i64 {
    3_600
}

fn default_debounce_secs() -> u64 {
    30
}

fn default_sandbox_timeout_secs() -> u64 {
    300
}

fn default_max_repair_cycles() -> usize {
    2
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub assembly: AssemblyConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub summarizer: SummarizerConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    /// Generative model identifier. Must be known to the tokenizer registry.
    #[serde(default = "default_model_name")]
    pub name: String,

    /// OpenAI-compatible endpoint base URL. When absent, only mock clients work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_dimensions")]
    pub embedding_dimensions: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_repair_cycles")]
    pub max_repair_cycles: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    /// Target size of one chunk window, in tokens.
    #[serde(default = "default_target_chunk_tokens")]
    pub target_chunk_tokens: usize,

    /// Overlap between adjacent windows of the same artifact, in tokens.
    /// Valid range is 128–512 so boundary-spanning text stays findable
    /// from either neighbor.
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,

    /// Hard cap on a single stored chunk.
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AssemblyConfig {
    #[serde(default = "default_token_budget")]
    pub default_token_budget: usize,

    /// Headroom reserved for the model's reply and system instructions.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: usize,

    /// Candidate pool size fetched from the embedding index.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f64,

    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,

    #[serde(default = "default_hot_path_weight")]
    pub hot_path_weight: f64,

    #[serde(default = "default_conversation_weight")]
    pub conversation_weight: f64,

    /// Chunks created within this window get a recency boost that decays
    /// linearly to zero at the window edge.
    #[serde(default = "default_recency_window_secs")]
    pub recency_window_secs: i64,

    /// Candidates below this similarity score never enter a bundle, no
    /// matter how much budget remains.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SummarizerConfig {
    /// Minimum interval between project-level summary regenerations.
    #[serde(default = "default_debounce_secs")]
    pub project_summary_debounce_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SandboxConfig {
    /// Wall-clock limit on the sandbox patch and test commands; a hung
    /// test run is killed at the limit instead of blocking verification.
    #[serde(default = "default_sandbox_timeout_secs")]
    pub test_timeout_secs: u64,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            model: ModelConfig::default(),
            chunking: ChunkingConfig::default(),
            assembly: AssemblyConfig::default(),
            cache: CacheConfig::default(),
            summarizer: SummarizerConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            endpoint: None,
            api_key: None,
            embedding_dimensions: default_dimensions(),
            request_timeout_secs: default_request_timeout_secs(),
            max_repair_cycles: default_max_repair_cycles(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chunk_tokens: default_target_chunk_tokens(),
            overlap_tokens: default_overlap_tokens(),
            max_chunk_tokens: default_max_chunk_tokens(),
        }
    }
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            default_token_budget: default_token_budget(),
            safety_margin: default_safety_margin(),
            top_k: default_top_k(),
            similarity_weight: default_similarity_weight(),
            recency_weight: default_recency_weight(),
            hot_path_weight: default_hot_path_weight(),
            conversation_weight: default_conversation_weight(),
            recency_window_secs: default_recency_window_secs(),
            min_similarity: default_min_similarity(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            project_summary_debounce_secs: default_debounce_secs(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            test_timeout_secs: default_sandbox_timeout_secs(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"contextloom.json"`.
    /// If the file does not exist, returns a default config and generates
    /// a template file for the default path.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "contextloom.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            if path == "contextloom.json" {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.chunking.target_chunk_tokens > 0,
            "chunking.target_chunk_tokens must be positive"
        );
        anyhow::ensure!(
            (128..=512).contains(&self.chunking.overlap_tokens),
            "chunking.overlap_tokens must be within 128–512"
        );
        anyhow::ensure!(
            self.chunking.overlap_tokens < self.chunking.target_chunk_tokens,
            "chunking.overlap_tokens must be smaller than target_chunk_tokens"
        );
        anyhow::ensure!(
            self.chunking.max_chunk_tokens >= self.chunking.target_chunk_tokens,
            "chunking.max_chunk_tokens must not be below target_chunk_tokens"
        );
        anyhow::ensure!(
            self.model.embedding_dimensions > 0,
            "model.embedding_dimensions must be positive"
        );
        anyhow::ensure!(self.assembly.top_k > 0, "assembly.top_k must be positive");
        anyhow::ensure!(
            self.assembly.default_token_budget > self.assembly.safety_margin,
            "assembly.default_token_budget must exceed the safety margin"
        );
        let weight_sum = self.assembly.similarity_weight
            + self.assembly.recency_weight
            + self.assembly.hot_path_weight
            + self.assembly.conversation_weight;
        anyhow::ensure!(
            (weight_sum - 1.0).abs() < 1e-6,
            "assembly priority weights must sum to 1.0, got {weight_sum}"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.assembly.min_similarity),
            "assembly.min_similarity must be within [0, 1)"
        );
        anyhow::ensure!(self.cache.capacity > 0, "cache.capacity must be positive");
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.chunking.target_chunk_tokens, 512);
        assert_eq!(config.chunking.overlap_tokens, 128);
        assert_eq!(config.chunking.max_chunk_tokens, 8_000);
        assert_eq!(config.assembly.default_token_budget, 500_000);
        assert_eq!(config.assembly.safety_margin, 2_000);
        assert_eq!(config.assembly.top_k, 500);
        assert_eq!(config.model.embedding_dimensions, 384);
        assert_eq!(config.model.max_repair_cycles, 2);
        assert_eq!(config.summarizer.project_summary_debounce_secs, 30);
        assert_eq!(config.sandbox.test_timeout_secs, 300);
        // Both second-denominated fields feed Duration::from_secs directly
        let _ = std::time::Duration::from_secs(config.summarizer.project_summary_debounce_secs);
        let _ = std::time::Duration::from_secs(config.sandbox.test_timeout_secs);
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"{"db_path": "./test.db", "assembly": {"safety_margin": 500}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.db_path, "./test.db");
        assert_eq!(config.assembly.safety_margin, 500);
        // Other fields should have defaults
        assert_eq!(config.assembly.top_k, 500);
        assert_eq!(config.chunking.target_chunk_tokens, 512);
    }

    #[test]
    fn test_validate_ok() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bad_overlap() {
        let mut config = Config::default();
        config.chunking.overlap_tokens = 64;
        assert!(config.validate().is_err());
        config.chunking.overlap_tokens = 513;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_weights_must_sum_to_one() {
        let mut config = Config::default();
        config.assembly.similarity_weight = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_budget_above_margin() {
        let mut config = Config::default();
        config.assembly.default_token_budget = 1_000;
        config.assembly.safety_margin = 2_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.db_path, config.db_path);
        assert_eq!(parsed.assembly.top_k, config.assembly.top_k);
        assert_eq!(parsed.model.name, config.model.name);
    }
}
