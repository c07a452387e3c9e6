/// Model-aware token counting.
///
/// Budget math has to be exact per target model: different model families
/// segment text differently, and a single global approximation would let
/// assembled bundles blow past the real context window. The registry maps a
/// model identifier to a counter for its family — either an exact
/// HuggingFace tokenizer loaded from a `tokenizer.json`, or a per-family
/// character heuristic for families without a local vocabulary file.
///
/// Counts are computed once at ingest and stored on chunk/summary rows;
/// assembly reads the stored counts and only re-counts when trimming.
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result as AnyResult;
use tokenizers::Tokenizer;

use crate::error::{EngineError, Result};

enum Counter {
    /// Exact subword tokenizer (BPE / WordPiece / SentencePiece).
    Exact(Box<Tokenizer>),
    /// Mean characters per token for the family. Deterministic, rounds up.
    Heuristic(f64),
}

/// Registry of model families and their token counters.
///
/// Lookup is by longest matching prefix, so `"loom-mini-2025"` resolves to
/// the `"loom-"` family.
pub struct TokenizerRegistry {
    families: BTreeMap<String, Counter>,
}

impl TokenizerRegistry {
    /// Registry with the built-in heuristic families.
    #[must_use]
    pub fn with_builtin_families() -> Self {
        let mut families = BTreeMap::new();
        // Chars-per-token calibrated against the public tokenizers for each
        // family on mixed English/code corpora.
        families.insert("loom-".to_string(), Counter::Heuristic(4.0));
        families.insert("gpt-".to_string(), Counter::Heuristic(4.0));
        families.insert("claude-".to_string(), Counter::Heuristic(3.8));
        families.insert("e5-".to_string(), Counter::Heuristic(3.5));
        Self { families }
    }

    /// Register an exact tokenizer for a model family prefix from a
    /// `tokenizer.json` file. Replaces any existing counter for the prefix.
    pub fn register_exact(&mut self, prefix: &str, tokenizer_path: &Path) -> AnyResult<()> {
        anyhow::ensure!(
            tokenizer_path.exists(),
            "tokenizer.json not found at {}",
            tokenizer_path.display()
        );
        let inner = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
        self.families
            .insert(prefix.to_string(), Counter::Exact(Box::new(inner)));
        Ok(())
    }

    /// Register a heuristic family.
    pub fn register_heuristic(&mut self, prefix: &str, chars_per_token: f64) {
        self.families
            .insert(prefix.to_string(), Counter::Heuristic(chars_per_token));
    }

    fn resolve(&self, model_id: &str) -> Result<&Counter> {
        self.families
            .iter()
            .filter(|(prefix, _)| model_id.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, counter)| counter)
            .ok_or_else(|| EngineError::UnsupportedModel(model_id.to_string()))
    }

    /// Count the tokens `text` occupies for `model_id`.
    ///
    /// Fails with [`EngineError::UnsupportedModel`] for unknown identifiers.
    pub fn count_tokens(&self, text: &str, model_id: &str) -> Result<usize> {
        if text.is_empty() {
            // Still validate the model id so a bad caller fails loudly.
            self.resolve(model_id)?;
            return Ok(0);
        }
        match self.resolve(model_id)? {
            Counter::Exact(tokenizer) => {
                let encoding = tokenizer
                    .encode(text, false)
                    .map_err(|e| EngineError::Embedder(format!("tokenize failed: {e}")))?;
                Ok(encoding.get_ids().len())
            }
            Counter::Heuristic(chars_per_token) => {
                let chars = text.chars().count();
                Ok(((chars as f64) / chars_per_token).ceil() as usize)
            }
        }
    }

    /// Whether a model id resolves to a known family.
    #[must_use]
    pub fn supports(&self, model_id: &str) -> bool {
        self.resolve(model_id).is_ok()
    }
}

impl Default for TokenizerRegistry {
    fn default() -> Self {
        Self::with_builtin_families()
    }
}
