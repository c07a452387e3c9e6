//! Error taxonomy for the context assembly engine.
//!
//! Budget-too-small is deliberately *not* here: an undersized budget produces
//! an empty bundle with a warning flag, never a failure.

use thiserror::Error;

/// Errors surfaced by the engine's public operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("chunk of {got} tokens exceeds maximum of {max}; callers must pre-split")]
    ChunkTooLarge { got: usize, max: usize },

    #[error("planning failed: {0}")]
    Planning(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("verification still failing after {cycles} repair cycles")]
    VerificationFailed { cycles: usize },

    #[error("hot-window fingerprint mismatch for {0}")]
    CacheInconsistency(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("embedder error: {0}")]
    Embedder(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
