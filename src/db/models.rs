//! Row types shared across the persistence layer.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of corpus artifact a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Code,
    Conversation,
    Log,
    Summary,
}

impl ChunkKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Conversation => "conversation",
            Self::Log => "log",
            Self::Summary => "summary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(Self::Code),
            "conversation" => Some(Self::Conversation),
            "log" => Some(Self::Log),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

/// Granularity of a derived summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryLevel {
    File,
    Directory,
    Project,
}

impl SummaryLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Project => "project",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "directory" => Some(Self::Directory),
            "project" => Some(Self::Project),
            _ => None,
        }
    }
}

/// An immutable, content-addressed fragment of a corpus artifact.
///
/// `content` is `None` for binary artifacts, which store metadata only and
/// are excluded from retrieval.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: i64,
    pub chunk_uid: String,
    pub project_id: String,
    pub source_path: String,
    pub byte_offset: usize,
    pub token_count: usize,
    pub fingerprint: String,
    pub kind: ChunkKind,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for a chunk insertion; identity fields are derived from the text.
#[derive(Debug, Clone)]
pub struct NewChunk<'a> {
    pub project_id: &'a str,
    pub source_path: &'a str,
    pub byte_offset: usize,
    pub token_count: usize,
    pub kind: ChunkKind,
    /// `None` marks a binary artifact (metadata-only row).
    pub content: Option<&'a str>,
}

/// A derived summary row. Regenerations insert a new row and mark the old
/// one superseded; rows are never mutated in place.
#[derive(Debug, Clone)]
pub struct SummaryRecord {
    pub id: i64,
    pub summary_uid: String,
    pub project_id: String,
    pub scope_path: String,
    pub level: SummaryLevel,
    pub content: String,
    pub token_count: usize,
    pub source_chunk_uids: Vec<String>,
    pub superseded: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSummary<'a> {
    pub project_id: &'a str,
    pub scope_path: &'a str,
    pub level: SummaryLevel,
    pub content: &'a str,
    pub token_count: usize,
    pub source_chunk_uids: &'a [String],
}

/// Terminal status of a recorded model call or state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ok,
    Failed,
    Degraded,
    Cancelled,
}

impl CallStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Degraded => "degraded",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "failed" => Some(Self::Failed),
            "degraded" => Some(Self::Degraded),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Append-only provenance entry: which chunks/summaries fed one model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCallRecord {
    pub call_id: String,
    pub session_id: String,
    pub model: String,
    pub status: CallStatus,
    /// Which orchestration phase produced this call (planning, expanding…).
    pub phase: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub chunk_uids: Vec<String>,
    pub created_at: DateTime<Utc>,
}
