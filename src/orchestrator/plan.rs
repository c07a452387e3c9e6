//! Strict decoding of the model's generation plan.
//!
//! The plan is a JSON document with a fixed schema. Unknown fields and
//! structural mismatches are decode failures, not things to scrape around;
//! a failed decode surfaces as [`EngineError::Planning`] and the caller
//! retries once with a stricter instruction.
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// The structured plan a model must produce in the planning phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationPlan {
    /// One-paragraph statement of the intended change.
    pub summary: String,
    /// Ordered steps; each may implicate specific files.
    pub steps: Vec<PlanStep>,
    /// Files the plan expects to touch; fed into the expansion bundle as
    /// hot paths.
    #[serde(default)]
    pub target_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanStep {
    pub description: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// JSON schema description embedded in planning prompts.
pub const PLAN_SCHEMA_HINT: &str = r#"Respond with exactly one JSON object, no prose:
{
  "summary": "<one paragraph>",
  "steps": [{"description": "<step>", "paths": ["<relative path>"]}],
  "target_paths": ["<relative path>"]
}
No fields other than these."#;

/// Decode a model response into a [`GenerationPlan`].
///
/// Tolerates a single fenced code block around the JSON; everything else
/// must match the schema exactly.
pub fn decode_plan(text: &str) -> Result<GenerationPlan> {
    let body = strip_fence(text.trim());
    let plan: GenerationPlan = serde_json::from_str(body)
        .map_err(|e| EngineError::Planning(format!("plan does not match schema: {e}")))?;

    if plan.summary.trim().is_empty() {
        return Err(EngineError::Planning("plan summary is empty".to_string()));
    }
    if plan.steps.is_empty() {
        return Err(EngineError::Planning("plan has no steps".to_string()));
    }
    Ok(plan)
}

/// Strip one surrounding markdown code fence, with or without a language tag.
fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(rest) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop the language tag line ("json", "jsonc", ...) if present
    match rest.split_once('\n') {
        Some((first, body)) if !first.trim_start().starts_with('{') => body,
        _ => rest,
    }
}
