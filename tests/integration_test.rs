//! End-to-end tests: ingest → summarize → assemble → generate through the
//! public engine facade.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use contextloom::config::Config;
use contextloom::db::Db;
use contextloom::db::models::{CallStatus, ChunkKind};
use contextloom::embedder::{Embedder, EmbedderError};
use contextloom::engine::Engine;
use contextloom::model::mock::MockModel;
use contextloom::orchestrator::GenerateRequest;
use contextloom::sandbox::{ScriptedSandbox, TestReport};
use contextloom::tokenizer::TokenizerRegistry;

const PLAN_JSON: &str = r#"{
    "summary": "Adjust the alpha module.",
    "steps": [{"description": "Edit the alpha routine", "paths": ["a.rs"]}],
    "target_paths": ["a.rs"]
}"#;

/// Embeds onto a fixed axis per keyword so relevance is exact: texts
/// sharing a keyword are identical in embedding space, others orthogonal.
struct KeywordEmbedder;

const KEYWORDS: [&str; 3] = ["alpha", "beta", "gamma"];

impl Embedder for KeywordEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut v = vec![0.0f32; 8];
        for (axis, kw) in KEYWORDS.iter().enumerate() {
            if text.contains(kw) {
                v[axis] = 1.0;
            }
        }
        if v.iter().all(|x| *x == 0.0) {
            v[7] = 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        Ok(v.into_iter().map(|x| x / norm).collect())
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        8
    }
}

struct Harness {
    engine: Engine,
    model: Arc<MockModel>,
    sandbox: Arc<ScriptedSandbox>,
}

fn harness() -> Harness {
    let config = Config::default();
    let db = Db::open_in_memory(8).unwrap();
    let model = Arc::new(MockModel::new());
    let sandbox = Arc::new(ScriptedSandbox::new());
    let engine = Engine::new(
        config,
        db,
        Arc::new(KeywordEmbedder),
        TokenizerRegistry::with_builtin_families(),
        model.clone(),
        sandbox.clone(),
    );
    Harness {
        engine,
        model,
        sandbox,
    }
}

/// A file of `lines` lines, each mentioning `keyword`. Roughly 11 tokens a
/// line under the builtin heuristic counter.
fn file_text(keyword: &str, lines: usize) -> String {
    (0..lines)
        .map(|i| format!("{keyword} line {i} with steady filler words here\n"))
        .collect()
}

/// A one-line summary around 560 tokens; too big to trim at a line boundary.
fn long_summary(tag: &str) -> String {
    format!("{tag} {}", "detail ".repeat(320))
}

/// Queue the model replies one ingest consumes: file summary, directory
/// summary and (first time only) project summary.
fn script_summaries(model: &MockModel, tag: &str, with_project: bool) {
    model.push_ok(&long_summary(&format!("file summary of {tag}")));
    model.push_ok(&long_summary(&format!("directory summary near {tag}")));
    if with_project {
        model.push_ok(&long_summary("project summary"));
    }
}

async fn ingest_corpus(h: &Harness) -> (Vec<String>, Vec<String>, Vec<String>) {
    let cancel = CancellationToken::new();
    script_summaries(&h.model, "a.rs", true);
    let a = h
        .engine
        .ingest("proj-1", "a.rs", &file_text("alpha", 140), ChunkKind::Code, &cancel)
        .await
        .unwrap();
    // Project summary refresh is debounced after the first ingest
    script_summaries(&h.model, "b.rs", false);
    let b = h
        .engine
        .ingest("proj-1", "b.rs", &file_text("beta", 140), ChunkKind::Code, &cancel)
        .await
        .unwrap();
    script_summaries(&h.model, "c.rs", false);
    let c = h
        .engine
        .ingest("proj-1", "c.rs", &file_text("gamma", 140), ChunkKind::Code, &cancel)
        .await
        .unwrap();
    (a.chunk_uids, b.chunk_uids, c.chunk_uids)
}

#[tokio::test]
async fn test_assembly_selects_only_the_relevant_file_plus_summary() {
    let h = harness();
    let (a_uids, b_uids, c_uids) = ingest_corpus(&h).await;

    // Budget 5,000 minus the 2,000 safety margin leaves 3,000 tokens
    let response = h
        .engine
        .assemble("proj-1", "alpha", Some(5_000), &[], None)
        .await
        .unwrap();

    assert!(response.tokens_used <= 3_000);
    let ids: Vec<&str> = response.pieces.iter().map(|p| p.id.as_str()).collect();
    for uid in &a_uids {
        assert!(ids.contains(&uid.as_str()), "every chunk of a.rs is included");
    }
    for uid in b_uids.iter().chain(&c_uids) {
        assert!(!ids.contains(&uid.as_str()), "unrelated files stay out");
    }
    // Exactly one summary backfills the leftover budget
    assert_eq!(response.pieces.len(), a_uids.len() + 1);
    let summary = response.pieces.last().unwrap();
    assert!(summary.preview.contains("file summary of a.rs"));
}

#[tokio::test]
async fn test_assembly_repeats_identically() {
    let h = harness();
    ingest_corpus(&h).await;

    let first = h
        .engine
        .assemble("proj-1", "alpha", Some(5_000), &[], None)
        .await
        .unwrap();
    let second = h
        .engine
        .assemble("proj-1", "alpha", Some(5_000), &[], None)
        .await
        .unwrap();

    let ids = |r: &contextloom::engine::AssembleResponse| {
        r.pieces.iter().map(|p| p.id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(first.tokens_used, second.tokens_used);
}

#[tokio::test]
async fn test_undersized_budget_warns_without_failing() {
    let h = harness();
    ingest_corpus(&h).await;

    let response = h
        .engine
        .assemble("proj-1", "alpha", Some(100), &[], None)
        .await
        .unwrap();

    assert!(response.pieces.is_empty());
    assert_eq!(response.tokens_used, 0);
    assert!(!response.warnings.is_empty(), "warning flag, not an error");
}

#[tokio::test]
async fn test_ingest_is_idempotent_across_calls() {
    let h = harness();
    let cancel = CancellationToken::new();
    let text = file_text("alpha", 140);

    script_summaries(&h.model, "a.rs", true);
    let first = h
        .engine
        .ingest("proj-1", "a.rs", &text, ChunkKind::Code, &cancel)
        .await
        .unwrap();

    // Unchanged bytes: no new chunks, no summary refresh, stable uids
    let second = h
        .engine
        .ingest("proj-1", "a.rs", &text, ChunkKind::Code, &cancel)
        .await
        .unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.chunk_uids, first.chunk_uids);
    assert_eq!(h.model.call_count(), 3, "no model calls for a no-op ingest");
}

#[tokio::test]
async fn test_generation_happy_path_records_provenance() {
    let h = harness();
    ingest_corpus(&h).await;
    h.model.push_ok(PLAN_JSON);
    h.model.push_ok("--- a/a.rs\n+++ b/a.rs\n");

    let session_id = h.engine.create_session("proj-1");
    let outcome = h
        .engine
        .generate(
            GenerateRequest {
                request_id: "req-1".to_string(),
                project_id: "proj-1".to_string(),
                session_id: session_id.clone(),
                prompt: "rework the alpha routine".to_string(),
                max_context_tokens: 100_000,
                hot_paths: vec![],
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, CallStatus::Ok);
    assert_eq!(outcome.plan_summary, "Adjust the alpha module.");
    assert!(!outcome.sources.is_empty());

    let calls = h.engine.session_calls(&session_id).await.unwrap();
    let phases: Vec<&str> = calls.iter().map(|c| c.phase.as_str()).collect();
    assert_eq!(phases, vec!["planning", "expanding", "verifying"]);

    // Each recorded call names only pieces from the bundle it was sent
    let expanding = calls.iter().find(|c| c.phase == "expanding").unwrap();
    for uid in &expanding.chunk_uids {
        assert!(outcome.sources.contains(uid));
    }

    // Provenance is addressable per call id
    for call_id in &outcome.call_ids {
        assert!(h.engine.provenance(call_id).await.is_ok());
    }
}

#[tokio::test]
async fn test_generation_failure_returns_artifacts_not_bare_error() {
    let h = harness();
    ingest_corpus(&h).await;
    h.model.push_ok(PLAN_JSON);
    h.model.push_ok("diff v1");
    h.model.push_ok("diff v2");
    h.sandbox
        .push_report(TestReport::failing(8, 2, "alpha_test failed: expected 3"));
    h.sandbox
        .push_report(TestReport::failing(8, 1, "alpha_test failed: expected 4"));

    let session_id = h.engine.create_session("proj-1");
    let outcome = h
        .engine
        .generate(
            GenerateRequest {
                request_id: "req-fail".to_string(),
                project_id: "proj-1".to_string(),
                session_id,
                prompt: "rework the alpha routine".to_string(),
                max_context_tokens: 100_000,
                hot_paths: vec![],
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // Terminal failure still hands back the last diff and every log
    assert_eq!(outcome.status, CallStatus::Failed);
    assert_eq!(outcome.repair_cycles, 2);
    assert_eq!(outcome.diff.as_deref(), Some("diff v2"));
    assert_eq!(outcome.failure_logs.len(), 2);
    assert!(outcome.failure_logs[0].contains("expected 3"));
    assert!(outcome.failure_logs[1].contains("expected 4"));
}

#[tokio::test]
async fn test_session_lifecycle() {
    let h = harness();
    ingest_corpus(&h).await;
    h.model.push_ok(PLAN_JSON);
    h.model.push_ok("diff");

    let session_id = h.engine.create_session("proj-1");
    h.engine
        .generate(
            GenerateRequest {
                request_id: "req-1".to_string(),
                project_id: "proj-1".to_string(),
                session_id: session_id.clone(),
                prompt: "alpha change".to_string(),
                max_context_tokens: 100_000,
                hot_paths: vec![],
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    h.engine.expire_session(&session_id);

    // A generation against the expired session fails fast
    let err = h
        .engine
        .generate(
            GenerateRequest {
                request_id: "req-2".to_string(),
                project_id: "proj-1".to_string(),
                session_id,
                prompt: "alpha again".to_string(),
                max_context_tokens: 100_000,
                hot_paths: vec![],
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, contextloom::EngineError::NotFound(_)));
}
