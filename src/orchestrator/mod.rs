//! Multi-pass generation orchestrator.
//!
//! State machine per generation request:
//! `Planning → Expanding → Verifying → (Repairing ⇄ Verifying) → Done | Failed`.
//!
//! Planning assembles a small bundle (project summary plus a handful of
//! chunks) and asks the model for a structured plan; expansion assembles the
//! full bundle and asks for a unified diff; verification hands the diff to
//! the sandbox and feeds failing test output back into bounded repair
//! cycles. A model failure after retry degrades to a single-pass call over a
//! smaller bundle instead of failing the request. Every transition writes a
//! provenance record, including cancelled ones.
//!
//! Requests are single-flight per request id: concurrent calls with the same
//! id share one outcome instead of racing divergent repair histories.
pub mod plan;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::assembler::{ALL_SUMMARY_LEVELS, AssembleParams, Assembler, ContextBundle};
use crate::config::Config;
use crate::db::Db;
use crate::db::models::{CallStatus, ModelCallRecord, SummaryLevel};
use crate::error::{EngineError, Result};
use crate::model::{ModelClient, ModelError, ModelRequest, ModelResponse, complete_with_retry};
use crate::orchestrator::plan::{GenerationPlan, PLAN_SCHEMA_HINT, decode_plan};
use crate::sandbox::Sandbox;
use crate::session::SessionRegistry;

/// Token budget for the planning bundle; planning needs orientation, not
/// the whole corpus.
const PLANNING_BUDGET: usize = 16_384;
const PLANNING_TOP_K: usize = 5;
/// Floor for the degraded single-pass bundle.
const DEGRADED_BUDGET_FLOOR: usize = 8_192;

const PLAN_SYSTEM: &str = "You plan code changes for an automated engineer. \
Study the provided context, then produce a plan for the requested change.";
const STRICT_PLAN_REMINDER: &str = "Your previous reply did not decode against the schema. \
Reply with the JSON object only: no prose, no markdown, no extra fields.";
const EXPAND_SYSTEM: &str = "You implement planned code changes. Using the provided context \
and plan, reply with one unified diff implementing the change. Output only the diff.";
const REPAIR_SYSTEM: &str = "Your previous diff failed verification. Using the failing test \
output and context, reply with one corrected unified diff. Output only the diff.";
const DEGRADED_SYSTEM: &str = "Implement the requested change in one pass using the provided \
context. Reply with one unified diff. Output only the diff.";

/// One generation request as accepted by [`Orchestrator::generate`].
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Logical id for the edit; concurrent calls with the same id coalesce.
    pub request_id: String,
    pub project_id: String,
    pub session_id: String,
    pub prompt: String,
    pub max_context_tokens: usize,
    pub hot_paths: Vec<String>,
}

/// Terminal result of one generation request. A failed verification still
/// carries the last diff and every failure log for human inspection.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub request_id: String,
    pub session_id: String,
    pub project_id: String,
    pub status: CallStatus,
    pub plan_summary: String,
    pub diff: Option<String>,
    /// Chunk and summary uids that fed the generation, in bundle order.
    pub sources: Vec<String>,
    pub warnings: Vec<String>,
    pub failure_logs: Vec<String>,
    /// Verification cycles consumed (failed verifications).
    pub repair_cycles: usize,
    /// Provenance ids for every recorded transition.
    pub call_ids: Vec<String>,
}

pub struct Orchestrator {
    db: Arc<TokioMutex<Db>>,
    assembler: Arc<Assembler>,
    model: Arc<dyn ModelClient>,
    sandbox: Arc<dyn Sandbox>,
    sessions: Arc<SessionRegistry>,
    config: Arc<Config>,
    /// Single-flight table: one shared slot per request id.
    inflight: TokioMutex<HashMap<String, Arc<TokioMutex<Option<GenerationOutcome>>>>>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<TokioMutex<Db>>,
        assembler: Arc<Assembler>,
        model: Arc<dyn ModelClient>,
        sandbox: Arc<dyn Sandbox>,
        sessions: Arc<SessionRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            assembler,
            model,
            sandbox,
            sessions,
            config,
            inflight: TokioMutex::new(HashMap::new()),
        }
    }

    /// Run one generation request end to end.
    ///
    /// Calls sharing a `request_id` are coalesced while one is in flight:
    /// the first caller drives the state machine, callers that arrive
    /// before it resolves receive the same outcome through the shared
    /// slot. The slot is dropped from the table once the driving call
    /// resolves, so the table stays bounded by in-flight concurrency and
    /// never retains finished outcomes.
    pub async fn generate(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        let slot = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(request.request_id.clone())
                .or_insert_with(|| Arc::new(TokioMutex::new(None)))
                .clone()
        };

        let mut guard = slot.lock().await;
        if let Some(outcome) = guard.as_ref() {
            info!("Coalesced generation request {}", request.request_id);
            return Ok(outcome.clone());
        }
        let result = self.run(&request, cancel).await;
        if let Ok(outcome) = &result {
            *guard = Some(outcome.clone());
        }
        drop(guard);
        // Waiters that already cloned the slot still read the outcome;
        // everyone else gets a fresh run
        self.inflight.lock().await.remove(&request.request_id);
        result
    }

    async fn run(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        // Fail fast on unknown sessions before any model spend
        self.sessions.get(&request.session_id)?;

        let mut call_ids = Vec::new();
        let mut warnings = Vec::new();

        // ── Planning ─────────────────────────────────────────────────
        let plan_bundle = self
            .assembler
            .assemble(&AssembleParams {
                query: &request.prompt,
                project_id: &request.project_id,
                token_budget: PLANNING_BUDGET,
                hot_paths: &request.hot_paths,
                session_id: Some(&request.session_id),
                top_k: Some(PLANNING_TOP_K),
                summary_levels: &[SummaryLevel::Project],
            })
            .await?;
        warnings.extend(plan_bundle.warnings.iter().cloned());

        let plan_prompt = format!(
            "{}\nTask:\n{}\n\n{PLAN_SCHEMA_HINT}",
            plan_bundle.render(),
            request.prompt
        );

        let first = match self.call_model(PLAN_SYSTEM, &plan_prompt, cancel).await {
            Ok(response) => response,
            Err(outcome) => {
                return self
                    .after_model_failure(
                        request,
                        "planning",
                        &plan_bundle,
                        outcome,
                        cancel,
                        &mut call_ids,
                        &mut warnings,
                    )
                    .await;
            }
        };

        let plan = match decode_plan(&first.text) {
            Ok(plan) => {
                call_ids.push(
                    self.record("planning", CallStatus::Ok, request, &plan_bundle, &first)
                        .await,
                );
                plan
            }
            Err(decode_err) => {
                call_ids.push(
                    self.record("planning", CallStatus::Failed, request, &plan_bundle, &first)
                        .await,
                );
                warn!("Plan decode failed, retrying with stricter instruction: {decode_err}");
                self.retry_plan(request, &plan_bundle, &plan_prompt, cancel, &mut call_ids)
                    .await?
            }
        };

        // ── Expanding ────────────────────────────────────────────────
        let mut hot_paths = request.hot_paths.clone();
        for path in &plan.target_paths {
            if !hot_paths.contains(path) {
                hot_paths.push(path.clone());
            }
        }

        let bundle = self
            .assembler
            .assemble(&AssembleParams {
                query: &request.prompt,
                project_id: &request.project_id,
                token_budget: request.max_context_tokens,
                hot_paths: &hot_paths,
                session_id: Some(&request.session_id),
                top_k: None,
                summary_levels: &ALL_SUMMARY_LEVELS,
            })
            .await?;
        warnings.extend(bundle.warnings.iter().cloned());
        self.sessions
            .note_turn(&request.session_id, &bundle.piece_uids())?;

        let expand_prompt = format!(
            "{}\nPlan:\n{}\n\nTask:\n{}",
            bundle.render(),
            render_plan(&plan),
            request.prompt
        );
        let response = match self.call_model(EXPAND_SYSTEM, &expand_prompt, cancel).await {
            Ok(response) => response,
            Err(outcome) => {
                return self
                    .after_model_failure(
                        request,
                        "expanding",
                        &bundle,
                        outcome,
                        cancel,
                        &mut call_ids,
                        &mut warnings,
                    )
                    .await;
            }
        };
        call_ids.push(
            self.record("expanding", CallStatus::Ok, request, &bundle, &response)
                .await,
        );

        let mut diff = response.text;
        let mut sources = bundle.piece_uids();

        // ── Verifying ⇄ Repairing ────────────────────────────────────
        let max_cycles = self.config.model.max_repair_cycles;
        let mut failure_logs = Vec::new();

        for cycle in 1..=max_cycles.max(1) {
            let report = match self
                .sandbox
                .apply_and_test(&request.project_id, &diff)
                .await
            {
                Ok(report) => report,
                Err(e) => crate::sandbox::TestReport::failing(0, 0, &e.to_string()),
            };

            if report.passed {
                call_ids.push(
                    self.record_transition(
                        "verifying",
                        CallStatus::Ok,
                        request,
                        sources.clone(),
                    )
                    .await,
                );
                let cycles = failure_logs.len();
                info!(
                    "Generation request {} verified after {cycles} failed cycle(s)",
                    request.request_id
                );
                return Ok(GenerationOutcome {
                    request_id: request.request_id.clone(),
                    session_id: request.session_id.clone(),
                    project_id: request.project_id.clone(),
                    status: CallStatus::Ok,
                    plan_summary: plan.summary.clone(),
                    diff: Some(diff),
                    sources,
                    warnings,
                    failure_logs,
                    repair_cycles: cycles,
                    call_ids,
                });
            }

            call_ids.push(
                self.record_transition("verifying", CallStatus::Failed, request, sources.clone())
                    .await,
            );
            failure_logs.push(report.log.clone());

            if cycle == max_cycles.max(1) {
                break;
            }

            // Targeted repair bundle: the failing output drives retrieval
            let repair_bundle = self
                .assembler
                .assemble(&AssembleParams {
                    query: &report.log,
                    project_id: &request.project_id,
                    token_budget: degraded_budget(request.max_context_tokens),
                    hot_paths: &hot_paths,
                    session_id: Some(&request.session_id),
                    top_k: None,
                    summary_levels: &[SummaryLevel::File],
                })
                .await?;

            let repair_prompt = format!(
                "{}\nFailing test output:\n{}\n\nPrevious diff:\n{}\n\nTask:\n{}",
                repair_bundle.render(),
                report.log,
                diff,
                request.prompt
            );
            let repaired = match self.call_model(REPAIR_SYSTEM, &repair_prompt, cancel).await {
                Ok(response) => response,
                Err(ModelFailure::Cancelled) => {
                    call_ids.push(
                        self.record_transition(
                            "repairing",
                            CallStatus::Cancelled,
                            request,
                            repair_bundle.piece_uids(),
                        )
                        .await,
                    );
                    return Err(EngineError::Generation("request cancelled".to_string()));
                }
                Err(ModelFailure::Other(e)) => {
                    call_ids.push(
                        self.record_transition(
                            "repairing",
                            CallStatus::Failed,
                            request,
                            repair_bundle.piece_uids(),
                        )
                        .await,
                    );
                    warnings.push(format!("repair call failed: {e}"));
                    break;
                }
            };
            call_ids.push(
                self.record("repairing", CallStatus::Ok, request, &repair_bundle, &repaired)
                    .await,
            );
            for uid in repair_bundle.piece_uids() {
                if !sources.contains(&uid) {
                    sources.push(uid);
                }
            }
            diff = repaired.text;
        }

        let cycles = failure_logs.len();
        warnings.push(EngineError::VerificationFailed { cycles }.to_string());
        warn!(
            "Generation request {} failed after {cycles} verification cycle(s)",
            request.request_id
        );
        Ok(GenerationOutcome {
            request_id: request.request_id.clone(),
            session_id: request.session_id.clone(),
            project_id: request.project_id.clone(),
            status: CallStatus::Failed,
            plan_summary: plan.summary,
            diff: Some(diff),
            sources,
            warnings,
            failure_logs,
            repair_cycles: cycles,
            call_ids,
        })
    }

    /// Stricter planning retry after a decode failure; a second bad reply
    /// surfaces the decode error.
    async fn retry_plan(
        &self,
        request: &GenerateRequest,
        bundle: &ContextBundle,
        original_prompt: &str,
        cancel: &CancellationToken,
        call_ids: &mut Vec<String>,
    ) -> Result<GenerationPlan> {
        let strict_prompt = format!("{original_prompt}\n\n{STRICT_PLAN_REMINDER}");
        let response = match self.call_model(PLAN_SYSTEM, &strict_prompt, cancel).await {
            Ok(response) => response,
            Err(ModelFailure::Cancelled) => {
                call_ids.push(
                    self.record_transition(
                        "planning",
                        CallStatus::Cancelled,
                        request,
                        bundle.piece_uids(),
                    )
                    .await,
                );
                return Err(EngineError::Generation("request cancelled".to_string()));
            }
            Err(ModelFailure::Other(e)) => {
                call_ids.push(
                    self.record_transition(
                        "planning",
                        CallStatus::Failed,
                        request,
                        bundle.piece_uids(),
                    )
                    .await,
                );
                return Err(EngineError::Planning(format!("plan retry failed: {e}")));
            }
        };

        match decode_plan(&response.text) {
            Ok(plan) => {
                call_ids.push(
                    self.record("planning", CallStatus::Ok, request, bundle, &response)
                        .await,
                );
                Ok(plan)
            }
            Err(e) => {
                call_ids.push(
                    self.record("planning", CallStatus::Failed, request, bundle, &response)
                        .await,
                );
                Err(e)
            }
        }
    }

    /// Degraded single-pass fallback after a hard model failure in planning
    /// or expansion. Smaller bundle, one call, no verification loop.
    #[allow(clippy::too_many_arguments)]
    async fn after_model_failure(
        &self,
        request: &GenerateRequest,
        phase: &str,
        bundle: &ContextBundle,
        failure: ModelFailure,
        cancel: &CancellationToken,
        call_ids: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Result<GenerationOutcome> {
        match failure {
            ModelFailure::Cancelled => {
                call_ids.push(
                    self.record_transition(
                        phase,
                        CallStatus::Cancelled,
                        request,
                        bundle.piece_uids(),
                    )
                    .await,
                );
                Err(EngineError::Generation("request cancelled".to_string()))
            }
            ModelFailure::Other(e) => {
                call_ids.push(
                    self.record_transition(phase, CallStatus::Failed, request, bundle.piece_uids())
                        .await,
                );
                warnings.push(format!("{phase} failed ({e}), degrading to single pass"));
                self.degraded_single_pass(request, cancel, call_ids, warnings)
                    .await
            }
        }
    }

    async fn degraded_single_pass(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
        call_ids: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Result<GenerationOutcome> {
        let bundle = self
            .assembler
            .assemble(&AssembleParams {
                query: &request.prompt,
                project_id: &request.project_id,
                token_budget: degraded_budget(request.max_context_tokens),
                hot_paths: &request.hot_paths,
                session_id: Some(&request.session_id),
                top_k: None,
                summary_levels: &ALL_SUMMARY_LEVELS,
            })
            .await?;

        let prompt = format!("{}\nTask:\n{}", bundle.render(), request.prompt);
        let response = match self.call_model(DEGRADED_SYSTEM, &prompt, cancel).await {
            Ok(response) => response,
            Err(ModelFailure::Cancelled) => {
                call_ids.push(
                    self.record_transition(
                        "degraded",
                        CallStatus::Cancelled,
                        request,
                        bundle.piece_uids(),
                    )
                    .await,
                );
                return Err(EngineError::Generation("request cancelled".to_string()));
            }
            Err(ModelFailure::Other(e)) => {
                call_ids.push(
                    self.record_transition(
                        "degraded",
                        CallStatus::Failed,
                        request,
                        bundle.piece_uids(),
                    )
                    .await,
                );
                return Err(EngineError::Generation(format!(
                    "model unavailable after retry and degraded fallback: {e}"
                )));
            }
        };

        let call_id = {
            let record = ModelCallRecord {
                call_id: new_call_id(),
                session_id: request.session_id.clone(),
                model: self.config.model.name.clone(),
                status: CallStatus::Degraded,
                phase: "degraded".to_string(),
                prompt_tokens: response.prompt_tokens,
                completion_tokens: response.completion_tokens,
                chunk_uids: bundle.piece_uids(),
                created_at: Utc::now(),
            };
            self.db.lock().await.record_call(&record);
            record.call_id
        };
        call_ids.push(call_id);
        self.sessions
            .note_turn(&request.session_id, &bundle.piece_uids())?;

        Ok(GenerationOutcome {
            request_id: request.request_id.clone(),
            session_id: request.session_id.clone(),
            project_id: request.project_id.clone(),
            status: CallStatus::Degraded,
            plan_summary: String::new(),
            diff: Some(response.text),
            sources: bundle.piece_uids(),
            warnings: std::mem::take(warnings),
            failure_logs: Vec::new(),
            repair_cycles: 0,
            call_ids: std::mem::take(call_ids),
        })
    }

    async fn call_model(
        &self,
        system: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<ModelResponse, ModelFailure> {
        let request = ModelRequest {
            model: self.config.model.name.clone(),
            system: system.to_string(),
            prompt: prompt.to_string(),
            max_tokens: None,
        };
        let timeout = Duration::from_secs(self.config.model.request_timeout_secs);
        complete_with_retry(self.model.as_ref(), request, timeout, cancel)
            .await
            .map_err(|e| match e {
                ModelError::Cancelled => ModelFailure::Cancelled,
                other => ModelFailure::Other(other),
            })
    }

    /// Record a transition backed by an actual model response.
    async fn record(
        &self,
        phase: &str,
        status: CallStatus,
        request: &GenerateRequest,
        bundle: &ContextBundle,
        response: &ModelResponse,
    ) -> String {
        let record = ModelCallRecord {
            call_id: new_call_id(),
            session_id: request.session_id.clone(),
            model: self.config.model.name.clone(),
            status,
            phase: phase.to_string(),
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            chunk_uids: bundle.piece_uids(),
            created_at: Utc::now(),
        };
        self.db.lock().await.record_call(&record);
        record.call_id
    }

    /// Record a transition with no model response (verification, failures,
    /// cancellations).
    async fn record_transition(
        &self,
        phase: &str,
        status: CallStatus,
        request: &GenerateRequest,
        chunk_uids: Vec<String>,
    ) -> String {
        let record = ModelCallRecord {
            call_id: new_call_id(),
            session_id: request.session_id.clone(),
            model: self.config.model.name.clone(),
            status,
            phase: phase.to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            chunk_uids,
            created_at: Utc::now(),
        };
        self.db.lock().await.record_call(&record);
        record.call_id
    }
}

enum ModelFailure {
    Cancelled,
    Other(ModelError),
}

fn new_call_id() -> String {
    format!("call-{}", Uuid::new_v4().simple())
}

fn degraded_budget(requested: usize) -> usize {
    (requested / 4).max(DEGRADED_BUDGET_FLOOR)
}

fn render_plan(plan: &GenerationPlan) -> String {
    let mut out = plan.summary.clone();
    for (i, step) in plan.steps.iter().enumerate() {
        out.push_str(&format!("\n{}. {}", i + 1, step.description));
        if !step.paths.is_empty() {
            out.push_str(&format!(" [{}]", step.paths.join(", ")));
        }
    }
    out
}
