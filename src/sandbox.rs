//! Verification sandbox boundary.
//!
//! The orchestrator's verify phase applies a generated diff to an isolated
//! copy of the workspace and runs the project's tests there. The sandbox
//! itself is an external collaborator; the engine only depends on this
//! trait. The engine workspace is never modified by verification.
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("diff does not apply: {0}")]
    ApplyFailed(String),

    #[error("test run failed to execute: {0}")]
    ExecutionFailed(String),
}

/// Outcome of one apply-and-test cycle.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub passed: bool,
    pub total: usize,
    pub failed: usize,
    /// Captured test output, fed back into repair prompts.
    pub log: String,
}

impl TestReport {
    #[must_use]
    pub fn passing(total: usize) -> Self {
        Self {
            passed: true,
            total,
            failed: 0,
            log: format!("{total} tests passed"),
        }
    }

    #[must_use]
    pub fn failing(total: usize, failed: usize, log: &str) -> Self {
        Self {
            passed: false,
            total,
            failed,
            log: log.to_string(),
        }
    }
}

/// Applies a unified diff to an isolated workspace copy and runs tests.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn apply_and_test(
        &self,
        project_id: &str,
        diff: &str,
    ) -> Result<TestReport, SandboxError>;
}

/// Sandbox backed by a scratch copy of the workspace: applies the diff with
/// `patch -p1` and runs the project's test command there. The original
/// workspace is never touched.
pub struct CommandSandbox {
    workspace_root: PathBuf,
    test_command: Vec<String>,
    /// Wall-clock limit per spawned command; expired children are killed.
    timeout: Duration,
}

impl CommandSandbox {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        test_command: Vec<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            test_command,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl Sandbox for CommandSandbox {
    async fn apply_and_test(
        &self,
        project_id: &str,
        diff: &str,
    ) -> Result<TestReport, SandboxError> {
        let scratch =
            std::env::temp_dir().join(format!("loom-sandbox-{}", Uuid::new_v4().simple()));
        copy_tree(&self.workspace_root, &scratch)
            .map_err(|e| SandboxError::ExecutionFailed(format!("workspace copy: {e}")))?;
        debug!("Sandbox for {project_id} at {}", scratch.display());

        let result = self.run_in(&scratch, diff).await;

        if let Err(e) = std::fs::remove_dir_all(&scratch) {
            warn!("Failed to clean sandbox {}: {e}", scratch.display());
        }
        result
    }
}

impl CommandSandbox {
    async fn run_in(&self, scratch: &Path, diff: &str) -> Result<TestReport, SandboxError> {
        let patch_file = scratch.join(".pending.patch");
        std::fs::write(&patch_file, diff)
            .map_err(|e| SandboxError::ExecutionFailed(format!("write patch: {e}")))?;

        let mut apply_cmd = Command::new("patch");
        apply_cmd
            .args(["-p1", "--forward", "-i", ".pending.patch"])
            .current_dir(scratch);
        let apply = output_with_timeout("patch", &mut apply_cmd, self.timeout).await?;
        if !apply.status.success() {
            return Err(SandboxError::ApplyFailed(
                String::from_utf8_lossy(&apply.stderr).into_owned(),
            ));
        }

        let (program, args) = self
            .test_command
            .split_first()
            .ok_or_else(|| SandboxError::ExecutionFailed("empty test command".to_string()))?;
        let mut test_cmd = Command::new(program);
        test_cmd.args(args).current_dir(scratch);
        let output = output_with_timeout(program, &mut test_cmd, self.timeout).await?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(TestReport {
            passed: output.status.success(),
            total: 0,
            failed: usize::from(!output.status.success()),
            log,
        })
    }
}

/// Run a command to completion under a wall-clock limit. The child is
/// killed when the limit expires, so a hung test run cannot hold the
/// verify phase open.
async fn output_with_timeout(
    name: &str,
    command: &mut Command,
    limit: Duration,
) -> Result<std::process::Output, SandboxError> {
    command.kill_on_drop(true);
    match tokio::time::timeout(limit, command.output()).await {
        Ok(result) => {
            result.map_err(|e| SandboxError::ExecutionFailed(format!("spawn {name}: {e}")))
        }
        Err(_) => Err(SandboxError::ExecutionFailed(format!(
            "{name} exceeded the {}s limit",
            limit.as_secs()
        ))),
    }
}

/// Recursive copy skipping VCS metadata and build artifacts.
fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" || name == "target" {
            continue;
        }
        let src = entry.path();
        let dst = to.join(&name);
        if entry.file_type()?.is_dir() {
            copy_tree(&src, &dst)?;
        } else {
            std::fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}

/// Scripted sandbox for tests and dry runs. Replays a queue of reports;
/// unscripted calls pass.
pub struct ScriptedSandbox {
    script: Mutex<VecDeque<Result<TestReport, SandboxError>>>,
    applied: Mutex<Vec<String>>,
}

impl ScriptedSandbox {
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn push_report(&self, report: TestReport) {
        self.script.lock().unwrap().push_back(Ok(report));
    }

    pub fn push_err(&self, err: SandboxError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// Diffs applied so far, in order.
    pub fn applied_diffs(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }
}

impl Default for ScriptedSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn apply_and_test(
        &self,
        _project_id: &str,
        diff: &str,
    ) -> Result<TestReport, SandboxError> {
        self.applied.lock().unwrap().push(diff.to_string());
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(TestReport::passing(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_reports_in_order() {
        let sandbox = ScriptedSandbox::new();
        sandbox.push_report(TestReport::failing(10, 2, "2 assertions failed"));
        sandbox.push_report(TestReport::passing(10));

        let first = sandbox.apply_and_test("proj-1", "--- a\n+++ b\n").await.unwrap();
        assert!(!first.passed);
        assert_eq!(first.failed, 2);

        let second = sandbox.apply_and_test("proj-1", "--- a\n+++ b2\n").await.unwrap();
        assert!(second.passed);

        assert_eq!(sandbox.applied_diffs().len(), 2);
    }

    #[tokio::test]
    async fn test_unscripted_call_passes() {
        let sandbox = ScriptedSandbox::new();
        let report = sandbox.apply_and_test("proj-1", "diff").await.unwrap();
        assert!(report.passed);
    }

    #[test]
    fn test_copy_tree_skips_vcs_and_target() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("lib.rs"), "fn x() {}").unwrap();
        std::fs::create_dir(src.path().join(".git")).unwrap();
        std::fs::create_dir(src.path().join("target")).unwrap();
        std::fs::create_dir(src.path().join("src")).unwrap();
        std::fs::write(src.path().join("src/main.rs"), "fn main() {}").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let dst_root = dst.path().join("copy");
        copy_tree(src.path(), &dst_root).unwrap();

        assert!(dst_root.join("lib.rs").exists());
        assert!(dst_root.join("src/main.rs").exists());
        assert!(!dst_root.join(".git").exists());
        assert!(!dst_root.join("target").exists());
    }

    #[tokio::test]
    async fn test_hung_command_is_killed_at_the_limit() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = output_with_timeout("sleep", &mut cmd, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ExecutionFailed(_)));
        assert!(err.to_string().contains("limit"));
    }

    #[tokio::test]
    async fn test_scripted_apply_failure() {
        let sandbox = ScriptedSandbox::new();
        sandbox.push_err(SandboxError::ApplyFailed("hunk #1 rejected".into()));
        let err = sandbox.apply_and_test("proj-1", "bad diff").await.unwrap_err();
        assert!(matches!(err, SandboxError::ApplyFailed(_)));
    }
}
