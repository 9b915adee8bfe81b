//! Core types for the AgenticQA bridge

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// A test case submitted for execution.
///
/// Built from an [`ExecuteRequest`] once its required fields have been
/// checked; never mutated while a run is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestDefinition {
    pub id: String,
    pub name: String,
    pub module: String,
    pub test_type: Option<String>,
    /// Free-text instruction block, one instruction per line
    pub instructions: String,
    /// Free-text description of the expected outcome
    pub expected_results: String,
}

/// Body of an execute request as sent by the tracker UI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default, rename = "type")]
    pub test_type: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, rename = "expectedResults")]
    pub expected_results: Option<String>,
}

impl ExecuteRequest {
    /// Check required fields and produce a [`TestDefinition`].
    pub fn into_definition(self) -> Result<TestDefinition> {
        let id = match self.id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => return Err(Error::Validation("missing test id".to_string())),
        };
        let instructions = self
            .prompt
            .ok_or_else(|| Error::Validation("missing prompt".to_string()))?;
        let expected_results = self
            .expected_results
            .ok_or_else(|| Error::Validation("missing expectedResults".to_string()))?;

        Ok(TestDefinition {
            name: self.name.unwrap_or_else(|| id.clone()),
            module: self.module.unwrap_or_default(),
            test_type: self.test_type,
            id,
            instructions,
            expected_results,
        })
    }
}

/// Step kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Navigate,
    Click,
    Type,
    Wait,
    Screenshot,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Navigate => write!(f, "navigate"),
            StepKind::Click => write!(f, "click"),
            StepKind::Type => write!(f, "type"),
            StepKind::Wait => write!(f, "wait"),
            StepKind::Screenshot => write!(f, "screenshot"),
        }
    }
}

/// A browser action together with its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Navigate { url: String },
    Click { target: String },
    Type { text: String, target: Option<String> },
    Wait { duration_ms: u64 },
    Screenshot { name: String },
}

impl StepAction {
    pub fn kind(&self) -> StepKind {
        match self {
            StepAction::Navigate { .. } => StepKind::Navigate,
            StepAction::Click { .. } => StepKind::Click,
            StepAction::Type { .. } => StepKind::Type,
            StepAction::Wait { .. } => StepKind::Wait,
            StepAction::Screenshot { .. } => StepKind::Screenshot,
        }
    }

    /// Kind-specific parameters in the shape the agent expects under `options`.
    pub fn options(&self) -> serde_json::Value {
        match self {
            StepAction::Navigate { url } => serde_json::json!({ "url": url }),
            StepAction::Click { target } => serde_json::json!({ "element": target }),
            StepAction::Type { text, target } => match target {
                Some(target) => serde_json::json!({ "text": text, "element": target }),
                None => serde_json::json!({ "text": text }),
            },
            StepAction::Wait { duration_ms } => serde_json::json!({
                "duration_ms": duration_ms,
                "time": (*duration_ms as f64) / 1000.0,
            }),
            StepAction::Screenshot { name } => serde_json::json!({
                "name": name,
                "capture_screenshot": true,
            }),
        }
    }
}

/// One executable step compiled from an instruction line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepDescriptor {
    /// 1-based position in the run
    pub step_number: u32,
    pub action: StepAction,
    pub description: String,
}

impl StepDescriptor {
    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }
}

/// Outcome of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
}

impl StepStatus {
    /// Map the agent's free-form status string onto passed/failed.
    pub fn from_wire(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "passed" | "pass" | "success" | "completed" | "ok" => StepStatus::Passed,
            _ => StepStatus::Failed,
        }
    }
}

/// Screenshot captured by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Screenshot {
    Path(String),
    Base64(String),
}

/// Result of executing one step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_number: u32,
    pub action: String,
    pub status: StepStatus,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Screenshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StepResult {
    /// A failed step that never got a usable reply.
    pub fn failed(step: &StepDescriptor, error: impl Into<String>, duration_ms: u64) -> Self {
        let error = error.into();
        Self {
            step_number: step.step_number,
            action: step.description.clone(),
            status: StepStatus::Failed,
            logs: vec![format!("Step {} failed: {}", step.step_number, error)],
            screenshot: None,
            error: Some(error),
            duration_ms,
        }
    }
}

/// Aggregated status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Passed,
    Failed,
    Blocked,
}

impl ExecutionStatus {
    /// Classify a run: blocked when it was cut short, otherwise failed iff any step failed.
    pub fn classify(steps: &[StepResult], aborted: bool) -> Self {
        if aborted {
            ExecutionStatus::Blocked
        } else if steps.iter().any(|s| s.status == StepStatus::Failed) {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Passed
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Passed => write!(f, "passed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Whether the run matched the expected results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub passed: bool,
    pub details: String,
}

/// Screenshot entry of an execution report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotRef {
    pub step: u32,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    pub status: StepStatus,
}

/// Aggregated outcome of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    pub logs: String,
    pub screenshots: Vec<ScreenshotRef>,
    pub validation: ValidationVerdict,
    pub blocked_reason: Option<String>,
}

impl ExecutionResult {
    /// Assemble a result from collected step results.
    ///
    /// `blocked_reason` is set when the run was aborted before every step ran.
    pub fn assemble(
        steps: Vec<StepResult>,
        agent_logs: Vec<String>,
        validation: Option<ValidationVerdict>,
        blocked_reason: Option<String>,
        duration_ms: u64,
    ) -> Self {
        let status = ExecutionStatus::classify(&steps, blocked_reason.is_some());

        let mut lines = agent_logs;
        for step in &steps {
            lines.extend(step.logs.iter().cloned());
        }
        if let Some(reason) = &blocked_reason {
            lines.push(format!("Run blocked: {}", reason));
        }

        let screenshots = steps
            .iter()
            .filter_map(|step| {
                let shot = step.screenshot.as_ref()?;
                let (screenshot_path, base64) = match shot {
                    Screenshot::Path(p) => (Some(p.clone()), None),
                    Screenshot::Base64(b) => (None, Some(b.clone())),
                };
                Some(ScreenshotRef {
                    step: step.step_number,
                    description: step.action.clone(),
                    screenshot_path,
                    base64,
                    status: step.status,
                })
            })
            .collect();

        let validation = validation.unwrap_or_else(|| ValidationVerdict {
            passed: status == ExecutionStatus::Passed,
            details: "No validation details.".to_string(),
        });

        Self {
            status,
            duration_ms,
            steps,
            logs: lines.join("\n"),
            screenshots,
            validation,
            blocked_reason,
        }
    }
}

/// Execution result as reported to HTTP callers and push subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub test_id: String,
    pub status: ExecutionStatus,
    pub duration: u64,
    pub screenshots: Vec<ScreenshotRef>,
    pub logs: String,
    pub validation_results: ValidationVerdict,
    pub executed_at: String,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl ExecutionReport {
    pub fn new(test_id: &str, result: ExecutionResult) -> Self {
        Self {
            test_id: test_id.to_string(),
            status: result.status,
            duration: result.duration_ms,
            screenshots: result.screenshots,
            logs: result.logs,
            validation_results: result.validation,
            executed_at: chrono::Utc::now().to_rfc3339(),
            steps: result.steps,
            blocked_reason: result.blocked_reason,
        }
    }
}

/// Lifecycle state of the automation agent process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubprocessState {
    NotStarted,
    Starting,
    Ready,
    Degraded,
    Exited,
}

impl Default for SubprocessState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl SubprocessState {
    /// Ready to execute steps (`mcpReady` on the wire).
    pub fn is_ready(&self) -> bool {
        matches!(self, SubprocessState::Ready | SubprocessState::Degraded)
    }

    /// A live process is attached (possibly still starting).
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubprocessState::Starting | SubprocessState::Ready | SubprocessState::Degraded
        )
    }
}

impl std::fmt::Display for SubprocessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubprocessState::NotStarted => write!(f, "not_started"),
            SubprocessState::Starting => write!(f, "starting"),
            SubprocessState::Ready => write!(f, "ready"),
            SubprocessState::Degraded => write!(f, "degraded"),
            SubprocessState::Exited => write!(f, "exited"),
        }
    }
}

/// How readiness of the agent was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessSource {
    /// A well-formed readiness message on stdout
    StatusMessage,
    /// A recognized substring on stdout
    OutputMatch,
    /// No signal within the grace period; assumed ready because the process is alive
    GracePeriod,
}
