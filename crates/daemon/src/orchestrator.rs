//! Test execution orchestrator
//!
//! Compiles a test's instruction block, hands the steps to the automation
//! backend and folds the replies into one [`ExecutionReport`].

use crate::config::{DispatchMode, ExecutionConfig};
use crate::notify::Notifier;
use agenticqa_common::protocol::{CommandOptions, CommandPayload, WireStepResult};
use agenticqa_common::{
    compile, BridgeEvent, ExecutionReport, ExecutionResult, ReplyPayload, Result,
    StepDescriptor, StepResult, StepStatus, TestDefinition, ValidationVerdict,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Whatever actually executes steps
#[async_trait]
pub trait AutomationBackend: Send + Sync {
    /// Bring the backend to a state where it accepts commands.
    async fn ensure_ready(&self) -> Result<()>;

    /// Send one command and wait for its reply.
    async fn send(&self, command: &str, payload: CommandPayload) -> Result<ReplyPayload>;
}

#[async_trait]
impl<T: AutomationBackend + ?Sized> AutomationBackend for Arc<T> {
    async fn ensure_ready(&self) -> Result<()> {
        (**self).ensure_ready().await
    }

    async fn send(&self, command: &str, payload: CommandPayload) -> Result<ReplyPayload> {
        (**self).send(command, payload).await
    }
}

/// Steps collected so far, plus what the agent said about the run
#[derive(Default)]
struct RunLog {
    steps: Vec<StepResult>,
    agent_logs: Vec<String>,
    validation: Option<ValidationVerdict>,
    blocked: Option<String>,
}

impl RunLog {
    fn absorb_reply(&mut self, reply: &mut ReplyPayload) {
        self.agent_logs.append(&mut reply.logs);
        if let Some(outcome) = reply.validation_outcome.take() {
            self.validation = Some(outcome.into());
        }
    }
}

/// Runs test definitions against an [`AutomationBackend`]
pub struct Orchestrator<B> {
    backend: B,
    notifier: Notifier,
    config: ExecutionConfig,
}

impl<B: AutomationBackend> Orchestrator<B> {
    pub fn new(backend: B, notifier: Notifier, config: ExecutionConfig) -> Self {
        Self {
            backend,
            notifier,
            config,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Execute one test and report on it.
    ///
    /// An `Err` means no result could be produced at all; step failures,
    /// agent exit and the run ceiling all end in a report.
    pub async fn execute(&self, test: &TestDefinition) -> Result<ExecutionReport> {
        info!(test_id = %test.id, "Executing test {}", test.name);
        self.notifier.broadcast(&BridgeEvent::test_started(&test.id));

        if let Err(e) = self.backend.ensure_ready().await {
            error!(test_id = %test.id, "Automation agent unavailable: {}", e);
            self.notifier.broadcast(&BridgeEvent::test_error(&test.id, &e));
            return Err(e);
        }

        let steps = compile(&test.instructions);
        debug!(test_id = %test.id, "Compiled {} steps", steps.len());

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.run_timeout();
        let run = match self.config.dispatch {
            DispatchMode::PerStep => self.run_per_step(test, &steps, deadline).await,
            DispatchMode::Batch => self.run_batch(test, &steps, deadline).await,
        };

        let result = ExecutionResult::assemble(
            run.steps,
            run.agent_logs,
            run.validation,
            run.blocked,
            started.elapsed().as_millis() as u64,
        );
        let report = ExecutionReport::new(&test.id, result);

        info!(
            test_id = %test.id,
            status = %report.status,
            "Test finished: {} of {} steps reported in {} ms",
            report.steps.len(),
            steps.len(),
            report.duration
        );
        self.notifier
            .broadcast(&BridgeEvent::TestCompleted(report.clone()));
        Ok(report)
    }

    fn options(&self) -> CommandOptions {
        CommandOptions {
            capture_screenshots_for_steps: self.config.capture_screenshots,
            validate_results_against_description: self.config.validate_results,
        }
    }

    fn ceiling_reason(&self) -> String {
        format!(
            "run exceeded {}s before all steps completed",
            self.config.run_timeout().as_secs()
        )
    }

    async fn run_per_step(
        &self,
        test: &TestDefinition,
        steps: &[StepDescriptor],
        deadline: tokio::time::Instant,
    ) -> RunLog {
        let mut run = RunLog::default();

        for step in steps {
            let payload = CommandPayload::new(test, std::slice::from_ref(step), self.options());
            let step_started = Instant::now();
            let sent = tokio::time::timeout_at(
                deadline,
                self.backend.send(&self.config.step_command, payload),
            )
            .await;
            let elapsed = step_started.elapsed().as_millis() as u64;

            match sent {
                Err(_) => {
                    warn!(test_id = %test.id, step = step.step_number, "Run ceiling reached");
                    run.blocked = Some(self.ceiling_reason());
                    break;
                }
                Ok(Ok(mut reply)) => {
                    let entry = reply
                        .step(step.step_number)
                        .or_else(|| reply.step_results.first())
                        .cloned();
                    let result = step_result(step, entry.as_ref(), reply.overall_status.as_deref(), elapsed);
                    run.absorb_reply(&mut reply);
                    run.steps.push(result);
                }
                Ok(Err(e)) if e.is_systemic() => {
                    warn!(test_id = %test.id, step = step.step_number, "Aborting run: {}", e);
                    run.blocked = Some(e.to_string());
                    break;
                }
                Ok(Err(e)) => {
                    warn!(test_id = %test.id, step = step.step_number, "Step failed: {}", e);
                    run.steps.push(StepResult::failed(step, e.to_string(), elapsed));
                }
            }
        }

        run
    }

    async fn run_batch(
        &self,
        test: &TestDefinition,
        steps: &[StepDescriptor],
        deadline: tokio::time::Instant,
    ) -> RunLog {
        let mut run = RunLog::default();
        let payload = CommandPayload::new(test, steps, self.options());
        let started = Instant::now();

        let sent = tokio::time::timeout_at(
            deadline,
            self.backend.send(&self.config.batch_command, payload),
        )
        .await;
        let elapsed = started.elapsed().as_millis() as u64;

        match sent {
            Err(_) => run.blocked = Some(self.ceiling_reason()),
            Ok(Err(e)) if e.is_systemic() => run.blocked = Some(e.to_string()),
            Ok(Err(e)) => {
                warn!(test_id = %test.id, "Batch command failed: {}", e);
                let message = e.to_string();
                run.steps = steps
                    .iter()
                    .map(|step| StepResult::failed(step, message.clone(), 0))
                    .collect();
            }
            Ok(Ok(mut reply)) => {
                run.steps = steps
                    .iter()
                    .map(|step| match reply.step(step.step_number) {
                        Some(entry) => step_result(step, Some(entry), None, 0),
                        None => StepResult::failed(
                            step,
                            format!("no result reported for step {}", step.step_number),
                            0,
                        ),
                    })
                    .collect();
                if reply.step_results.is_empty() {
                    debug!(test_id = %test.id, "Batch reply carried no step results ({} ms)", elapsed);
                }
                run.absorb_reply(&mut reply);
            }
        }

        run
    }
}

/// Build a step result from the agent's entry for it.
///
/// Without an entry the reply's overall status decides; a reply with neither
/// counts as passed, since the agent answered without an error.
fn step_result(
    step: &StepDescriptor,
    entry: Option<&WireStepResult>,
    overall_status: Option<&str>,
    elapsed_ms: u64,
) -> StepResult {
    let raw_status = entry
        .and_then(|e| e.status.as_deref())
        .or(overall_status);
    let status = raw_status.map(StepStatus::from_wire).unwrap_or(StepStatus::Passed);

    let mut logs = entry.map(|e| e.logs.clone()).unwrap_or_default();
    let action = entry
        .and_then(|e| e.action_performed.clone())
        .unwrap_or_else(|| step.description.clone());
    let error = entry.and_then(|e| e.error.clone());

    match status {
        StepStatus::Passed => logs.push(format!("Step {}: {} - passed", step.step_number, action)),
        StepStatus::Failed => logs.push(format!(
            "Step {}: {} - failed (agent status {:?})",
            step.step_number,
            action,
            raw_status.unwrap_or("none")
        )),
    }

    StepResult {
        step_number: step.step_number,
        action,
        status,
        logs,
        screenshot: entry.and_then(|e| e.screenshot()),
        error: error.or_else(|| {
            (status == StepStatus::Failed).then(|| format!("agent reported {}", raw_status.unwrap_or("failure")))
        }),
        duration_ms: entry.and_then(|e| e.duration_ms).unwrap_or(elapsed_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agenticqa_common::{Error, ExecutionStatus, Screenshot, SubprocessState};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::sync::watch;

    /// Scripted reply for one command
    enum Scripted {
        Reply(serde_json::Value),
        Fail(Error),
        Hang,
    }

    struct FakeBackend {
        ready: Mutex<Option<Error>>,
        script: Mutex<VecDeque<Scripted>>,
        sent: Mutex<Vec<(String, CommandPayload)>>,
    }

    impl FakeBackend {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                ready: Mutex::new(None),
                script: Mutex::new(script.into()),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AutomationBackend for FakeBackend {
        async fn ensure_ready(&self) -> Result<()> {
            match self.ready.lock().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn send(&self, command: &str, payload: CommandPayload) -> Result<ReplyPayload> {
            self.sent.lock().push((command.to_string(), payload));
            let next = self.script.lock().pop_front();
            match next {
                Some(Scripted::Reply(value)) => ReplyPayload::from_value(value),
                Some(Scripted::Fail(e)) => Err(e),
                Some(Scripted::Hang) | None => std::future::pending().await,
            }
        }
    }

    fn passed(step: u32) -> Scripted {
        Scripted::Reply(serde_json::json!({
            "overall_status": "passed",
            "step_results": [{"step_number": step, "status": "passed", "logs": [format!("did {}", step)]}],
        }))
    }

    fn test_def(instructions: &str) -> TestDefinition {
        TestDefinition {
            id: "t-1".into(),
            name: "Login".into(),
            module: "Auth".into(),
            test_type: None,
            instructions: instructions.into(),
            expected_results: "dashboard visible".into(),
        }
    }

    fn orchestrator(
        backend: FakeBackend,
        config: ExecutionConfig,
    ) -> (Orchestrator<Arc<FakeBackend>>, Notifier, Arc<FakeBackend>) {
        let (_tx, rx) = watch::channel(SubprocessState::Ready);
        let notifier = Notifier::new(rx, 64);
        let backend = Arc::new(backend);
        (
            Orchestrator::new(backend.clone(), notifier.clone(), config),
            notifier,
            backend,
        )
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<crate::notify::EventFrame>) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(serde_json::from_str(&frame).unwrap());
        }
        events
    }

    const FOUR_STEPS: &str = "go to https://example.com\nclick \"Login\"\ntype \"bob\" into \"username\"";

    #[tokio::test]
    async fn test_all_steps_pass() {
        let backend = FakeBackend::new((1..=4).map(passed).collect());
        let (orch, notifier, backend) = orchestrator(backend, ExecutionConfig::default());
        let mut sub = notifier.subscribe();

        let report = orch.execute(&test_def(FOUR_STEPS)).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Passed);
        assert_eq!(report.steps.len(), 4);
        assert!(report.validation_results.passed);
        assert_eq!(report.validation_results.details, "No validation details.");

        let sent = backend.sent.lock();
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|(cmd, p)| cmd == "execute_step" && p.steps.len() == 1));
        assert_eq!(sent[3].1.steps[0].action, "screenshot");

        let kinds: Vec<_> = drain(&mut sub.rx)
            .into_iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["bridge_status", "test_started", "test_completed"]);
    }

    #[tokio::test]
    async fn test_step_failure_does_not_short_circuit() {
        let backend = FakeBackend::new(vec![
            passed(1),
            Scripted::Fail(Error::Remote("element not found".into())),
            Scripted::Fail(Error::ProtocolTimeout {
                command_id: "cmd_3".into(),
                timeout_ms: 35_000,
            }),
            Scripted::Reply(serde_json::json!({
                "step_results": [{"step_number": 4, "status": "success", "screenshot_base64": "aGk="}],
                "validation_outcome": {"passed": false, "details": "dashboard missing"},
            })),
        ]);
        let (orch, _notifier, _backend) = orchestrator(backend, ExecutionConfig::default());

        let report = orch.execute(&test_def(FOUR_STEPS)).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.steps.len(), 4);
        assert_eq!(report.steps[1].status, StepStatus::Failed);
        assert!(report.steps[1].error.as_deref().unwrap().contains("element not found"));
        assert_eq!(report.steps[2].status, StepStatus::Failed);
        assert_eq!(report.steps[3].status, StepStatus::Passed);
        assert_eq!(report.steps[3].screenshot, Some(Screenshot::Base64("aGk=".into())));
        assert_eq!(report.screenshots.len(), 1);
        assert!(!report.validation_results.passed);
        assert_eq!(report.validation_results.details, "dashboard missing");
    }

    #[tokio::test]
    async fn test_failed_wire_status_fails_step() {
        let backend = FakeBackend::new(vec![Scripted::Reply(serde_json::json!({
            "overall_status": "error",
        }))]);
        let (orch, _notifier, _backend) = orchestrator(backend, ExecutionConfig::default());

        let report = orch.execute(&test_def("")).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert!(report.steps[0].logs.iter().any(|l| l.contains("\"error\"")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ceiling_blocks_with_partial_results() {
        // five steps: navigate, click, type, wait, final screenshot
        let instructions = "go to https://example.com\nclick Login\ntype \"bob\" into \"username\"\nwait 1";
        let backend = FakeBackend::new(vec![passed(1), passed(2), Scripted::Hang]);
        let config = ExecutionConfig {
            run_timeout_ms: 1_000,
            ..Default::default()
        };
        let (orch, notifier, _backend) = orchestrator(backend, config);
        let mut sub = notifier.subscribe();

        let report = orch.execute(&test_def(instructions)).await.unwrap();
        assert_eq!(compile(instructions).len(), 5);
        assert_eq!(report.status, ExecutionStatus::Blocked);
        assert_eq!(report.steps.len(), 2);
        assert!(report.blocked_reason.as_deref().unwrap().contains("1s"));

        let events = drain(&mut sub.rx);
        let completed = events.last().unwrap();
        assert_eq!(completed["type"], "test_completed");
        assert_eq!(completed["status"], "blocked");
    }

    #[tokio::test]
    async fn test_agent_exit_mid_run_blocks() {
        let backend = FakeBackend::new(vec![passed(1), Scripted::Fail(Error::SubprocessExited)]);
        let (orch, _notifier, backend) = orchestrator(backend, ExecutionConfig::default());

        let report = orch.execute(&test_def(FOUR_STEPS)).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Blocked);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(backend.sent.lock().len(), 2);
        assert!(!report.validation_results.passed);
    }

    #[tokio::test]
    async fn test_unavailable_backend_emits_test_error() {
        let backend = FakeBackend::new(vec![]);
        *backend.ready.lock() = Some(Error::Unavailable("agent is exited".into()));
        let (orch, notifier, backend) = orchestrator(backend, ExecutionConfig::default());
        let mut sub = notifier.subscribe();

        let err = orch.execute(&test_def(FOUR_STEPS)).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert!(backend.sent.lock().is_empty());

        let events = drain(&mut sub.rx);
        assert_eq!(events[1]["type"], "test_started");
        assert_eq!(events[2]["type"], "test_error");
        assert_eq!(events[2]["testId"], "t-1");
    }

    #[tokio::test]
    async fn test_batch_dispatch_maps_results_by_step_number() {
        let backend = FakeBackend::new(vec![Scripted::Reply(serde_json::json!({
            "overall_status": "passed",
            "step_results": [
                {"step_number": 4, "status": "passed", "screenshot_path": "/tmp/final.png"},
                {"step_number": 1, "status": "passed", "action_performed": "Opened example.com"},
                {"step_number": 2, "status": "failed", "error": "timeout waiting for Login"},
            ],
            "validation_outcome": {"passed": false},
            "logs": ["browser launched"],
        }))]);
        let config = ExecutionConfig {
            dispatch: DispatchMode::Batch,
            ..Default::default()
        };
        let (orch, _notifier, backend) = orchestrator(backend, config);

        let report = orch.execute(&test_def(FOUR_STEPS)).await.unwrap();
        let sent = backend.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "run_playwright_test");
        assert_eq!(sent[0].1.steps.len(), 4);

        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.steps[0].action, "Opened example.com");
        assert_eq!(report.steps[1].error.as_deref(), Some("timeout waiting for Login"));
        // step 3 missing from the reply
        assert_eq!(report.steps[2].status, StepStatus::Failed);
        assert_eq!(report.steps[3].screenshot, Some(Screenshot::Path("/tmp/final.png".into())));
        assert!(report.logs.starts_with("browser launched"));
        assert_eq!(report.validation_results.details, "No validation details.");
    }

    #[tokio::test]
    async fn test_options_follow_config() {
        let backend = FakeBackend::new(vec![passed(1)]);
        let config = ExecutionConfig {
            capture_screenshots: false,
            ..Default::default()
        };
        let (orch, _notifier, backend) = orchestrator(backend, config);
        orch.execute(&test_def("")).await.unwrap();

        let sent = backend.sent.lock();
        assert!(!sent[0].1.options.capture_screenshots_for_steps);
        assert!(sent[0].1.options.validate_results_against_description);
    }
}
