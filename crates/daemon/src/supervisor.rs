//! Automation agent process supervision
//!
//! Launches the agent with piped stdio and tracks its lifecycle. State
//! changes are driven by discrete [`SupervisorEvent`]s that a single control
//! task applies in arrival order; everyone else observes the state through a
//! watch channel.

use crate::client::ProtocolClient;
use crate::config::AgentConfig;
use crate::notify::Notifier;
use agenticqa_common::{BridgeEvent, Error, ReadinessSource, Result, SubprocessState};
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Input to the supervisor state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The agent announced readiness
    ReadySignal {
        generation: u64,
        source: ReadinessSource,
    },
    /// The readiness grace period ran out
    GraceElapsed { generation: u64 },
    /// A command got no reply in time
    CommandTimedOut { generation: u64 },
    /// A command got a successful reply
    CommandSucceeded { generation: u64 },
    /// The process ended
    Exited {
        generation: u64,
        code: Option<i32>,
        error: Option<String>,
    },
}

impl SupervisorEvent {
    pub fn generation(&self) -> u64 {
        match self {
            SupervisorEvent::ReadySignal { generation, .. }
            | SupervisorEvent::GraceElapsed { generation }
            | SupervisorEvent::CommandTimedOut { generation }
            | SupervisorEvent::CommandSucceeded { generation }
            | SupervisorEvent::Exited { generation, .. } => *generation,
        }
    }
}

/// Next state for an event that belongs to the current process.
pub fn next_state(current: SubprocessState, event: &SupervisorEvent) -> SubprocessState {
    use SubprocessState::*;

    match (current, event) {
        (_, SupervisorEvent::Exited { .. }) => Exited,
        (Starting | Degraded, SupervisorEvent::ReadySignal { .. }) => Ready,
        (Starting, SupervisorEvent::GraceElapsed { .. }) => Ready,
        (Ready, SupervisorEvent::CommandTimedOut { .. }) => Degraded,
        (Degraded, SupervisorEvent::CommandSucceeded { .. }) => Ready,
        (state, _) => state,
    }
}

/// Identity of a spawned agent process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    /// Increments on every spawn; events from older generations are ignored
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

/// Supervisor of the automation agent process
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    config: AgentConfig,
    client: ProtocolClient,
    notifier: Notifier,
    state: watch::Sender<SubprocessState>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    slot: parking_lot::Mutex<Slot>,
    control: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    process: Option<Running>,
}

struct Running {
    handle: ProcessHandle,
    stop: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Create the supervisor and its control task. Must be called inside a runtime.
    pub fn new(
        config: AgentConfig,
        client: ProtocolClient,
        notifier: Notifier,
        state: watch::Sender<SubprocessState>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
        inbox: mpsc::UnboundedReceiver<SupervisorEvent>,
    ) -> Self {
        let inner = Arc::new(SupervisorInner {
            config,
            client,
            notifier,
            state,
            events,
            slot: parking_lot::Mutex::new(Slot::default()),
            control: parking_lot::Mutex::new(None),
        });

        let control = tokio::spawn(control_loop(Arc::downgrade(&inner), inbox));
        *inner.control.lock() = Some(control);

        Self { inner }
    }

    /// Current state.
    pub fn state(&self) -> SubprocessState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SubprocessState> {
        self.inner.state.subscribe()
    }

    /// Handle of the running process, if any.
    pub fn handle(&self) -> Option<ProcessHandle> {
        self.inner
            .slot
            .lock()
            .process
            .as_ref()
            .map(|running| running.handle.clone())
    }

    /// Spawn the agent unless one is already running.
    ///
    /// Check and spawn happen under one lock, so concurrent callers share a
    /// single process.
    pub fn start(&self) -> Result<ProcessHandle> {
        let inner = &self.inner;
        let config = &inner.config;
        let mut slot = inner.slot.lock();

        if let Some(running) = &slot.process {
            debug!(generation = running.handle.generation, "agent already running");
            return Ok(running.handle.clone());
        }

        info!("Starting automation agent: {} {}", config.program, config.args.join(" "));

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!("Failed to spawn {}: {}", config.program, source);
                inner.state.send_replace(SubprocessState::Exited);
                inner.notifier.broadcast(&BridgeEvent::BridgeStatus {
                    mcp_ready: false,
                    state: SubprocessState::Exited,
                    readiness: None,
                    error: Some(format!("failed to spawn {}: {}", config.program, source)),
                });
                return Err(Error::Spawn {
                    program: config.program.clone(),
                    source,
                });
            }
        };

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => return Err(Error::Internal("agent stdio was not piped".to_string())),
        };

        slot.generation += 1;
        let generation = slot.generation;
        let handle = ProcessHandle {
            pid: child.id(),
            generation,
            started_at: Utc::now(),
        };

        inner.state.send_replace(SubprocessState::Starting);
        inner.client.attach(generation, stdin, stdout);
        tokio::spawn(forward_stderr(
            stderr,
            inner.client.clone(),
            inner.events.clone(),
            generation,
        ));

        let grace = config.ready_grace();
        let events = inner.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(SupervisorEvent::GraceElapsed { generation });
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_exit(
            child,
            stop_rx,
            inner.events.clone(),
            generation,
            config.shutdown_grace(),
        ));

        slot.process = Some(Running {
            handle: handle.clone(),
            stop: Some(stop_tx),
            watcher: Some(watcher),
        });
        drop(slot);

        info!(pid = ?handle.pid, generation, "Automation agent started");
        inner
            .notifier
            .broadcast(&BridgeEvent::status(SubprocessState::Starting));
        Ok(handle)
    }

    /// Wait until the agent is ready, has exited, or `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<SubprocessState> {
        let mut rx = self.inner.state.subscribe();
        let settled = tokio::time::timeout(timeout, async move {
            rx.wait_for(|state| {
                state.is_ready()
                    || matches!(state, SubprocessState::Exited | SubprocessState::NotStarted)
            })
            .await
            .map(|state| *state)
        })
        .await;

        match settled {
            Ok(Ok(state)) if state.is_ready() => Ok(state),
            Ok(Ok(state)) => Err(Error::Unavailable(format!("agent is {}", state))),
            Ok(Err(_)) => Err(Error::Internal("supervisor state channel closed".to_string())),
            Err(_) => Err(Error::Timeout {
                seconds: timeout.as_secs(),
            }),
        }
    }

    /// Stop the running agent: SIGINT, then SIGKILL after the shutdown grace.
    pub async fn stop(&self) {
        let (stop, watcher) = {
            let mut slot = self.inner.slot.lock();
            match slot.process.as_mut() {
                Some(running) => (running.stop.take(), running.watcher.take()),
                None => return,
            }
        };

        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                warn!("Agent exit watcher failed: {}", e);
            }
        }

        let mut rx = self.inner.state.subscribe();
        let settled = tokio::time::timeout(
            Duration::from_secs(1),
            rx.wait_for(|state| !state.is_live()),
        )
        .await;
        if settled.is_err() {
            warn!("Agent exit was not observed after stop");
        }
    }

    /// Stop the agent and the control task.
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Some(control) = self.inner.control.lock().take() {
            control.abort();
        }
    }
}

impl SupervisorInner {
    fn apply(&self, event: SupervisorEvent) {
        let generation = event.generation();
        {
            let mut slot = self.slot.lock();
            if generation != slot.generation {
                debug!(generation, current = slot.generation, "ignoring stale {:?}", event);
                return;
            }
            if matches!(event, SupervisorEvent::Exited { .. }) {
                slot.process = None;
            }
        }

        let mut exit_error = None;
        if let SupervisorEvent::Exited { code, error, .. } = &event {
            let reason = match (code, error) {
                (_, Some(error)) => format!("agent exit could not be observed: {}", error),
                (Some(code), None) => format!("agent exited with code {}", code),
                (None, None) => "agent terminated by signal".to_string(),
            };
            warn!(generation, "{}", reason);
            self.client.detach(generation);
            exit_error = Some(reason);
        }

        let current = *self.state.borrow();
        let next = next_state(current, &event);
        if next == current {
            return;
        }
        self.state.send_replace(next);

        let readiness = match (&event, next) {
            (SupervisorEvent::ReadySignal { source, .. }, SubprocessState::Ready) => {
                info!(generation, "Automation agent ready ({:?})", source);
                Some(*source)
            }
            (SupervisorEvent::GraceElapsed { .. }, SubprocessState::Ready) => {
                warn!(
                    generation,
                    "No readiness signal within {}ms; assuming the agent is ready",
                    self.config.ready_grace_ms
                );
                Some(ReadinessSource::GracePeriod)
            }
            _ => None,
        };
        if next == SubprocessState::Degraded {
            warn!(generation, "Automation agent degraded after a command timeout");
        }

        self.notifier.broadcast(&BridgeEvent::BridgeStatus {
            mcp_ready: next.is_ready(),
            state: next,
            readiness,
            error: exit_error,
        });
    }
}

async fn control_loop(
    inner: Weak<SupervisorInner>,
    mut inbox: mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    while let Some(event) = inbox.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply(event);
    }
    debug!("supervisor control loop ended");
}

async fn watch_exit(
    mut child: Child,
    stop: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    generation: u64,
    shutdown_grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = stop => interrupt(&mut child, shutdown_grace).await,
    };

    let (code, error) = match status {
        Ok(status) => (status.code(), None),
        Err(e) => (None, Some(e.to_string())),
    };
    let _ = events.send(SupervisorEvent::Exited {
        generation,
        code,
        error,
    });
}

async fn interrupt(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        debug!(pid, "sending SIGINT to agent");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            warn!("Failed to signal agent: {}", e);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Agent did not exit within {:?}, killing", grace);
            child.kill().await?;
            child.wait().await
        }
    }
}

async fn forward_stderr(
    stderr: ChildStderr,
    client: ProtocolClient,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    generation: u64,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if client.matches_ready_pattern(&line) {
                    let _ = events.send(SupervisorEvent::ReadySignal {
                        generation,
                        source: ReadinessSource::OutputMatch,
                    });
                }
                info!(target: "agent", "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("agent stderr read failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOptions;

    struct Fixture {
        supervisor: Supervisor,
        client: ProtocolClient,
        notifier: Notifier,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    }

    fn fixture(program: &str, args: &[&str], grace_ms: u64) -> Fixture {
        let config = AgentConfig {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ready_grace_ms: grace_ms,
            shutdown_grace_ms: 500,
            ..Default::default()
        };
        let (state_tx, state_rx) = watch::channel(SubprocessState::NotStarted);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new(state_rx.clone(), 32);
        let client = ProtocolClient::new(
            ClientOptions {
                command_timeout: Duration::from_secs(5),
                max_line_bytes: 64 * 1024,
                ready_patterns: config.ready_patterns.clone(),
            },
            state_rx,
            events_tx.clone(),
            notifier.clone(),
        );
        let supervisor = Supervisor::new(
            config,
            client.clone(),
            notifier.clone(),
            state_tx,
            events_tx.clone(),
            events_rx,
        );
        Fixture {
            supervisor,
            client,
            notifier,
            events: events_tx,
        }
    }

    async fn next_status(rx: &mut mpsc::Receiver<crate::notify::EventFrame>) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[test]
    fn test_transition_table() {
        use SubprocessState::*;
        let ready = SupervisorEvent::ReadySignal {
            generation: 1,
            source: ReadinessSource::StatusMessage,
        };
        let grace = SupervisorEvent::GraceElapsed { generation: 1 };
        let timed_out = SupervisorEvent::CommandTimedOut { generation: 1 };
        let ok = SupervisorEvent::CommandSucceeded { generation: 1 };
        let exited = SupervisorEvent::Exited {
            generation: 1,
            code: Some(0),
            error: None,
        };

        assert_eq!(next_state(Starting, &ready), Ready);
        assert_eq!(next_state(Starting, &grace), Ready);
        assert_eq!(next_state(Ready, &grace), Ready);
        assert_eq!(next_state(Ready, &timed_out), Degraded);
        assert_eq!(next_state(Degraded, &timed_out), Degraded);
        assert_eq!(next_state(Degraded, &ok), Ready);
        assert_eq!(next_state(Starting, &timed_out), Starting);
        assert_eq!(next_state(Exited, &ready), Exited);
        assert_eq!(next_state(NotStarted, &grace), NotStarted);
        for state in [Starting, Ready, Degraded] {
            assert_eq!(next_state(state, &exited), Exited);
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let f = fixture("sh", &["-c", "sleep 5"], 60_000);

        let mut starts = Vec::new();
        for _ in 0..8 {
            let supervisor = f.supervisor.clone();
            starts.push(tokio::spawn(async move { supervisor.start() }));
        }
        let mut handles = Vec::new();
        for start in starts {
            handles.push(start.await.unwrap().unwrap());
        }
        assert!(handles.iter().all(|h| h == &handles[0]));
        assert_eq!(handles[0].generation, 1);
        assert_eq!(f.supervisor.state(), SubprocessState::Starting);

        f.supervisor.stop().await;
        assert_eq!(f.supervisor.state(), SubprocessState::Exited);
        assert!(f.supervisor.handle().is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_exited() {
        let f = fixture("/nonexistent/agenticqa-agent", &[], 60_000);
        let mut sub = f.notifier.subscribe();
        next_status(&mut sub.rx).await;

        let err = f.supervisor.start().unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert_eq!(f.supervisor.state(), SubprocessState::Exited);

        let status = next_status(&mut sub.rx).await;
        assert_eq!(status["state"], "exited");
        assert!(status["error"].as_str().unwrap().contains("agenticqa-agent"));
    }

    #[tokio::test]
    async fn test_ready_message_marks_ready() {
        let f = fixture("sh", &["-c", "echo '{\"event\":\"mcp_ready\"}'; sleep 5"], 60_000);
        let mut sub = f.notifier.subscribe();
        next_status(&mut sub.rx).await;

        f.supervisor.start().unwrap();
        let state = f.supervisor.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(state, SubprocessState::Ready);

        assert_eq!(next_status(&mut sub.rx).await["state"], "starting");
        let ready = next_status(&mut sub.rx).await;
        assert_eq!(ready["mcpReady"], true);
        assert_eq!(ready["readiness"], "status_message");

        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stderr_banner_marks_ready() {
        let f = fixture("sh", &["-c", "echo 'MCP server listening on stdio' >&2; sleep 5"], 60_000);
        f.supervisor.start().unwrap();
        assert!(f.supervisor.wait_ready(Duration::from_secs(5)).await.is_ok());
        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_grace_period_fallback() {
        let f = fixture("sh", &["-c", "sleep 5"], 100);
        let mut sub = f.notifier.subscribe();
        next_status(&mut sub.rx).await;

        f.supervisor.start().unwrap();
        assert!(f.supervisor.wait_ready(Duration::from_secs(5)).await.is_ok());

        next_status(&mut sub.rx).await;
        let ready = next_status(&mut sub.rx).await;
        assert_eq!(ready["state"], "ready");
        assert_eq!(ready["readiness"], "grace_period");

        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_exit_before_ready_is_unavailable() {
        let f = fixture("sh", &["-c", "exit 3"], 60_000);
        f.supervisor.start().unwrap();
        let err = f.supervisor.wait_ready(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(f.supervisor.state(), SubprocessState::Exited);

        // next start spawns a new generation
        let handle = f.supervisor.start().unwrap();
        assert_eq!(handle.generation, 2);
        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let f = fixture("sh", &["-c", "sleep 5"], 60_000);
        f.supervisor.start().unwrap();
        f.supervisor.stop().await;
        let handle = f.supervisor.start().unwrap();
        assert_eq!(handle.generation, 2);

        f.events
            .send(SupervisorEvent::Exited {
                generation: 1,
                code: Some(0),
                error: None,
            })
            .unwrap();
        f.events
            .send(SupervisorEvent::ReadySignal {
                generation: 2,
                source: ReadinessSource::StatusMessage,
            })
            .unwrap();

        assert_eq!(
            f.supervisor.wait_ready(Duration::from_secs(5)).await.unwrap(),
            SubprocessState::Ready
        );
        f.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_exit_rejects_pending_commands() {
        use agenticqa_common::protocol::{CommandOptions, CommandPayload};
        use agenticqa_common::TestDefinition;

        // reads commands but never answers, then dies
        let f = fixture("sh", &["-c", "read line; sleep 0.2; exit 1"], 60_000);
        f.supervisor.start().unwrap();

        let test = TestDefinition {
            id: "t".into(),
            name: "t".into(),
            module: "m".into(),
            test_type: None,
            instructions: String::new(),
            expected_results: "x".into(),
        };
        let payload = CommandPayload::new(&test, &agenticqa_common::compile(""), CommandOptions::default());
        let result = f.client.send("execute_step", payload).await;
        assert!(matches!(result, Err(Error::SubprocessExited)));
        assert_eq!(f.client.pending_count(), 0);
    }
}
