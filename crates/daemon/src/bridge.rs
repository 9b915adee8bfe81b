//! The bridge instance
//!
//! One [`Bridge`] owns the agent supervisor, the protocol client, the
//! notifier and the orchestrator. Build it with [`Bridge::new`] inside a
//! Tokio runtime and tear it down with [`Bridge::shutdown`].

use crate::client::{ClientOptions, ProtocolClient};
use crate::config::BridgeConfig;
use crate::notify::Notifier;
use crate::orchestrator::{AutomationBackend, Orchestrator};
use crate::supervisor::{ProcessHandle, Supervisor};
use agenticqa_common::protocol::CommandPayload;
use agenticqa_common::{
    Error, ExecutionReport, ReplyPayload, Result, SubprocessState, TestDefinition,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Slack added to the readiness grace when a run waits for the agent
const READY_MARGIN: Duration = Duration::from_secs(3);

/// [`AutomationBackend`] backed by the supervised agent process
#[derive(Clone)]
pub struct AgentBackend {
    supervisor: Supervisor,
    client: ProtocolClient,
    ready_timeout: Duration,
    ready_retries: u32,
}

#[async_trait]
impl AutomationBackend for AgentBackend {
    async fn ensure_ready(&self) -> Result<()> {
        let mut last_error = None;

        for attempt in 0..=self.ready_retries {
            if attempt > 0 {
                warn!("Retrying agent readiness (attempt {})", attempt + 1);
            }
            if let Err(e) = self.supervisor.start() {
                warn!("Agent start failed: {}", e);
                last_error = Some(e);
                continue;
            }
            match self.supervisor.wait_ready(self.ready_timeout).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!("Agent not ready: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(Error::Unavailable(match last_error {
            Some(e) => e.to_string(),
            None => "agent never became ready".to_string(),
        }))
    }

    async fn send(&self, command: &str, payload: CommandPayload) -> Result<ReplyPayload> {
        let reply = self.client.send(command, payload).await?;
        ReplyPayload::from_value(reply)
    }
}

/// Bridge between tracker clients and the automation agent
pub struct Bridge {
    config: BridgeConfig,
    supervisor: Supervisor,
    client: ProtocolClient,
    notifier: Notifier,
    orchestrator: Orchestrator<AgentBackend>,
}

impl Bridge {
    /// Wire the components together. Does not spawn the agent.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(SubprocessState::NotStarted);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let notifier = Notifier::new(state_rx.clone(), config.http.subscriber_queue);
        let client = ProtocolClient::new(
            ClientOptions {
                command_timeout: config.protocol.command_timeout(),
                max_line_bytes: config.protocol.max_line_bytes,
                ready_patterns: config.agent.ready_patterns.clone(),
            },
            state_rx,
            events_tx.clone(),
            notifier.clone(),
        );
        let supervisor = Supervisor::new(
            config.agent.clone(),
            client.clone(),
            notifier.clone(),
            state_tx,
            events_tx,
            events_rx,
        );

        let backend = AgentBackend {
            supervisor: supervisor.clone(),
            client: client.clone(),
            ready_timeout: config.agent.ready_grace() + READY_MARGIN,
            ready_retries: config.agent.ready_retries,
        };
        let orchestrator = Orchestrator::new(backend, notifier.clone(), config.execution.clone());

        Ok(Self {
            config,
            supervisor,
            client,
            notifier,
            orchestrator,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn state(&self) -> SubprocessState {
        self.supervisor.state()
    }

    /// Spawn the agent (no-op if it is already running).
    pub fn start(&self) -> Result<ProcessHandle> {
        self.supervisor.start()
    }

    pub fn process(&self) -> Option<ProcessHandle> {
        self.supervisor.handle()
    }

    /// Commands awaiting a reply.
    pub fn pending_commands(&self) -> usize {
        self.client.pending_count()
    }

    /// Run one test to completion.
    pub async fn execute(&self, test: &TestDefinition) -> Result<ExecutionReport> {
        self.orchestrator.execute(test).await
    }

    /// Ask the running agent which tools it offers.
    ///
    /// Does not start the agent; fails with [`Error::Unavailable`] when none is running.
    pub async fn list_tools(&self) -> Result<serde_json::Value> {
        self.client
            .send(&self.config.execution.tools_command, serde_json::json!({}))
            .await
    }

    /// Stop the agent and the supervisor.
    pub async fn shutdown(&self) {
        info!("Shutting down bridge");
        self.supervisor.shutdown().await;
        self.client.fail_all();
    }
}
