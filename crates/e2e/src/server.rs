//! Bridge management - serving a bridge on ephemeral ports and health checking it

use agenticqa_common::SubprocessState;
use agenticqa_daemon::http::{self, AppState};
use agenticqa_daemon::{Bridge, BridgeConfig};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{E2eError, E2eResult};

/// Bridge config that runs `program` as the agent with fast timeouts.
pub fn agent_config(program: &str, args: &[&str]) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.agent.program = program.to_string();
    config.agent.args = args.iter().map(|a| a.to_string()).collect();
    config.agent.ready_grace_ms = 500;
    config.agent.shutdown_grace_ms = 500;
    config.protocol.command_timeout_ms = 2_000;
    config.execution.run_timeout_ms = 20_000;
    config
}

/// A bridge serving HTTP and the push channel on ephemeral local ports
pub struct BridgeHarness {
    pub bridge: Arc<Bridge>,
    pub base_url: String,
    pub push_url: String,
    shutdown: watch::Sender<bool>,
    servers: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl BridgeHarness {
    /// Build the bridge and serve it.
    pub async fn spawn(config: BridgeConfig) -> E2eResult<Self> {
        let bridge = Arc::new(Bridge::new(config)?);
        let state = AppState::new(bridge.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let push_listener = TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let push_url = format!("ws://{}/", push_listener.local_addr()?);
        info!("Serving test bridge at {}", base_url);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let servers = vec![
            tokio::spawn(http::serve(
                listener,
                http::router(state.clone()),
                stopped(shutdown_rx.clone()),
            )),
            tokio::spawn(http::serve(
                push_listener,
                http::push_router(state),
                stopped(shutdown_rx),
            )),
        ];

        let harness = Self {
            bridge,
            base_url,
            push_url,
            shutdown,
            servers,
        };
        harness.wait_for_healthy(Duration::from_secs(5)).await?;
        Ok(harness)
    }

    /// Wait for the bridge to answer status requests
    async fn wait_for_healthy(&self, timeout: Duration) -> E2eResult<()> {
        let status_url = format!("{}/api/status", self.base_url);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = std::time::Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout {
            attempts += 1;
            match client.get(&status_url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => warn!("Status check returned {}", resp.status()),
                Err(e) => {
                    if !e.is_connect() {
                        warn!("Status check error: {}", e);
                    }
                }
            }
            sleep(Duration::from_millis(50)).await;
        }

        Err(E2eError::BridgeHealthCheck(attempts))
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Push channel served on the façade listener.
    pub fn ws_url(&self) -> String {
        format!("{}/ws", self.base_url.replacen("http", "ws", 1))
    }

    /// GET a JSON endpoint, returning status code and body.
    pub async fn get_json(&self, path: &str) -> E2eResult<(u16, Value)> {
        let resp = reqwest::get(self.url(path)).await?;
        let status = resp.status().as_u16();
        Ok((status, serde_json::from_str(&resp.text().await?)?))
    }

    /// POST a JSON body, returning status code and body.
    pub async fn post_json(&self, path: &str, body: &Value) -> E2eResult<(u16, Value)> {
        let resp = reqwest::Client::new()
            .post(self.url(path))
            .json(body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        Ok((status, serde_json::from_str(&resp.text().await?)?))
    }

    /// Wait until the agent state satisfies `done`.
    pub async fn wait_for_state<F>(&self, what: &str, timeout: Duration, done: F) -> E2eResult<()>
    where
        F: Fn(SubprocessState) -> bool,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if done(self.bridge.state()) {
                return Ok(());
            }
            sleep(Duration::from_millis(20)).await;
        }
        Err(E2eError::Timeout(what.to_string()))
    }

    /// Stop the servers and the agent.
    pub async fn stop(self) -> E2eResult<()> {
        let _ = self.shutdown.send(true);
        self.bridge.shutdown().await;
        for server in self.servers {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(E2eError::BridgeShutdown(e.to_string())),
                Err(e) => return Err(E2eError::BridgeShutdown(e.to_string())),
            }
        }
        Ok(())
    }
}

async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
