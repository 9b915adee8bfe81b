//! Bridge configuration

use agenticqa_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// HTTP façade configuration
    pub http: HttpConfig,

    /// Automation agent process configuration
    pub agent: AgentConfig,

    /// Wire protocol configuration
    pub protocol: ProtocolConfig,

    /// Run configuration
    pub execution: ExecutionConfig,
}

/// HTTP and push-channel listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// HTTP listen address (also serves the push channel at `/ws`)
    pub listen: SocketAddr,

    /// Dedicated push-channel listener, served at `/`
    pub push_listen: Option<SocketAddr>,

    /// Bound on simultaneously running executions (None = unbounded)
    pub max_concurrent_runs: Option<usize>,

    /// Finished asynchronous executions kept for polling
    pub max_retained_executions: usize,

    /// Outbound queue depth per push subscriber
    pub subscriber_queue: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3001)),
            push_listen: Some(SocketAddr::from(([127, 0, 0, 1], 3002))),
            max_concurrent_runs: None,
            max_retained_executions: 256,
            subscriber_queue: 64,
        }
    }
}

/// Automation agent process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Program to launch
    pub program: String,

    /// Program arguments
    pub args: Vec<String>,

    /// Extra environment variables
    pub env: HashMap<String, String>,

    /// Working directory
    pub working_dir: Option<String>,

    /// Start the agent when the bridge starts instead of on first run
    pub autostart: bool,

    /// Assume readiness after this long without a signal if the process is alive
    pub ready_grace_ms: u64,

    /// Stdout substrings that announce readiness
    pub ready_patterns: Vec<String>,

    /// Extra readiness attempts before a run gives up
    pub ready_retries: u32,

    /// Time between SIGINT and SIGKILL on shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            args: vec!["@playwright/mcp@latest".to_string()],
            env: HashMap::new(),
            working_dir: None,
            autostart: true,
            ready_grace_ms: 7_000,
            ready_patterns: vec![
                "Playwright MCP ready".to_string(),
                "MCP server listening".to_string(),
            ],
            ready_retries: 1,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl AgentConfig {
    pub fn ready_grace(&self) -> Duration {
        Duration::from_millis(self.ready_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Wire protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Per-command reply timeout
    pub command_timeout_ms: u64,

    /// Longest accepted stdout line
    pub max_line_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 35_000,
            max_line_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ProtocolConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// How steps are handed to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One command per step
    PerStep,
    /// One command carrying every step
    Batch,
}

impl Default for DispatchMode {
    fn default() -> Self {
        Self::PerStep
    }
}

/// Run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub dispatch: DispatchMode,

    /// Command name used in per-step mode
    pub step_command: String,

    /// Command name used in batch mode
    pub batch_command: String,

    /// Command name that asks the agent for its tool list
    pub tools_command: String,

    /// Ceiling on a whole run, distinct from the per-command timeout
    pub run_timeout_ms: u64,

    pub capture_screenshots: bool,

    pub validate_results: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchMode::PerStep,
            step_command: "execute_step".to_string(),
            batch_command: "run_playwright_test".to_string(),
            tools_command: "list_tools".to_string(),
            run_timeout_ms: 300_000,
            capture_screenshots: true,
            validate_results: true,
        }
    }
}

impl ExecutionConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

impl BridgeConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.agent.program.trim().is_empty() {
            return Err(Error::InvalidConfig("agent.program is empty".to_string()));
        }
        if self.protocol.command_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "protocol.command_timeout_ms must be positive".to_string(),
            ));
        }
        if self.execution.run_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "execution.run_timeout_ms must be positive".to_string(),
            ));
        }
        if self.protocol.max_line_bytes == 0 {
            return Err(Error::InvalidConfig(
                "protocol.max_line_bytes must be positive".to_string(),
            ));
        }
        if self.http.subscriber_queue == 0 {
            return Err(Error::InvalidConfig(
                "http.subscriber_queue must be positive".to_string(),
            ));
        }
        if self.http.max_concurrent_runs == Some(0) {
            return Err(Error::InvalidConfig(
                "http.max_concurrent_runs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}
