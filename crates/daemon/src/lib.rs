//! AgenticQA bridge daemon
//!
//! Supervises the browser automation agent, runs tests against it and
//! serves results over HTTP and a WebSocket push channel.

pub mod bridge;
pub mod client;
pub mod config;
pub mod http;
pub mod notify;
pub mod orchestrator;
pub mod registry;
pub mod supervisor;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use notify::Notifier;
pub use orchestrator::{AutomationBackend, Orchestrator};
pub use supervisor::{ProcessHandle, Supervisor, SupervisorEvent};
