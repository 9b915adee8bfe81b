//! AgenticQA end-to-end test support
//!
//! - `mock-agent`: a stand-in automation agent speaking the bridge's
//!   line-delimited JSON protocol, with scriptable misbehaviour
//! - [`BridgeHarness`]: an in-process bridge served on ephemeral ports
//!
//! ```text
//! test ──HTTP──▶ BridgeHarness (axum) ──▶ Bridge ──stdio──▶ mock-agent
//!                       ▲                    │
//!                       └── push events ◀────┘
//! ```

pub mod agent;
pub mod error;
pub mod server;

pub use agent::{AgentMode, AgentOptions, MockAgent};
pub use error::{E2eError, E2eResult};
pub use server::BridgeHarness;
