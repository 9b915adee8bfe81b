//! AgenticQA Common Library
//!
//! Shared types, the automation agent wire protocol and the instruction
//! compiler used by the bridge daemon.

pub mod compiler;
pub mod error;
pub mod events;
pub mod protocol;
pub mod types;

// Re-export commonly used types
pub use compiler::compile;
pub use error::{Error, Result};
pub use events::BridgeEvent;
pub use protocol::{InboundMessage, LineBuffer, OutboundCommand, ReplyPayload};
pub use types::*;

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
