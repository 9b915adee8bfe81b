//! Push-channel events sent to tracker subscribers

use crate::types::{ExecutionReport, ReadinessSource, SubprocessState};
use serde::Serialize;

/// Event broadcast to every connected subscriber
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    #[serde(rename_all = "camelCase")]
    BridgeStatus {
        mcp_ready: bool,
        state: SubprocessState,
        #[serde(skip_serializing_if = "Option::is_none")]
        readiness: Option<ReadinessSource>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TestStarted { test_id: String, timestamp: String },
    TestCompleted(ExecutionReport),
    #[serde(rename_all = "camelCase")]
    TestError {
        test_id: String,
        error: String,
        timestamp: String,
    },
    /// Unsolicited event emitted by the automation agent
    AgentEvent {
        event: String,
        data: serde_json::Value,
    },
}

impl BridgeEvent {
    pub fn status(state: SubprocessState) -> Self {
        BridgeEvent::BridgeStatus {
            mcp_ready: state.is_ready(),
            state,
            readiness: None,
            error: None,
        }
    }

    pub fn test_started(test_id: &str) -> Self {
        BridgeEvent::TestStarted {
            test_id: test_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn test_error(test_id: &str, error: impl ToString) -> Self {
        BridgeEvent::TestError {
            test_id: test_id.to_string(),
            error: error.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Test id carried by lifecycle events.
    pub fn test_id(&self) -> Option<&str> {
        match self {
            BridgeEvent::TestStarted { test_id, .. } | BridgeEvent::TestError { test_id, .. } => {
                Some(test_id)
            }
            BridgeEvent::TestCompleted(report) => Some(&report.test_id),
            BridgeEvent::BridgeStatus { .. } | BridgeEvent::AgentEvent { .. } => None,
        }
    }
}
