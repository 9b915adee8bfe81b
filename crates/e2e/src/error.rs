//! Error types for end-to-end testing

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Bridge failed to shut down cleanly: {0}")]
    BridgeShutdown(String),

    #[error("Bridge health check failed after {0} attempts")]
    BridgeHealthCheck(usize),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] agenticqa_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;
