//! Error types for the AgenticQA bridge

use thiserror::Error;

/// Result type alias using the bridge Error
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to spawn automation agent `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No reply for command {command_id} after {timeout_ms}ms")]
    ProtocolTimeout { command_id: String, timeout_ms: u64 },

    #[error("Malformed message from automation agent: {0}")]
    MalformedMessage(String),

    #[error("Automation agent process exited")]
    SubprocessExited,

    #[error("Automation agent unavailable: {0}")]
    Unavailable(String),

    #[error("Automation agent reported an error: {0}")]
    Remote(String),

    #[error("Invalid test definition: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the failure means the subprocess can no longer serve commands.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            Error::SubprocessExited | Error::Unavailable(_) | Error::Spawn { .. }
        )
    }

    /// HTTP status code the façade answers with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::SubprocessExited | Error::Unavailable(_) | Error::Spawn { .. } => 503,
            Error::ProtocolTimeout { .. } | Error::Timeout { .. } => 504,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_systemic_errors_map_to_service_unavailable() {
        let spawn = Error::Spawn {
            program: "npx".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(spawn.is_systemic());
        assert_eq!(spawn.http_status(), 503);
        assert_eq!(Error::SubprocessExited.http_status(), 503);
        assert!(!Error::Remote("boom".into()).is_systemic());
    }

    #[test]
    fn test_validation_maps_to_bad_request() {
        assert_eq!(Error::Validation("id required".into()).http_status(), 400);
        assert_eq!(Error::Internal("x".into()).http_status(), 500);
    }
}
