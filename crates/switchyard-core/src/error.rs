use thiserror::Error;

/// A convenience `Result` alias using [`SwitchyardError`].
pub type SwitchyardResult<T> = Result<T, SwitchyardError>;

/// Top-level error type shared by the registry, the bus and the host binary.
///
/// Each variant corresponds to one failure family. Library operations that
/// the caller is expected to probe (unknown ids, timeouts) report those as
/// `bool`/`Option` values instead; these variants cover the rest.
#[derive(Error, Debug)]
pub enum SwitchyardError {
    /// No agent is registered under the given id.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// An agent hook (start, stop, execute, health check) failed.
    #[error("Agent error: {0}")]
    Agent(String),

    /// The agent does not implement the requested operation or task type.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Connecting to or publishing through the message transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Provisioning or writing to a persistent stream failed.
    #[error("Stream error: {0}")]
    Stream(String),

    /// A stream with this name has already been provisioned.
    #[error("Stream already exists: {0}")]
    StreamExists(String),

    /// A subscription could not be created or is unknown.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// The operation was cancelled before it completed (e.g. bus shutdown).
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchyardError {
    /// Whether this error reports that a stream was already provisioned.
    ///
    /// Stream creation is idempotent, so callers swallow this case.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, SwitchyardError::StreamExists(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = SwitchyardError::AgentNotFound("abc".into());
        assert_eq!(err.to_string(), "Agent not found: abc");
    }

    #[test]
    fn test_already_exists_detection() {
        assert!(SwitchyardError::StreamExists("EVENTS".into()).is_already_exists());
        assert!(!SwitchyardError::Stream("disk full".into()).is_already_exists());
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: SwitchyardError = parse.unwrap_err().into();
        assert!(matches!(err, SwitchyardError::Json(_)));
    }
}
