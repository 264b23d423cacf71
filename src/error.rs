//! Error types for the cadence orchestrator.
//!
//! Nothing in this crate is fatal to the process: every failure is scoped to
//! a single handler invocation, command, turn or request.

/// Top-level error type for the turn-taking core.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A registered event handler failed. Logged by the dispatcher, which
    /// keeps delivering to the remaining handlers.
    #[error("handler error: {0}")]
    Handler(String),

    /// The surrounding unit of work was cancelled (barge-in or shutdown).
    ///
    /// Not a failure: it must propagate through dispatch untouched.
    #[error("cancelled")]
    Cancelled,

    /// The model asked for a tool nobody registered.
    #[error("tool resolution error: {0}")]
    ToolResolution(String),

    /// The owning collaborator returned a non-OK result for a tool call.
    #[error("tool execution error: {0}")]
    ToolExecution(String),

    /// The model transport closed or failed mid-stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed inbound command payload or configuration file.
    #[error("config error: {0}")]
    Config(String),

    /// Host envelope failed contract validation.
    #[error("contract error: {0}")]
    Contract(String),

    /// Long-term memory store failure.
    #[error("memory error: {0}")]
    Memory(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Returns true for the cancellation signal, which callers must re-raise
    /// instead of logging.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
