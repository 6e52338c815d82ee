//! Error types for the financial reasoning engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {

    // =============================
    // Recoverable (turned into feedback)
    // =============================

    #[error("Invalid argument '{field}' for tool '{tool}': {reason}")]
    ArgumentValidation {
        tool: String,
        field: String,
        reason: String,
    },

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Malformed structured output: {0}")]
    Parse(String),

    #[error("Cache unavailable: {0}")]
    Cache(String),

    // =============================
    // Fatal (end the turn)
    // =============================

    #[error("Model backend failure: {0}")]
    FatalBackend(String),

    #[error("Streaming producer failed: {0}")]
    StreamingProducer(String),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Profile store error: {0}")]
    ProfileStore(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl EngineError {
    /// Errors the model can correct on its own by seeing feedback.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::ArgumentValidation { .. }
                | EngineError::ToolExecution { .. }
                | EngineError::UnknownTool(_)
                | EngineError::Parse(_)
                | EngineError::Cache(_)
        )
    }

    /// Text safe to show to the end user when a turn fails.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::FatalBackend(_) => {
                "Sorry, the assistant is temporarily unavailable. Please try again in a moment."
                    .to_string()
            }
            EngineError::StreamingProducer(_) => {
                "Sorry, the answer was interrupted before it could be completed.".to_string()
            }
            EngineError::Cancelled => "The request was cancelled.".to_string(),
            _ => "Sorry, something went wrong while preparing your answer.".to_string(),
        }
    }
}

/// Failure carried inside a tool result. Cloneable so it can be logged,
/// rendered as feedback and kept in the turn trace.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid argument '{field}': {reason}")]
    ArgumentValidation { field: String, reason: String },

    #[error("no tool named '{0}' is available")]
    UnknownTool(String),

    #[error("{0}")]
    Execution(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),
}

impl ToolError {
    /// Lift into the engine taxonomy, naming the tool involved.
    pub fn into_engine_error(self, tool: &str) -> EngineError {
        match self {
            ToolError::ArgumentValidation { field, reason } => EngineError::ArgumentValidation {
                tool: tool.to_string(),
                field,
                reason,
            },
            ToolError::UnknownTool(name) => EngineError::UnknownTool(name),
            ToolError::Execution(message) => EngineError::ToolExecution {
                tool: tool.to_string(),
                message,
            },
            ToolError::Timeout(ms) => EngineError::ToolExecution {
                tool: tool.to_string(),
                message: format!("timed out after {} ms", ms),
            },
        }
    }
}
