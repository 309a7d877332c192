use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One offending parameter reported by schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentProblem {
    pub param: String,
    pub reason: String,
}

impl std::fmt::Display for ArgumentProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.param, self.reason)
    }
}

fn join_problems(problems: &[ArgumentProblem]) -> String {
    problems.iter().map(|p| p.to_string()).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {}", join_problems(.problems))]
    InvalidArguments { tool: String, problems: Vec<ArgumentProblem> },
}

/// Startup-time registration failures; never raised by `invoke`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool already registered: {0}")]
    DuplicateTool(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    Transport,
    Timeout,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("model gateway unavailable ({reason:?}): {message}")]
    Unavailable { reason: UnavailableReason, message: String },
    #[error("malformed model output: {0}")]
    MalformedOutput(String),
}

impl GatewayError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Unavailable { reason: UnavailableReason::Transport, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Unavailable { reason: UnavailableReason::Timeout, message: message.into() }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedOutput(message.into())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::timeout(err.to_string())
        } else if err.is_decode() {
            GatewayError::malformed(err.to_string())
        } else {
            GatewayError::transport(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("memory store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Unavailable(format!("corrupt record: {err}"))
    }
}

/// Error kind carried by a failed loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopErrorKind {
    GatewayUnavailable,
    ParseError,
    StoreUnavailable,
    Cancelled,
}

impl LoopErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopErrorKind::GatewayUnavailable => "gateway_unavailable",
            LoopErrorKind::ParseError => "parse_error",
            LoopErrorKind::StoreUnavailable => "store_unavailable",
            LoopErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for LoopErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
