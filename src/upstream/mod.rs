pub mod connection;

pub use connection::{
    ExecuteOutcome, SimpleResult, StatementDescription, UpstreamConfig, UpstreamConnection,
};

use thiserror::Error;

/// The forwardable fields of a backend error. These travel to the client
/// verbatim so application tests observe the same SQLSTATE, message and
/// position a direct connection would.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgErrorInfo {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
}

impl PgErrorInfo {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR".to_string(),
            code: "XX000".to_string(),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
        }
    }
}

impl std::fmt::Display for PgErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    Db(PgErrorInfo),
}

impl UpstreamError {
    /// Whether the error means the upstream connection is dead and the
    /// session must be evicted. Backend SQL errors are never fatal; the
    /// execution guard recovers from those.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::Protocol(message) => {
                let lowered = message.to_ascii_lowercase();
                lowered.contains("connection closed")
                    || lowered.contains("connection reset")
                    || lowered.contains("broken pipe")
                    || lowered.contains("connection refused")
                    || lowered.contains("unexpected eof")
            }
            Self::Db(_) => false,
        }
    }

    pub fn db_error(&self) -> Option<&PgErrorInfo> {
        match self {
            Self::Db(info) => Some(info),
            _ => None,
        }
    }
}
