use reqwest::Error as ReqwestError;
use rusqlite::Error as SqliteError;
use serde_json::Error as JsonError;
use thiserror::Error;
use tokio::io::Error as TokioIoError;
use url::ParseError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Reqwest Error: {0}")]
    Http(#[from] ReqwestError),

    #[error("Tokio Error: {0}")]
    TokioError(#[from] TokioIoError),

    #[error("Json Error: {0}")]
    Json(#[from] JsonError),

    #[error("Sqlite Error: {0}")]
    Sqlite(#[from] SqliteError),

    #[error("Url Error: {0}")]
    UrlParseError(#[from] ParseError),

    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional write found the record in a state that did not satisfy
    /// its precondition (e.g. finishing a connection that holds no token).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("exceeded {attempts} attempts fetching '{url}' (last status {status})")]
    RetriesExhausted {
        url: String,
        status: u16,
        attempts: u32,
    },

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("unknown orchestration action '{0}'")]
    UnknownAction(String),

    #[error("no {kind} registered under '{name}'")]
    UnknownProvider { kind: &'static str, name: String },

    #[error("invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("invalid stream layout: {0}")]
    InvalidStreams(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// True for failed preconditions on conditional writes.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
