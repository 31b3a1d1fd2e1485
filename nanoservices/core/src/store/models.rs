use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A scheduled source-to-destination sync.
///
/// `run_token` is set exactly while a job is believed to be in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source_id: String,
    pub destination_id: String,
    pub schedule: String,
    pub run_token: Option<String>,
    pub last_ran_at: Option<DateTime<Utc>>,
    pub execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewConnection {
    /// Minted when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub source_id: String,
    pub destination_id: String,
    pub schedule: String,
}

/// Stored configuration of a source or destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorRecord {
    pub id: String,
    pub provider: String,
    pub credentials: Value,
    pub options: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewConnector {
    #[serde(default)]
    pub id: Option<String>,
    pub provider: String,
    #[serde(default)]
    pub credentials: Value,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// Durable record of one orchestration execution. `action` is the last
/// envelope persisted before it was acted on.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub id: String,
    pub connection_id: String,
    pub restart_count: u32,
    pub status: ExecutionStatus,
    pub action: Value,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}
