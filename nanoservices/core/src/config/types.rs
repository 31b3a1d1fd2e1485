use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::store::models::{NewConnection, NewConnector};

#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    /// SQLite path; in-memory when absent.
    pub database: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// e.g. "127.0.0.1:9100"; no exporter when absent.
    pub metrics_addr: Option<String>,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub sources: Vec<ConnectorConfig>,
    #[serde(default)]
    pub destinations: Vec<ConnectorConfig>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            database: None,
            log_level: default_log_level(),
            metrics_addr: None,
            job: JobConfig::default(),
            sources: Vec::new(),
            destinations: Vec::new(),
            connections: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Non-2xx responses retried per request before a job fails.
    pub max_retries: u32,
    /// Wall-clock limit for a whole job.
    pub timeout_secs: u64,
    /// Per-request HTTP timeout.
    pub http_timeout_secs: u64,
    pub user_agent: Option<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::job::DEFAULT_MAX_RETRIES,
            timeout_secs: 60 * 60,
            http_timeout_secs: 30,
            user_agent: None,
        }
    }
}

impl JobConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// A source or destination to create on startup if missing.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub credentials: Value,
    #[serde(default)]
    pub options: Value,
}

impl ConnectorConfig {
    pub fn to_new(&self) -> NewConnector {
        NewConnector {
            id: Some(self.id.clone()),
            provider: self.provider.clone(),
            credentials: self.credentials.clone(),
            options: self.options.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub id: String,
    pub source: String,
    pub destination: String,
    pub schedule: String,
}

impl ConnectionConfig {
    pub fn to_new(&self) -> NewConnection {
        NewConnection {
            id: Some(self.id.clone()),
            source_id: self.source.clone(),
            destination_id: self.destination.clone(),
            schedule: self.schedule.clone(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
