use std::collections::HashSet;
use std::path::Path;

use crate::config::types::FlowConfig;
use crate::schedule::CronSchedule;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for relayflow_utils::error::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(e) => e.into(),
            other => relayflow_utils::error::Error::InvalidInput(other.to_string()),
        }
    }
}

/// Load and validate a config from a YAML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<FlowConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate a config from a YAML string.
pub fn parse_config(yaml: &str) -> Result<FlowConfig, ConfigError> {
    let config: FlowConfig = serde_yaml::from_str(yaml)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &FlowConfig) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for connection in &config.connections {
        if !seen.insert(connection.id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "connection '{}' declared twice",
                connection.id
            )));
        }
        CronSchedule::parse(&connection.schedule)
            .map_err(|e| ConfigError::Invalid(format!("connection '{}': {e}", connection.id)))?;
    }
    if let Some(addr) = &config.metrics_addr {
        addr.parse::<std::net::SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("metrics_addr '{addr}': {e}")))?;
    }
    Ok(())
}
