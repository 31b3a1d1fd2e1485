use async_trait::async_trait;
use relayflow_utils::FlowResult;
use serde_json::Value;

use crate::registry::ConnectorRegistry;

/// Supplies the credentials a source or destination authenticates with.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn get(&self) -> FlowResult<Value>;
}

/// Hands back the configured values unchanged.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Value);

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn get(&self) -> FlowResult<Value> {
        Ok(self.0.clone())
    }
}

/// Key that routes credentials through a registered provider.
pub const PROVIDER_KEY: &str = "provider";

/// Build the provider for a credentials object: a registered provider when
/// the object names one, otherwise a static pass-through.
pub fn provider_for(
    registry: &ConnectorRegistry,
    config: &Value,
) -> FlowResult<Box<dyn CredentialsProvider>> {
    match config.get(PROVIDER_KEY).and_then(Value::as_str) {
        Some(name) => registry.credentials_provider(name, config),
        None => Ok(Box::new(StaticCredentials(config.clone()))),
    }
}

#[tracing::instrument(skip(registry, config))]
pub async fn resolve(
    owner: &str,
    registry: &ConnectorRegistry,
    config: &Value,
) -> FlowResult<Value> {
    let provider = provider_for(registry, config)?;
    let credentials = provider.get().await?;
    tracing::debug!("credentials resolved");
    Ok(credentials)
}
