use std::collections::HashMap;
use std::sync::Arc;

use relayflow_utils::error::Error;
use relayflow_utils::FlowResult;
use serde_json::Value;

use crate::credentials::CredentialsProvider;
use crate::destinations::traits::Destination;
use crate::sources::traits::Source;

/// Builds a source from its stored options.
pub type SourceFactory = dyn Fn(&Value) -> FlowResult<Box<dyn Source>> + Send + Sync;
/// Builds a destination from its stored options and resolved credentials.
pub type DestinationFactory =
    dyn Fn(&Value, &Value) -> FlowResult<Box<dyn Destination>> + Send + Sync;
/// Builds a credentials provider from the credentials object naming it.
pub type CredentialsFactory =
    dyn Fn(&Value) -> FlowResult<Box<dyn CredentialsProvider>> + Send + Sync;

/// Name-keyed factories of one kind.
pub struct Registry<F: ?Sized> {
    kind: &'static str,
    entries: HashMap<String, Arc<F>>,
}

impl<F: ?Sized> Registry<F> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, factory: Arc<F>) {
        let name = name.into();
        if self.entries.insert(name.clone(), factory).is_some() {
            tracing::warn!(kind = self.kind, provider = %name, "replaced registered factory");
        }
    }

    pub fn get(&self, name: &str) -> FlowResult<&F> {
        self.entries
            .get(name)
            .map(|f| f.as_ref())
            .ok_or_else(|| Error::UnknownProvider {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Every connector the process knows how to build. Populated at startup, then
/// shared read-only behind an `Arc`.
pub struct ConnectorRegistry {
    sources: Registry<SourceFactory>,
    destinations: Registry<DestinationFactory>,
    credentials: Registry<CredentialsFactory>,
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            sources: Registry::new("source"),
            destinations: Registry::new("destination"),
            credentials: Registry::new("credentials provider"),
        }
    }

    pub fn register_source<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> FlowResult<Box<dyn Source>> + Send + Sync + 'static,
    {
        self.sources.insert(name, Arc::new(factory));
        self
    }

    pub fn register_destination<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value, &Value) -> FlowResult<Box<dyn Destination>> + Send + Sync + 'static,
    {
        self.destinations.insert(name, Arc::new(factory));
        self
    }

    pub fn register_credentials<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> FlowResult<Box<dyn CredentialsProvider>> + Send + Sync + 'static,
    {
        self.credentials.insert(name, Arc::new(factory));
        self
    }

    pub fn source(&self, provider: &str, options: &Value) -> FlowResult<Box<dyn Source>> {
        (self.sources.get(provider)?)(options)
    }

    pub fn destination(
        &self,
        provider: &str,
        options: &Value,
        credentials: &Value,
    ) -> FlowResult<Box<dyn Destination>> {
        (self.destinations.get(provider)?)(options, credentials)
    }

    pub fn credentials_provider(
        &self,
        provider: &str,
        config: &Value,
    ) -> FlowResult<Box<dyn CredentialsProvider>> {
        (self.credentials.get(provider)?)(config)
    }

    pub fn has_source(&self, provider: &str) -> bool {
        self.sources.contains(provider)
    }

    pub fn has_destination(&self, provider: &str) -> bool {
        self.destinations.contains(provider)
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{SourceBuilder, StreamBuilder};
    use serde_json::json;

    fn registry() -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        registry.register_source("static", |options: &Value| {
            let url = options["url"].as_str().unwrap_or("https://example.com").to_string();
            let source = SourceBuilder::new("static")
                .stream(StreamBuilder::new("items").seed_request(url).build()?)
                .build()?;
            Ok(Box::new(source) as Box<dyn Source>)
        });
        registry
    }

    #[test]
    fn builds_registered_source_with_options() {
        let registry = registry();
        let source = registry.source("static", &json!({"url": "https://a"})).unwrap();
        assert_eq!(source.name(), "static");
        assert_eq!(source.streams().len(), 1);
        assert!(registry.has_source("static"));
        assert_eq!(registry.source_names(), vec!["static"]);
    }

    #[test]
    fn unknown_source_is_reported_by_kind() {
        let err = registry().source("jira", &Value::Null).err().unwrap();
        assert!(matches!(err, Error::UnknownProvider { kind: "source", ref name } if name == "jira"));
    }

    #[test]
    fn unknown_destination_is_reported_by_kind() {
        let registry = registry();
        assert!(!registry.has_destination("s3"));
        let err = registry.destination("s3", &Value::Null, &Value::Null).err().unwrap();
        assert!(matches!(err, Error::UnknownProvider { kind: "destination", .. }));
    }
}
