//! Declarative construction of sources and streams from static values or
//! closures.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use relayflow_utils::error::Error;
use relayflow_utils::FlowResult;
use serde_json::Value;

use crate::dag::node::StreamNode;
use crate::dag::resolver;
use crate::sources::rate_limit::RequestSpacing;
use crate::sources::traits::{
    default_transform, Continuation, Request, Response, Source, SourceContext, Stream,
    StreamContext, DEFAULT_REQUEST_SPACING,
};

type SeedFn = dyn Fn(&StreamContext) -> FlowResult<Request> + Send + Sync;
type NextFn = dyn Fn(&Response, &[Value], &StreamContext) -> FlowResult<Continuation> + Send + Sync;
type TransformFn = dyn Fn(&str, &StreamContext) -> FlowResult<Vec<Value>> + Send + Sync;
type HeadersFn = dyn Fn(&SourceContext) -> FlowResult<BTreeMap<String, String>> + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("stream '{0}' has no seed")]
    NoSeed(String),
    #[error("source '{0}' declares no streams")]
    NoStreams(String),
    #[error("stream layout rejected: {0}")]
    Streams(#[from] Error),
}

impl From<BuildError> for Error {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Streams(inner) => inner,
            other => Error::InvalidStreams(other.to_string()),
        }
    }
}

/// Either a fixed value or a function of the call context.
pub enum StaticOr<T, F: ?Sized> {
    Static(T),
    Dynamic(Arc<F>),
}

impl<T: Clone, F: ?Sized> Clone for StaticOr<T, F> {
    fn clone(&self) -> Self {
        match self {
            StaticOr::Static(v) => StaticOr::Static(v.clone()),
            StaticOr::Dynamic(f) => StaticOr::Dynamic(Arc::clone(f)),
        }
    }
}

pub struct FnStream {
    name: String,
    parent: Option<String>,
    seed: StaticOr<Request, SeedFn>,
    next: Option<Arc<NextFn>>,
    transform: Option<Arc<TransformFn>>,
}

impl Stream for FnStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn seed(&self, context: &StreamContext) -> FlowResult<Request> {
        match &self.seed {
            StaticOr::Static(request) => Ok(request.clone()),
            StaticOr::Dynamic(f) => f(context),
        }
    }

    fn next(
        &self,
        response: &Response,
        records: &[Value],
        context: &StreamContext,
    ) -> FlowResult<Continuation> {
        match &self.next {
            Some(f) => f(response, records, context),
            None => Ok(Continuation::Done),
        }
    }

    fn transform(&self, body: &str, context: &StreamContext) -> FlowResult<Vec<Value>> {
        match &self.transform {
            Some(f) => f(body, context),
            None => default_transform(body),
        }
    }
}

pub struct StreamBuilder {
    name: String,
    parent: Option<String>,
    seed: Option<StaticOr<Request, SeedFn>>,
    next: Option<Arc<NextFn>>,
    transform: Option<Arc<TransformFn>>,
}

impl StreamBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            seed: None,
            next: None,
            transform: None,
        }
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Fixed first request.
    pub fn seed_request(mut self, request: impl Into<Request>) -> Self {
        self.seed = Some(StaticOr::Static(request.into()));
        self
    }

    /// First request derived from the parent record.
    pub fn seed<F>(mut self, f: F) -> Self
    where
        F: Fn(&StreamContext) -> FlowResult<Request> + Send + Sync + 'static,
    {
        self.seed = Some(StaticOr::Dynamic(Arc::new(f)));
        self
    }

    pub fn next<F>(mut self, f: F) -> Self
    where
        F: Fn(&Response, &[Value], &StreamContext) -> FlowResult<Continuation>
            + Send
            + Sync
            + 'static,
    {
        self.next = Some(Arc::new(f));
        self
    }

    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &StreamContext) -> FlowResult<Vec<Value>> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<FnStream, BuildError> {
        let seed = self.seed.ok_or_else(|| BuildError::NoSeed(self.name.clone()))?;
        Ok(FnStream {
            name: self.name,
            parent: self.parent,
            seed,
            next: self.next,
            transform: self.transform,
        })
    }
}

pub struct FnSource {
    name: String,
    streams: Vec<Arc<dyn Stream>>,
    headers: StaticOr<BTreeMap<String, String>, HeadersFn>,
    spacing: Option<Arc<dyn RequestSpacing>>,
}

impl Source for FnSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn streams(&self) -> Vec<Arc<dyn Stream>> {
        self.streams.clone()
    }

    fn headers(&self, context: &SourceContext) -> FlowResult<BTreeMap<String, String>> {
        match &self.headers {
            StaticOr::Static(headers) => Ok(headers.clone()),
            StaticOr::Dynamic(f) => f(context),
        }
    }

    fn request_spacing(&self, response: &Response) -> Duration {
        match &self.spacing {
            Some(policy) => policy.spacing(response),
            None => DEFAULT_REQUEST_SPACING,
        }
    }
}

pub struct SourceBuilder {
    name: String,
    streams: Vec<Arc<dyn Stream>>,
    headers: StaticOr<BTreeMap<String, String>, HeadersFn>,
    spacing: Option<Arc<dyn RequestSpacing>>,
}

impl SourceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            streams: Vec::new(),
            headers: StaticOr::Static(BTreeMap::new()),
            spacing: None,
        }
    }

    pub fn stream(mut self, stream: impl Stream + 'static) -> Self {
        self.streams.push(Arc::new(stream));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self.headers {
            StaticOr::Static(headers) => {
                headers.insert(name.into(), value.into());
            }
            StaticOr::Dynamic(_) => {
                let mut headers = BTreeMap::new();
                headers.insert(name.into(), value.into());
                self.headers = StaticOr::Static(headers);
            }
        }
        self
    }

    /// Headers computed from the resolved credentials; replaces static headers.
    pub fn headers<F>(mut self, f: F) -> Self
    where
        F: Fn(&SourceContext) -> FlowResult<BTreeMap<String, String>> + Send + Sync + 'static,
    {
        self.headers = StaticOr::Dynamic(Arc::new(f));
        self
    }

    pub fn request_spacing(mut self, policy: impl RequestSpacing + 'static) -> Self {
        self.spacing = Some(Arc::new(policy));
        self
    }

    pub fn build(self) -> Result<FnSource, BuildError> {
        if self.streams.is_empty() {
            return Err(BuildError::NoStreams(self.name));
        }
        let nodes = self
            .streams
            .iter()
            .map(|s| StreamNode::of(s.as_ref()))
            .collect();
        resolver::resolve(nodes)?;

        Ok(FnSource {
            name: self.name,
            streams: self.streams,
            headers: self.headers,
            spacing: self.spacing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::rate_limit::FixedSpacing;
    use crate::sources::traits::required_str;
    use serde_json::json;

    fn repositories() -> FnStream {
        StreamBuilder::new("repositories")
            .seed_request("https://api.example.com/repos?page=1")
            .next(|response, records, _| {
                if records.is_empty() {
                    return Ok(Continuation::Done);
                }
                Ok(crate::sources::link_header::next_page_url(response)?
                    .map(Request::get)
                    .into())
            })
            .build()
            .unwrap()
    }

    fn issues() -> FnStream {
        StreamBuilder::new("issues")
            .parent("repositories")
            .seed(|ctx| {
                let parent = ctx
                    .parent
                    .as_ref()
                    .ok_or_else(|| Error::InvalidInput("issues needs a repository".into()))?;
                let repo = required_str(parent, "full_name")?;
                Ok(Request::get(format!("https://api.example.com/repos/{repo}/issues")))
            })
            .build()
            .unwrap()
    }

    #[test]
    fn static_and_dynamic_seeds() {
        let root = repositories();
        assert_eq!(
            root.seed(&StreamContext::root()).unwrap().url,
            "https://api.example.com/repos?page=1"
        );

        let child = issues();
        let ctx = StreamContext::child_of(json!({"full_name": "acme/widgets"}));
        assert_eq!(
            child.seed(&ctx).unwrap().url,
            "https://api.example.com/repos/acme/widgets/issues"
        );
        assert!(child.seed(&StreamContext::root()).is_err());
    }

    #[test]
    fn next_follows_link_header() {
        let stream = repositories();
        let ctx = StreamContext::root();
        let response = Response::new("u", 200, "[]")
            .with_header("link", r#"<https://api.example.com/repos?page=2>; rel="next""#);
        let records = vec![json!({"id": 1})];
        assert_eq!(
            stream.next(&response, &records, &ctx).unwrap(),
            Continuation::Next(Request::get("https://api.example.com/repos?page=2"))
        );
        assert_eq!(stream.next(&response, &[], &ctx).unwrap(), Continuation::Done);
    }

    #[test]
    fn custom_transform_is_used() {
        let stream = StreamBuilder::new("items")
            .seed_request("https://x")
            .transform(|body, _| {
                let value: Value = serde_json::from_str(body)?;
                Ok(value["data"].as_array().cloned().unwrap_or_default())
            })
            .build()
            .unwrap();
        let records = stream
            .transform(r#"{"data":[{"id":1},{"id":2}]}"#, &StreamContext::root())
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn stream_requires_seed() {
        let result = StreamBuilder::new("orphan").build();
        assert!(matches!(result, Err(BuildError::NoSeed(ref n)) if n == "orphan"));
    }

    #[test]
    fn source_headers_static_or_from_credentials() {
        let fixed = SourceBuilder::new("fixed")
            .stream(repositories())
            .header("Accept", "application/json")
            .build()
            .unwrap();
        let headers = fixed.headers(&SourceContext::default()).unwrap();
        assert_eq!(headers["Accept"], "application/json");

        let dynamic = SourceBuilder::new("github")
            .stream(repositories())
            .headers(|ctx| {
                let token = required_str(&ctx.credentials, "token")?;
                Ok(BTreeMap::from([(
                    "Authorization".to_string(),
                    format!("Bearer {token}"),
                )]))
            })
            .build()
            .unwrap();
        let ctx = SourceContext {
            credentials: json!({"token": "abc"}),
        };
        assert_eq!(dynamic.headers(&ctx).unwrap()["Authorization"], "Bearer abc");
    }

    #[test]
    fn source_spacing_defaults_and_overrides() {
        let default = SourceBuilder::new("a").stream(repositories()).build().unwrap();
        let response = Response::new("u", 200, "");
        assert_eq!(default.request_spacing(&response), DEFAULT_REQUEST_SPACING);

        let fixed = SourceBuilder::new("b")
            .stream(repositories())
            .request_spacing(FixedSpacing::new(Duration::from_millis(20)))
            .build()
            .unwrap();
        assert_eq!(fixed.request_spacing(&response), Duration::from_millis(20));
    }

    #[test]
    fn source_validates_stream_forest() {
        let result = SourceBuilder::new("broken").stream(issues()).build();
        assert!(matches!(result, Err(BuildError::Streams(Error::InvalidStreams(_)))));

        let empty = SourceBuilder::new("empty").build();
        assert!(matches!(empty, Err(BuildError::NoStreams(_))));

        let ok = SourceBuilder::new("github")
            .stream(repositories())
            .stream(issues())
            .build()
            .unwrap();
        let names: Vec<String> = ok.streams().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["repositories", "issues"]);
    }
}
