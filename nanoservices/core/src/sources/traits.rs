use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use relayflow_utils::error::Error;
use relayflow_utils::FlowResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Spacing used when a source does not supply its own policy.
pub const DEFAULT_REQUEST_SPACING: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
}

/// A wire-level HTTP call descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Post,
            headers: BTreeMap::new(),
            body: Some(body.into()),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl From<&str> for Request {
    fn from(url: &str) -> Self {
        Request::get(url)
    }
}

impl From<String> for Request {
    fn from(url: String) -> Self {
        Request::get(url)
    }
}

/// A response header may arrive once or several times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderValues {
    pub fn first(&self) -> Option<&str> {
        match self {
            HeaderValues::Single(s) => Some(s.as_str()),
            HeaderValues::Multiple(v) => v.first().map(String::as_str),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: Vec<&str> = match self {
            HeaderValues::Single(s) => vec![s.as_str()],
            HeaderValues::Multiple(v) => v.iter().map(String::as_str).collect(),
        };
        values.into_iter()
    }

    fn push(&mut self, value: String) {
        match self {
            HeaderValues::Single(existing) => {
                let first = std::mem::take(existing);
                *self = HeaderValues::Multiple(vec![first, value]);
            }
            HeaderValues::Multiple(v) => v.push(value),
        }
    }
}

/// A wire-level HTTP result, handed to continuation and rate-limit logic.
///
/// Header names are stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, HeaderValues>,
    pub body: String,
}

impl Response {
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Append a header value; repeated names become multi-valued.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.append_header(name, value);
        self
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.get_mut(&name.to_ascii_lowercase()) {
            Some(existing) => existing.push(value),
            None => {
                self.headers
                    .insert(name.to_ascii_lowercase(), HeaderValues::Single(value));
            }
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValues> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    /// First value of a header parsed as an integer.
    pub fn numeric_header(&self, name: &str) -> Option<i64> {
        self.header(name)?.first()?.trim().parse().ok()
    }
}

/// Per-invocation context for a stream: the parent record that seeded it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamContext {
    pub parent: Option<Value>,
}

impl StreamContext {
    pub fn root() -> Self {
        Self { parent: None }
    }

    pub fn child_of(record: Value) -> Self {
        Self {
            parent: Some(record),
        }
    }

    /// Look up a string field on the parent record.
    pub fn parent_str(&self, field: &str) -> Option<&str> {
        self.parent.as_ref()?.get(field)?.as_str()
    }
}

/// Context passed to source-level hooks; carries resolved credentials.
#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    pub credentials: Value,
}

/// What to fetch after a successful page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    Done,
    Next(Request),
}

impl From<Option<Request>> for Continuation {
    fn from(next: Option<Request>) -> Self {
        match next {
            Some(req) => Continuation::Next(req),
            None => Continuation::Done,
        }
    }
}

/// One paginated resource of a source, optionally nested under a parent.
pub trait Stream: Send + Sync {
    fn name(&self) -> &str;

    /// Name of the parent stream whose records seed this one.
    fn parent(&self) -> Option<&str> {
        None
    }

    /// Build the first request for this stream.
    fn seed(&self, context: &StreamContext) -> FlowResult<Request>;

    /// Decide the next request from the last page; the default stops after
    /// one page.
    fn next(
        &self,
        _response: &Response,
        _records: &[Value],
        _context: &StreamContext,
    ) -> FlowResult<Continuation> {
        Ok(Continuation::Done)
    }

    /// Turn a raw body into records.
    fn transform(&self, body: &str, _context: &StreamContext) -> FlowResult<Vec<Value>> {
        default_transform(body)
    }
}

/// A named bundle of streams with its header and rate-limit policies.
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    fn streams(&self) -> Vec<Arc<dyn Stream>>;

    /// Headers applied to every request; a request's own headers win.
    fn headers(&self, _context: &SourceContext) -> FlowResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    /// Delay to observe before the next request, given the latest response.
    fn request_spacing(&self, _response: &Response) -> Duration {
        DEFAULT_REQUEST_SPACING
    }
}

/// Parse a JSON body; arrays yield their elements, anything else one record.
pub fn default_transform(body: &str) -> FlowResult<Vec<Value>> {
    match serde_json::from_str(body)? {
        Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}

/// Fetch a required string field from a JSON object, for use in seeds.
pub fn required_str<'a>(value: &'a Value, field: &str) -> FlowResult<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidInput(format!("missing string field '{field}'")))
}
