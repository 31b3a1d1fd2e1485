pub mod error;

use chrono::{DateTime, Utc};
use error::Error;
use serde_json::Value;
use std::sync::Arc;

pub type FlowResult<T> = Result<T, Error>;

/// One page of normalized records pulled from a stream.
///
/// Records are shared behind an `Arc` so a batch can be handed to a
/// destination and still be inspected by the continuation logic.
#[derive(Clone, Debug)]
pub struct Batch {
    pub source: String,
    pub stream: String,
    pub records: Arc<Vec<Value>>,
    pub retrieved_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(
        source: impl Into<String>,
        stream: impl Into<String>,
        records: Vec<Value>,
        retrieved_at: DateTime<Utc>,
    ) -> Self {
        Batch {
            source: source.into(),
            stream: stream.into(),
            records: Arc::new(records),
            retrieved_at,
        }
    }

    pub fn records(&self) -> &[Value] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
