use async_trait::async_trait;
use relayflow_utils::{Batch, FlowResult};
use serde_json::Value;

/// Identity and options of the job a destination is writing for.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub job_id: String,
    pub source_options: Value,
    pub destination_options: Value,
}

/// A sink for batches of records produced by a job.
///
/// `open` runs once before the first write and `close` once after the
/// traversal, whether it succeeded or not.
#[async_trait]
pub trait Destination: Send {
    fn name(&self) -> &str;

    async fn open(&mut self, _context: &JobContext) -> FlowResult<()> {
        Ok(())
    }

    async fn write(&mut self, batch: &Batch, context: &JobContext) -> FlowResult<()>;

    async fn close(&mut self, _context: &JobContext) -> FlowResult<()> {
        Ok(())
    }
}
