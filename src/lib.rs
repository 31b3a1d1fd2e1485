pub use relayflow_core as core;
pub use relayflow_utils as utils;

// Convenience re-exports for common usage
pub use relayflow_core::builder::{SourceBuilder, StreamBuilder};
pub use relayflow_core::destinations::traits::{Destination, JobContext};
pub use relayflow_core::engine::{Engine, FlowHandle, RelayFlow};
pub use relayflow_core::registry::ConnectorRegistry;
pub use relayflow_core::sources::traits::{Continuation, Request, Response, Source, Stream};
pub use relayflow_utils::{Batch, FlowResult};
