//! relayflow_core: cron-scheduled source to destination syncs
//!
//! Sources describe paginated HTTP streams (optionally nested under a parent
//! stream), destinations receive the normalized batches, and a connection
//! ties the two to a cron schedule. The engine runs one durable execution per
//! connection at a time, guarded by a run token in the store.
//!
//! Basic usage:
//!
//! ```no_run
//! use relayflow_core::builder::{SourceBuilder, StreamBuilder};
//! use relayflow_core::engine::RelayFlow;
//! use relayflow_core::sources::traits::{Continuation, Source};
//!
//! # async fn demo() -> relayflow_utils::FlowResult<()> {
//! let mut flow = RelayFlow::new().db_path("relayflow.db");
//! flow.registry_mut().register_source("example", |_options| {
//!     let stream = StreamBuilder::new("items")
//!         .seed_request("https://example.com/items")
//!         .next(|_, _, _| Ok(Continuation::Done))
//!         .build()?;
//!     let source = SourceBuilder::new("example").stream(stream).build()?;
//!     Ok(Box::new(source) as Box<dyn Source>)
//! });
//! flow.run().await
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod credentials;
pub mod dag;
pub mod destinations;
pub mod engine;
pub mod events;
pub mod job;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod sources;
pub mod store;

pub use engine::{Engine, FlowHandle, RelayFlow};
