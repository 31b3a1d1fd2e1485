pub mod db;
pub mod models;

pub use db::{SharedStore, Store};
pub use models::{
    Connection, ConnectorRecord, Execution, ExecutionStatus, NewConnection, NewConnector,
};
