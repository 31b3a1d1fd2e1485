pub mod bus;
pub mod trigger;

pub use bus::{BusLauncher, EventBus};
pub use trigger::{StartExecution, StartReason};
