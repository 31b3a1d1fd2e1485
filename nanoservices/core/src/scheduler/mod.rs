pub mod clock;
pub mod runner;
pub mod state;

pub use clock::{Clock, SystemClock};
pub use runner::{ExecutionLauncher, JobRunner, LocalJobRunner, Orchestrator};
pub use state::{Action, ExecutionInput};
