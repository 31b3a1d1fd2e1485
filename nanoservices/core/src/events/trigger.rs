use crate::scheduler::state::ExecutionInput;

/// Why an execution is being started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartReason {
    /// A connection was just created.
    Created,
    /// Someone asked for an immediate run.
    RunNow,
    /// The previous execution handed over after its wait elapsed.
    Loop,
}

/// Request to start one orchestration execution, delivered to the engine.
#[derive(Debug, Clone)]
pub struct StartExecution {
    /// Minted by the sender so it can be recorded before the engine picks
    /// the event up.
    pub execution_id: String,
    pub input: ExecutionInput,
    pub reason: StartReason,
}
