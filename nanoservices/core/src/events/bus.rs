use async_trait::async_trait;
use relayflow_utils::FlowResult;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::trigger::{StartExecution, StartReason};
use crate::scheduler::runner::ExecutionLauncher;
use crate::scheduler::state::{Action, ExecutionInput};
use crate::store::SharedStore;

/// Channel delivering start requests to the engine.
pub struct EventBus {
    sender: mpsc::Sender<StartExecution>,
    receiver: mpsc::Receiver<StartExecution>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self { sender, receiver }
    }

    pub fn sender(&self) -> mpsc::Sender<StartExecution> {
        self.sender.clone()
    }

    /// Receive the next start request. Returns None when all senders are dropped.
    pub async fn recv(&mut self) -> Option<StartExecution> {
        self.receiver.recv().await
    }
}

/// Launches executions by recording them in the store and then posting to
/// the engine's bus. Lets an execution start its successor without holding a
/// reference to the engine.
#[derive(Clone)]
pub struct BusLauncher {
    store: SharedStore,
    sender: mpsc::Sender<StartExecution>,
}

impl BusLauncher {
    pub fn new(store: SharedStore, sender: mpsc::Sender<StartExecution>) -> Self {
        Self { store, sender }
    }

    /// The execution is durable once this returns; if no engine is listening
    /// it is picked up by the next engine's resume.
    pub async fn send(&self, input: ExecutionInput, reason: StartReason) -> FlowResult<String> {
        let execution_id = Uuid::new_v4().to_string();
        let envelope = Action::BeforeSync.to_envelope()?;
        self.store.lock().await.start_execution(
            &execution_id,
            &input.connection_id,
            input.restart_count,
            &envelope,
        )?;

        let event = StartExecution {
            execution_id: execution_id.clone(),
            input,
            reason,
        };
        if self.sender.send(event).await.is_err() {
            tracing::warn!(execution = %execution_id, "engine not listening, execution left for resume");
        }
        Ok(execution_id)
    }
}

#[async_trait]
impl ExecutionLauncher for BusLauncher {
    async fn start(&self, input: ExecutionInput) -> FlowResult<String> {
        self.send(input, StartReason::Loop).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::models::NewConnection;
    use crate::store::{ExecutionStatus, Store};

    fn input(id: &str, restart_count: u32) -> ExecutionInput {
        ExecutionInput {
            connection_id: id.to_string(),
            restart_count,
        }
    }

    fn store_with(ids: &[&str]) -> SharedStore {
        let store = Store::in_memory().unwrap();
        for id in ids {
            store
                .create_connection(NewConnection {
                    id: Some(id.to_string()),
                    source_id: "src".into(),
                    destination_id: "dst".into(),
                    schedule: "* * * * *".into(),
                })
                .unwrap();
        }
        store.shared()
    }

    #[tokio::test]
    async fn launcher_mints_ids_and_delivers_in_order() {
        let mut bus = EventBus::new(16);
        let launcher = BusLauncher::new(store_with(&["c1", "c2"]), bus.sender());

        let first = launcher.start(input("c1", 1)).await.unwrap();
        let second = launcher.send(input("c2", 0), StartReason::RunNow).await.unwrap();
        assert_ne!(first, second);

        let e1 = bus.recv().await.unwrap();
        assert_eq!(e1.execution_id, first);
        assert_eq!(e1.input, input("c1", 1));
        assert_eq!(e1.reason, StartReason::Loop);

        let e2 = bus.recv().await.unwrap();
        assert_eq!(e2.input.connection_id, "c2");
        assert_eq!(e2.reason, StartReason::RunNow);
    }

    #[tokio::test]
    async fn execution_is_recorded_before_delivery() {
        let store = store_with(&["c1"]);
        let bus = EventBus::new(1);
        let launcher = BusLauncher::new(Arc::clone(&store), bus.sender());
        drop(bus);

        let id = launcher.start(input("c1", 3)).await.unwrap();
        let guard = store.lock().await;
        let pending = guard.pending_executions().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].restart_count, 3);
        assert_eq!(pending[0].status, ExecutionStatus::Running);
        assert_eq!(pending[0].action["action"], "BEFORE_SYNC");
        let conn = guard.get_connection("c1").unwrap().unwrap();
        assert_eq!(conn.execution_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn unknown_connection_is_not_launched() {
        let store = store_with(&[]);
        let bus = EventBus::new(1);
        let launcher = BusLauncher::new(Arc::clone(&store), bus.sender());
        let err = launcher.start(input("ghost", 0)).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.lock().await.pending_executions().unwrap().is_empty());
    }
}
