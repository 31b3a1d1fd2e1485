use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;

use relayflow_utils::error::Error;
use relayflow_utils::FlowResult;
use tokio::task::JoinSet;

use crate::config::types::FlowConfig;
use crate::events::bus::{BusLauncher, EventBus};
use crate::events::trigger::{StartExecution, StartReason};
use crate::logging;
use crate::metrics;
use crate::registry::ConnectorRegistry;
use crate::scheduler::clock::{Clock, SystemClock};
use crate::scheduler::runner::{JobRunner, LocalJobRunner, Orchestrator};
use crate::scheduler::state::{Action, ExecutionInput};
use crate::sources::http_client::{HttpClient, HttpFetcher};
use crate::sources::rate_limit::{Pacer, TokioPacer};
use crate::store::models::{Connection, Execution, ExecutionStatus, NewConnection};
use crate::store::{SharedStore, Store};

/// Top-level runtime. Register connectors, then `build()` and run.
pub struct RelayFlow {
    config: FlowConfig,
    registry: ConnectorRegistry,
    http: Option<Arc<dyn HttpClient>>,
    pacer: Arc<dyn Pacer>,
    clock: Arc<dyn Clock>,
    jobs: Option<Arc<dyn JobRunner>>,
}

impl Default for RelayFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayFlow {
    pub fn new() -> Self {
        Self {
            config: FlowConfig::default(),
            registry: ConnectorRegistry::new(),
            http: None,
            pacer: Arc::new(TokioPacer),
            clock: Arc::new(SystemClock),
            jobs: None,
        }
    }

    pub fn config(mut self, config: FlowConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the path for the SQLite database. Defaults to in-memory.
    pub fn db_path(mut self, path: impl Into<String>) -> Self {
        self.config.database = Some(path.into());
        self
    }

    pub fn registry(mut self, registry: ConnectorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry_mut(&mut self) -> &mut ConnectorRegistry {
        &mut self.registry
    }

    pub fn http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the in-process job runner.
    pub fn job_runner(mut self, jobs: Arc<dyn JobRunner>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Open the store and wire the runtime together.
    pub fn build(self) -> FlowResult<Engine> {
        self.warn_unregistered();
        let store = match &self.config.database {
            Some(path) => Store::open(path)?,
            None => Store::in_memory()?,
        }
        .shared();

        let jobs: Arc<dyn JobRunner> = match self.jobs {
            Some(jobs) => jobs,
            None => {
                let http: Arc<dyn HttpClient> = match self.http {
                    Some(http) => http,
                    None => {
                        let mut builder = HttpFetcher::builder().timeout(self.config.job.http_timeout());
                        if let Some(agent) = &self.config.job.user_agent {
                            builder = builder.user_agent(agent.clone());
                        }
                        Arc::new(builder.build()?)
                    }
                };
                Arc::new(
                    LocalJobRunner::new(
                        Arc::new(self.registry),
                        http,
                        self.pacer,
                        self.config.job.timeout(),
                    )
                    .with_max_retries(self.config.job.max_retries),
                )
            }
        };

        let bus = EventBus::new(256);
        let launcher = BusLauncher::new(Arc::clone(&store), bus.sender());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            jobs,
            Arc::new(launcher.clone()),
            self.clock,
        ));

        Ok(Engine {
            config: self.config,
            store,
            launcher,
            bus,
            orchestrator,
        })
    }

    /// Seeded connectors whose provider has no factory fail every job that
    /// uses them; say so at startup.
    fn warn_unregistered(&self) {
        for source in &self.config.sources {
            if !self.registry.has_source(&source.provider) {
                tracing::warn!(
                    source = %source.id,
                    provider = %source.provider,
                    registered = ?self.registry.source_names(),
                    "no factory registered for source provider"
                );
            }
        }
        for destination in &self.config.destinations {
            if !self.registry.has_destination(&destination.provider) {
                tracing::warn!(
                    destination = %destination.id,
                    provider = %destination.provider,
                    "no factory registered for destination provider"
                );
            }
        }
    }

    /// Build and run until Ctrl-C.
    pub async fn run(self) -> FlowResult<()> {
        self.build()?.run().await
    }

    /// Build and run until `shutdown` resolves.
    pub async fn run_with_shutdown<F: std::future::Future>(self, shutdown: F) -> FlowResult<()> {
        self.build()?.run_with_shutdown(shutdown).await
    }
}

/// Cloneable entry point for the outside world: create connections and
/// request runs while the engine is running.
#[derive(Clone)]
pub struct FlowHandle {
    store: SharedStore,
    launcher: BusLauncher,
}

impl FlowHandle {
    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    /// Create a connection and start its first execution.
    pub async fn create_connection(&self, new: NewConnection) -> FlowResult<(Connection, String)> {
        let connection = self.store.lock().await.create_connection(new)?;
        let execution_id = self.start(&connection.id, StartReason::Created).await?;
        Ok((connection, execution_id))
    }

    /// Start an execution now. If a run is already in flight the new
    /// execution terminates at its reservation step.
    pub async fn run_now(&self, connection_id: &str) -> FlowResult<String> {
        if self.store.lock().await.get_connection(connection_id)?.is_none() {
            return Err(Error::NotFound(format!("connection {connection_id}")));
        }
        self.start(connection_id, StartReason::RunNow).await
    }

    async fn start(&self, connection_id: &str, reason: StartReason) -> FlowResult<String> {
        let input = ExecutionInput {
            connection_id: connection_id.to_string(),
            restart_count: 0,
        };
        self.launcher.send(input, reason).await
    }
}

pub struct Engine {
    config: FlowConfig,
    store: SharedStore,
    launcher: BusLauncher,
    bus: EventBus,
    orchestrator: Arc<Orchestrator>,
}

impl Engine {
    pub fn handle(&self) -> FlowHandle {
        FlowHandle {
            store: Arc::clone(&self.store),
            launcher: self.launcher.clone(),
        }
    }

    pub async fn run(self) -> FlowResult<()> {
        let shutdown = tokio::signal::ctrl_c();
        self.run_with_shutdown(async {
            let _ = shutdown.await;
        })
        .await
    }

    /// Apply seeds, resume unfinished executions, then serve start requests
    /// until `shutdown` resolves. Executions still running at shutdown stay
    /// `running` in the store and are resumed by the next engine.
    pub async fn run_with_shutdown<F: std::future::Future>(mut self, shutdown: F) -> FlowResult<()> {
        logging::init_with(&self.config.log_level);
        let handle = self.handle();

        let exporter = match &self.config.metrics_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr)?;
                tracing::info!(%addr, "serving metrics");
                Some(metrics::start_exporter(listener)?)
            }
            None => None,
        };

        let mut executions = Executions::default();
        self.resume_pending(&mut executions).await?;
        let created = self.apply_seeds().await?;
        for id in created {
            handle.start(&id, StartReason::Created).await?;
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                Some(event) = self.bus.recv() => {
                    if let Err(e) = self.accept(event, &mut executions).await {
                        tracing::error!(error = %e, "could not start execution");
                    }
                }
                Some(joined) = executions.tasks.join_next(), if !executions.tasks.is_empty() => {
                    match joined {
                        Ok(id) => {
                            executions.live.remove(&id);
                        }
                        Err(e) => tracing::error!(error = %e, "execution task panicked"),
                    }
                }
            }
        }

        executions.tasks.shutdown().await;
        if let Some((task, stop)) = exporter {
            let _ = stop.send(());
            let _ = task.await;
        }
        tracing::info!("relayflow shutdown complete");
        Ok(())
    }

    /// Spawn an execution the launcher already recorded. Events for
    /// executions already running here or already finished are ignored.
    async fn accept(&self, event: StartExecution, executions: &mut Executions) -> FlowResult<()> {
        if executions.live.contains(&event.execution_id) {
            return Ok(());
        }
        let execution = self
            .store
            .lock()
            .await
            .get_execution(&event.execution_id)?
            .ok_or_else(|| Error::NotFound(format!("execution {}", event.execution_id)))?;
        if execution.status != ExecutionStatus::Running {
            tracing::debug!(execution = %execution.id, "execution already finished");
            return Ok(());
        }
        tracing::info!(
            execution = %execution.id,
            connection = %execution.connection_id,
            reason = ?event.reason,
            "starting execution"
        );
        self.launch(execution, executions).await
    }

    async fn resume_pending(&self, executions: &mut Executions) -> FlowResult<()> {
        let pending = self.store.lock().await.pending_executions()?;
        for execution in pending {
            tracing::info!(
                execution = %execution.id,
                connection = %execution.connection_id,
                "resuming execution"
            );
            self.launch(execution, executions).await?;
        }
        Ok(())
    }

    /// Continue `execution` from its persisted envelope. An envelope that
    /// cannot be decoded fails the execution.
    async fn launch(&self, execution: Execution, executions: &mut Executions) -> FlowResult<()> {
        let action = match Action::from_envelope(&execution.action) {
            Ok(action) => action,
            Err(e) => {
                tracing::error!(execution = %execution.id, error = %e, "cannot continue execution");
                return self
                    .store
                    .lock()
                    .await
                    .fail_execution(&execution.id, &e.to_string());
            }
        };
        let input = ExecutionInput {
            connection_id: execution.connection_id,
            restart_count: execution.restart_count,
        };
        let orchestrator = Arc::clone(&self.orchestrator);
        let id = execution.id;
        executions.live.insert(id.clone());
        executions.tasks.spawn(async move {
            // Failures are recorded on the execution by the orchestrator.
            let _ = orchestrator.execute(&id, input, action).await;
            id
        });
        Ok(())
    }

    /// Create configured records that do not exist yet; returns the ids of
    /// connections created.
    async fn apply_seeds(&self) -> FlowResult<Vec<String>> {
        let store = self.store.lock().await;
        for source in &self.config.sources {
            if store.get_source(&source.id)?.is_none() {
                store.create_source(source.to_new())?;
                tracing::info!(source = %source.id, "seeded source");
            }
        }
        for destination in &self.config.destinations {
            if store.get_destination(&destination.id)?.is_none() {
                store.create_destination(destination.to_new())?;
                tracing::info!(destination = %destination.id, "seeded destination");
            }
        }
        let mut created = Vec::new();
        for connection in &self.config.connections {
            if store.get_connection(&connection.id)?.is_none() {
                store.create_connection(connection.to_new())?;
                tracing::info!(connection = %connection.id, "seeded connection");
                created.push(connection.id.clone());
            }
        }
        Ok(created)
    }
}

/// Execution tasks running in this engine, keyed by execution id.
#[derive(Default)]
struct Executions {
    tasks: JoinSet<String>,
    live: HashSet<String>,
}
