use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayflow_utils::error::Error;
use relayflow_utils::FlowResult;
use uuid::Uuid;

use crate::job::{ConnectorArgs, Job, JobArgs, JobReport, DEFAULT_MAX_RETRIES};
use crate::metrics;
use crate::registry::ConnectorRegistry;
use crate::scheduler::clock::Clock;
use crate::scheduler::state::{self, Action, ExecutionInput};
use crate::sources::http_client::HttpClient;
use crate::sources::rate_limit::Pacer;
use crate::store::models::ConnectorRecord;
use crate::store::SharedStore;

/// Runs one job somewhere with its own time limit.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, args: JobArgs) -> FlowResult<JobReport>;
}

/// Records and starts a new orchestration execution, returning its id. The
/// execution must be durable by the time this returns.
#[async_trait]
pub trait ExecutionLauncher: Send + Sync {
    async fn start(&self, input: ExecutionInput) -> FlowResult<String>;
}

/// Runs jobs in-process under a timeout.
pub struct LocalJobRunner {
    registry: Arc<ConnectorRegistry>,
    http: Arc<dyn HttpClient>,
    pacer: Arc<dyn Pacer>,
    timeout: Duration,
    max_retries: u32,
}

impl LocalJobRunner {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        http: Arc<dyn HttpClient>,
        pacer: Arc<dyn Pacer>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            http,
            pacer,
            timeout,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[async_trait]
impl JobRunner for LocalJobRunner {
    async fn run(&self, args: JobArgs) -> FlowResult<JobReport> {
        let job = async {
            Job::build(
                &self.registry,
                args,
                Arc::clone(&self.http),
                Arc::clone(&self.pacer),
            )
            .await?
            .with_max_retries(self.max_retries)
            .run()
            .await
        };
        tokio::time::timeout(self.timeout, job)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }
}

/// Drives one connection's control loop: reserve, run, release, sleep, and
/// either hand over to a fresh execution or stop.
pub struct Orchestrator {
    store: SharedStore,
    jobs: Arc<dyn JobRunner>,
    launcher: Arc<dyn ExecutionLauncher>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        store: SharedStore,
        jobs: Arc<dyn JobRunner>,
        launcher: Arc<dyn ExecutionLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            jobs,
            launcher,
            clock,
        }
    }

    /// Run an execution from `action` until it ends, persisting every
    /// envelope before acting on it and recording the outcome.
    #[tracing::instrument(skip(self, input, action), fields(connection = %input.connection_id, restart = input.restart_count))]
    pub async fn execute(&self, execution_id: &str, input: ExecutionInput, action: Action) -> FlowResult<()> {
        metrics::execution_started();
        let result = self.drive(execution_id, &input, action).await;
        metrics::execution_finished();

        let store = self.store.lock().await;
        match &result {
            Ok(()) => {
                store.complete_execution(execution_id)?;
                tracing::info!("execution finished");
            }
            Err(e) => {
                store.fail_execution(execution_id, &e.to_string())?;
                tracing::error!(error = %e, "execution failed");
            }
        }
        result
    }

    async fn drive(&self, execution_id: &str, input: &ExecutionInput, mut action: Action) -> FlowResult<()> {
        loop {
            self.store
                .lock()
                .await
                .save_action(execution_id, &action.to_envelope()?)?;
            metrics::inc_transition(action.name());
            tracing::debug!(action = action.name(), "transition");

            match self.step(input, action).await? {
                Some(next) => action = next,
                None => return Ok(()),
            }
        }
    }

    /// Act on one envelope and return the next, or `None` once the
    /// execution is over.
    pub async fn step(&self, input: &ExecutionInput, action: Action) -> FlowResult<Option<Action>> {
        let next = match action {
            Action::BeforeSync => self.before_sync(input).await?,
            Action::Run { token, job } => self.run(input, &token, job).await?,
            Action::AfterSync => self.after_sync(input).await?,
            Action::Wait { until } => self.wait(until).await,
            Action::AfterSleep => self.after_sleep(input).await?,
            Action::Loop => {
                self.relaunch(input).await?;
                return Ok(None);
            }
            Action::Terminate => return Ok(None),
        };
        Ok(Some(next))
    }

    async fn before_sync(&self, input: &ExecutionInput) -> FlowResult<Action> {
        let id = &input.connection_id;
        let store = self.store.lock().await;
        let Some(token) = store.reserve(id)? else {
            tracing::info!(connection = %id, "run already in flight, terminating");
            return Ok(Action::Terminate);
        };

        let loaded = (|| {
            let connection = store
                .get_connection(id)?
                .ok_or_else(|| Error::Integrity(format!("connection {id} vanished after reservation")))?;
            let source = store.get_source(&connection.source_id)?.ok_or_else(|| {
                Error::Integrity(format!("connection {id} references missing source {}", connection.source_id))
            })?;
            let destination = store.get_destination(&connection.destination_id)?.ok_or_else(|| {
                Error::Integrity(format!(
                    "connection {id} references missing destination {}",
                    connection.destination_id
                ))
            })?;
            Ok::<_, Error>((source, destination))
        })();

        let (source, destination) = match loaded {
            Ok(pair) => pair,
            Err(e) => {
                if let Err(abort) = store.abort(id) {
                    tracing::warn!(connection = %id, error = %abort, "could not release token");
                }
                return Err(e);
            }
        };

        let job = JobArgs {
            job_id: Uuid::new_v4().to_string(),
            connection_id: id.clone(),
            source: connector_args(source),
            destination: connector_args(destination),
        };
        tracing::info!(connection = %id, job = %job.job_id, "reserved run token");
        Ok(Action::Run { token, job })
    }

    async fn run(&self, input: &ExecutionInput, token: &str, job: JobArgs) -> FlowResult<Action> {
        let job_id = job.job_id.clone();
        match self.jobs.run(job).await {
            Ok(report) => {
                tracing::info!(job = %job_id, records = report.records, "job completed");
                Ok(Action::AfterSync)
            }
            Err(e) => {
                // Release without stamping so the next trigger can reserve again.
                if let Err(abort) = self.store.lock().await.abort(&input.connection_id) {
                    tracing::warn!(token, error = %abort, "could not release token after failed job");
                }
                Err(e)
            }
        }
    }

    async fn after_sync(&self, input: &ExecutionInput) -> FlowResult<Action> {
        let now = self.clock.now();
        let store = self.store.lock().await;
        match store.finish_at(&input.connection_id, now) {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                tracing::warn!(connection = %input.connection_id, "token already released");
            }
            Err(e) if e.is_not_found() => {
                tracing::info!(connection = %input.connection_id, "connection deleted during run");
                return Ok(Action::Terminate);
            }
            Err(e) => return Err(e),
        }
        let Some(connection) = store.get_connection(&input.connection_id)? else {
            return Ok(Action::Terminate);
        };
        state::after_sync(&connection.schedule, now)
    }

    async fn wait(&self, until: DateTime<Utc>) -> Action {
        tracing::debug!(%until, "sleeping");
        self.clock.sleep_until(until).await;
        Action::AfterSleep
    }

    async fn after_sleep(&self, input: &ExecutionInput) -> FlowResult<Action> {
        let connection = self.store.lock().await.get_connection(&input.connection_id)?;
        let next = state::after_sleep(connection.as_ref(), self.clock.now())?;
        if next == Action::Terminate {
            tracing::info!(connection = %input.connection_id, "connection gone or busy, terminating");
        }
        Ok(next)
    }

    async fn relaunch(&self, input: &ExecutionInput) -> FlowResult<()> {
        let next = ExecutionInput {
            connection_id: input.connection_id.clone(),
            restart_count: input.restart_count + 1,
        };
        let execution_id = self.launcher.start(next).await?;
        tracing::info!(connection = %input.connection_id, execution = %execution_id, "handed over to new execution");
        Ok(())
    }
}

fn connector_args(record: ConnectorRecord) -> ConnectorArgs {
    ConnectorArgs {
        id: record.id,
        provider: record.provider,
        credentials: record.credentials,
        options: record.options,
    }
}
