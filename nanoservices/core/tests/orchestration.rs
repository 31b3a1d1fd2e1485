use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use relayflow_core::builder::{SourceBuilder, StreamBuilder};
use relayflow_core::config::types::{ConnectionConfig, ConnectorConfig, FlowConfig};
use relayflow_core::destinations::traits::{Destination, JobContext};
use relayflow_core::engine::{FlowHandle, RelayFlow};
use relayflow_core::registry::ConnectorRegistry;
use relayflow_core::scheduler::clock::Clock;
use relayflow_core::sources::http_client::HttpClient;
use relayflow_core::sources::traits::{Request, Response, Source, SourceContext};
use relayflow_core::store::models::{Execution, ExecutionStatus};
use relayflow_utils::error::Error;
use relayflow_utils::{Batch, FlowResult};
use serde_json::{json, Value};

/// Serves the same two-record page for every request.
#[derive(Default)]
struct FakeApi {
    hits: AtomicUsize,
    auth: Mutex<Vec<String>>,
}

#[async_trait]
impl HttpClient for FakeApi {
    async fn execute(&self, request: &Request) -> FlowResult<Response> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        if let Some(auth) = request.headers.get("Authorization") {
            self.auth.lock().unwrap().push(auth.clone());
        }
        Ok(Response::new(&request.url, 200, r#"[{"id":1},{"id":2}]"#))
    }
}

#[derive(Default)]
struct Sink {
    batches: Mutex<Vec<Batch>>,
}

struct SinkDestination(Arc<Sink>);

#[async_trait]
impl Destination for SinkDestination {
    fn name(&self) -> &str {
        "sink"
    }

    async fn write(&mut self, batch: &Batch, _context: &JobContext) -> FlowResult<()> {
        self.0.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

/// Jumps to each deadline after a short real pause so other tasks get to run.
struct FastClock {
    now: Mutex<DateTime<Utc>>,
}

#[async_trait]
impl Clock for FastClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut now = self.now.lock().unwrap();
        if deadline > *now {
            *now = deadline;
        }
    }
}

fn registry(sink: Arc<Sink>) -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    registry.register_source("fake", |_options: &Value| {
        let items = StreamBuilder::new("items")
            .seed_request("https://api.test/items")
            .build()?;
        let source = SourceBuilder::new("fake")
            .stream(items)
            .headers(|ctx: &SourceContext| {
                let token = ctx.credentials["token"].as_str().unwrap_or_default();
                Ok(BTreeMap::from([("Authorization".to_string(), format!("Bearer {token}"))]))
            })
            .build()?;
        Ok(Box::new(source) as Box<dyn Source>)
    });
    registry.register_destination("sink", move |_: &Value, _: &Value| {
        Ok(Box::new(SinkDestination(Arc::clone(&sink))) as Box<dyn Destination>)
    });
    registry
}

fn config(schedule: &str, database: Option<String>) -> FlowConfig {
    FlowConfig {
        database,
        sources: vec![ConnectorConfig {
            id: "src".into(),
            provider: "fake".into(),
            credentials: json!({"token": "s3cret"}),
            options: Value::Null,
        }],
        destinations: vec![ConnectorConfig {
            id: "dst".into(),
            provider: "sink".into(),
            credentials: Value::Null,
            options: Value::Null,
        }],
        connections: vec![ConnectionConfig {
            id: "c1".into(),
            source: "src".into(),
            destination: "dst".into(),
            schedule: schedule.into(),
        }],
        ..FlowConfig::default()
    }
}

async fn executions(handle: &FlowHandle) -> Vec<Execution> {
    handle.store().lock().await.executions_for("c1").unwrap()
}

async fn wait_for<F>(handle: &FlowHandle, mut done: F) -> Vec<Execution>
where
    F: FnMut(&[Execution]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = executions(handle).await;
        if done(&current) {
            return current;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out, executions: {current:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn seeded_connection_loops_on_its_schedule() {
    relayflow_core::logging::init();
    let sink = Arc::new(Sink::default());
    let api = Arc::new(FakeApi::default());
    let clock = Arc::new(FastClock {
        now: Mutex::new(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 30).unwrap()),
    });

    let engine = RelayFlow::new()
        .config(config("* * * * *", None))
        .registry(registry(Arc::clone(&sink)))
        .http_client(api.clone())
        .clock(clock)
        .build()
        .unwrap();
    let handle = engine.handle();

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(engine.run_with_shutdown(async move {
        let _ = stopped.await;
    }));

    let done = wait_for(&handle, |all| {
        all.iter()
            .filter(|e| e.status == ExecutionStatus::Completed)
            .count()
            >= 2
    })
    .await;

    let _ = stop.send(());
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("engine did not stop")
        .unwrap()
        .unwrap();

    let first = &done[0];
    let second = &done[1];
    assert_eq!(first.restart_count, 0);
    assert_eq!(second.restart_count, 1);
    for execution in [first, second] {
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.action["action"], "LOOP");
    }

    let batches = sink.batches.lock().unwrap().clone();
    assert!(batches.len() >= 2);
    assert!(batches.iter().all(|b| b.stream == "items" && b.len() == 2));
    assert!(api.auth.lock().unwrap().iter().all(|a| a == "Bearer s3cret"));

    let connection = handle.store().lock().await.get_connection("c1").unwrap().unwrap();
    assert!(connection.last_ran_at.is_some());
}

#[tokio::test]
async fn restarted_engine_resumes_a_sleeping_execution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.db").to_string_lossy().into_owned();
    let sink = Arc::new(Sink::default());

    // First engine: one run, then sleep until new year.
    let first_api = Arc::new(FakeApi::default());
    let engine = RelayFlow::new()
        .config(config("0 0 1 1 *", Some(path.clone())))
        .registry(registry(Arc::clone(&sink)))
        .http_client(first_api.clone())
        .build()
        .unwrap();
    let handle = engine.handle();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(engine.run_with_shutdown(async move {
        let _ = stopped.await;
    }));

    let waiting = wait_for(&handle, |all| {
        all.first().map(|e| e.action["action"] == "WAIT").unwrap_or(false)
    })
    .await;
    let _ = stop.send(());
    task.await.unwrap().unwrap();
    drop(handle);

    assert_eq!(first_api.hits.load(Ordering::SeqCst), 1);
    assert_eq!(waiting[0].status, ExecutionStatus::Running);
    let execution_id = waiting[0].id.clone();

    // Second engine: same database, nothing re-runs.
    let second_api = Arc::new(FakeApi::default());
    let engine = RelayFlow::new()
        .config(config("0 0 1 1 *", Some(path)))
        .registry(registry(Arc::clone(&sink)))
        .http_client(second_api.clone())
        .build()
        .unwrap();
    let handle = engine.handle();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(engine.run_with_shutdown(async move {
        let _ = stopped.await;
    }));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let _ = stop.send(());
    task.await.unwrap().unwrap();

    assert_eq!(second_api.hits.load(Ordering::SeqCst), 0);
    let all = executions(&handle).await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, execution_id);
    assert_eq!(all[0].status, ExecutionStatus::Running);
    assert_eq!(all[0].action["action"], "WAIT");

    let connection = handle.store().lock().await.get_connection("c1").unwrap().unwrap();
    assert!(connection.run_token.is_none());
    assert!(connection.last_ran_at.is_some());
    assert_eq!(connection.execution_id.as_deref(), Some(execution_id.as_str()));
    assert_eq!(sink.batches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn run_now_for_unknown_connection_is_not_found() {
    let engine = RelayFlow::new().registry(registry(Arc::new(Sink::default()))).build().unwrap();
    let handle = engine.handle();
    let err = handle.run_now("missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
