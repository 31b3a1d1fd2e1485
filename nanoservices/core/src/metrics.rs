use std::convert::Infallible;
use std::net::TcpListener;

use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use relayflow_utils::FlowResult;
use tokio::task::JoinHandle;

static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("relayflow".to_string()), None).expect("valid metrics prefix")
});

fn counter(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

fn histogram(name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("valid histogram");
    REGISTRY.register(Box::new(h.clone())).ok();
    h
}

static JOB_RUNS: Lazy<IntCounterVec> =
    Lazy::new(|| counter("job_runs_total", "Jobs started", &["source"]));

static JOB_FAILURES: Lazy<IntCounterVec> =
    Lazy::new(|| counter("job_failures_total", "Jobs that ended in an error", &["source"]));

static JOB_DURATION_MS: Lazy<HistogramVec> =
    Lazy::new(|| histogram("job_duration_ms", "Job run duration in milliseconds", &["source"]));

static PAGE_FETCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "page_fetches_total",
        "HTTP requests issued while paginating",
        &["source", "stream", "outcome"],
    )
});

static FETCH_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "fetch_retries_total",
        "Non-2xx responses that were retried",
        &["source", "stream"],
    )
});

static RECORDS_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "records_written_total",
        "Records handed to destinations",
        &["source", "stream"],
    )
});

static RESERVATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "reservations_total",
        "Run-token reservation attempts by outcome",
        &["outcome"],
    )
});

static TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "orchestration_transitions_total",
        "Orchestration actions executed",
        &["action"],
    )
});

static ACTIVE_EXECUTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("active_executions", "Orchestration executions in flight")
        .expect("valid gauge");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn inc_job_run(source: &str) {
    JOB_RUNS.with_label_values(&[source]).inc();
}

pub fn inc_job_failure(source: &str) {
    JOB_FAILURES.with_label_values(&[source]).inc();
}

pub fn observe_job_duration(source: &str, duration_ms: f64) {
    JOB_DURATION_MS.with_label_values(&[source]).observe(duration_ms);
}

/// Count one request; `outcome` is `ok` or `error`.
pub fn inc_page_fetch(source: &str, stream: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    PAGE_FETCHES.with_label_values(&[source, stream, outcome]).inc();
}

pub fn inc_retry(source: &str, stream: &str) {
    FETCH_RETRIES.with_label_values(&[source, stream]).inc();
}

pub fn add_records(source: &str, stream: &str, count: usize) {
    RECORDS_WRITTEN
        .with_label_values(&[source, stream])
        .inc_by(count as u64);
}

pub fn inc_reservation(granted: bool) {
    let outcome = if granted { "granted" } else { "denied" };
    RESERVATIONS.with_label_values(&[outcome]).inc();
}

pub fn inc_transition(action: &str) {
    TRANSITIONS.with_label_values(&[action]).inc();
}

pub fn execution_started() {
    ACTIVE_EXECUTIONS.inc();
}

pub fn execution_finished() {
    ACTIVE_EXECUTIONS.dec();
}

/// Current registry contents in the Prometheus text exposition format.
pub fn gather_text() -> String {
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut buffer) {
        tracing::error!(error = ?e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

async fn serve(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let mut response = Response::new(Body::empty());
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            if let Ok(value) = "text/plain; version=0.0.4".parse() {
                response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
            }
            *response.body_mut() = Body::from(gather_text());
        }
        _ => *response.status_mut() = StatusCode::NOT_FOUND,
    }
    Ok(response)
}

/// Serve `/metrics` on `listener` from the current tokio runtime until
/// `shutdown` resolves.
pub fn start_exporter_with_shutdown<F>(listener: TcpListener, shutdown: F) -> FlowResult<JoinHandle<()>>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;

    Ok(tokio::spawn(async move {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("metrics exporter shutdown requested");
                    break;
                }
                accept = listener.accept() => match accept {
                    Ok((stream, _peer)) => {
                        tokio::spawn(async move {
                            if let Err(err) = hyper::server::conn::Http::new()
                                .serve_connection(stream, service_fn(serve))
                                .await
                            {
                                tracing::error!(error = ?err, "metrics connection error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "metrics listener accept failed");
                        break;
                    }
                },
            }
        }
        tracing::info!("metrics exporter stopped");
    }))
}

/// Like [`start_exporter_with_shutdown`], returning a sender that stops the
/// exporter.
pub fn start_exporter(
    listener: TcpListener,
) -> FlowResult<(JoinHandle<()>, tokio::sync::oneshot::Sender<()>)> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let handle = start_exporter_with_shutdown(listener, async move {
        let _ = rx.await;
    })?;
    Ok((handle, tx))
}
