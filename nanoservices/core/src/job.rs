//! One sync of a source into a destination.
//!
//! Streams run in the order the source declares them. A nested stream is
//! reached by paginating its ancestors: each ancestor record seeds one full
//! pagination of the next level, and only the last level's pages are written.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::future::BoxFuture;
use relayflow_utils::error::Error;
use relayflow_utils::{Batch, FlowResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credentials;
use crate::dag::node::StreamNode;
use crate::dag::resolver;
use crate::destinations::traits::{Destination, JobContext};
use crate::metrics;
use crate::registry::ConnectorRegistry;
use crate::sources::http_client::HttpClient;
use crate::sources::rate_limit::Pacer;
use crate::sources::traits::{Continuation, Source, SourceContext, Stream, StreamContext};

/// Non-2xx responses tolerated per request before the run fails.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Provider name plus the stored credentials and options of a source or
/// destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorArgs {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub credentials: Value,
    #[serde(default)]
    pub options: Value,
}

/// Everything a job runner needs to build a job; travels inside the RUN
/// action envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobArgs {
    pub job_id: String,
    pub connection_id: String,
    pub source: ConnectorArgs,
    pub destination: ConnectorArgs,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub requests: u64,
    pub retries: u64,
    pub batches: u64,
    pub records: u64,
}

pub struct Job {
    args: JobArgs,
    source: Box<dyn Source>,
    source_context: SourceContext,
    destination: Box<dyn Destination>,
    http: Arc<dyn HttpClient>,
    pacer: Arc<dyn Pacer>,
    max_retries: u32,
}

impl Job {
    /// Resolve credentials and construct fresh connector instances.
    pub async fn build(
        registry: &ConnectorRegistry,
        args: JobArgs,
        http: Arc<dyn HttpClient>,
        pacer: Arc<dyn Pacer>,
    ) -> FlowResult<Self> {
        let source_credentials =
            credentials::resolve(&args.source.provider, registry, &args.source.credentials).await?;
        let destination_credentials = credentials::resolve(
            &args.destination.provider,
            registry,
            &args.destination.credentials,
        )
        .await?;

        let source = registry.source(&args.source.provider, &args.source.options)?;
        let destination = registry.destination(
            &args.destination.provider,
            &args.destination.options,
            &destination_credentials,
        )?;

        Ok(Self {
            args,
            source,
            source_context: SourceContext {
                credentials: source_credentials,
            },
            destination,
            http,
            pacer,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn id(&self) -> &str {
        &self.args.job_id
    }

    /// Open the destination, traverse every stream, and always close the
    /// destination. The first error wins.
    #[tracing::instrument(skip(self), fields(job = %self.args.job_id, source = %self.source.name()))]
    pub async fn run(mut self) -> FlowResult<JobReport> {
        let source_name = self.source.name().to_string();
        metrics::inc_job_run(&source_name);
        let started = Instant::now();

        let context = JobContext {
            job_id: self.args.job_id.clone(),
            source_options: self.args.source.options.clone(),
            destination_options: self.args.destination.options.clone(),
        };

        let result = match self.destination.open(&context).await {
            Ok(()) => {
                let traversed = self.traverse(&context).await;
                let closed = self.destination.close(&context).await;
                traversed.and_then(|report| closed.map(|_| report))
            }
            Err(e) => Err(e),
        };

        metrics::observe_job_duration(&source_name, started.elapsed().as_millis() as f64);
        match &result {
            Ok(report) => tracing::info!(
                requests = report.requests,
                batches = report.batches,
                records = report.records,
                "job finished"
            ),
            Err(e) => {
                metrics::inc_job_failure(&source_name);
                tracing::error!(error = %e, "job failed");
            }
        }
        result
    }

    async fn traverse(&mut self, context: &JobContext) -> FlowResult<JobReport> {
        let streams = self.source.streams();
        let forest = resolver::resolve(
            streams.iter().map(|s| StreamNode::of(s.as_ref())).collect(),
        )?;
        let by_name: HashMap<&str, &Arc<dyn Stream>> =
            streams.iter().map(|s| (s.name(), s)).collect();

        let mut walker = Walker {
            source: self.source.as_ref(),
            source_context: &self.source_context,
            destination: &mut self.destination,
            job: context,
            http: self.http.as_ref(),
            pacer: self.pacer.as_ref(),
            max_retries: self.max_retries,
            report: JobReport::default(),
        };

        for name in &forest.declared {
            let chain = forest
                .chain(name)?
                .iter()
                .map(|n| {
                    by_name
                        .get(n.as_str())
                        .map(|s| Arc::clone(s))
                        .ok_or_else(|| Error::InvalidStreams(format!("unknown stream '{n}'")))
                })
                .collect::<FlowResult<Vec<_>>>()?;
            tracing::debug!(stream = %name, depth = chain.len(), "traversing stream");
            walker.walk(&chain, 0, StreamContext::root()).await?;
        }

        Ok(walker.report)
    }
}

struct Walker<'a> {
    source: &'a dyn Source,
    source_context: &'a SourceContext,
    destination: &'a mut Box<dyn Destination>,
    job: &'a JobContext,
    http: &'a dyn HttpClient,
    pacer: &'a dyn Pacer,
    max_retries: u32,
    report: JobReport,
}

impl<'a> Walker<'a> {
    /// Paginate `chain[depth]` under `context`. Intermediate levels recurse
    /// into the next level once per record; the last level writes batches.
    fn walk<'s>(
        &'s mut self,
        chain: &'s [Arc<dyn Stream>],
        depth: usize,
        context: StreamContext,
    ) -> BoxFuture<'s, FlowResult<()>> {
        Box::pin(async move {
            let stream = &chain[depth];
            let is_target = depth + 1 == chain.len();
            let mut request = stream.seed(&context)?;
            let mut attempts: u32 = 0;

            loop {
                let mut outgoing = request.clone();
                let mut headers = self.source.headers(self.source_context)?;
                headers.extend(request.headers.clone());
                outgoing.headers = headers;

                let response = self.http.execute(&outgoing).await?;
                self.report.requests += 1;
                metrics::inc_page_fetch(self.source.name(), stream.name(), response.is_success());

                if response.is_success() {
                    attempts = 0;
                    let records = stream.transform(&response.body, &context)?;
                    tracing::debug!(
                        stream = stream.name(),
                        url = %request.url,
                        records = records.len(),
                        "fetched page"
                    );

                    let continuation = if is_target {
                        let batch = Batch::new(self.source.name(), stream.name(), records, Utc::now());
                        self.destination.write(&batch, self.job).await?;
                        self.report.batches += 1;
                        self.report.records += batch.len() as u64;
                        metrics::add_records(self.source.name(), stream.name(), batch.len());
                        stream.next(&response, batch.records(), &context)?
                    } else {
                        for record in &records {
                            self.walk(chain, depth + 1, StreamContext::child_of(record.clone()))
                                .await?;
                        }
                        stream.next(&response, &records, &context)?
                    };

                    match continuation {
                        Continuation::Done => break,
                        Continuation::Next(next) => request = next,
                    }
                } else {
                    attempts += 1;
                    if attempts > self.max_retries {
                        tracing::error!(
                            stream = stream.name(),
                            url = %request.url,
                            status = response.status,
                            attempts,
                            "giving up on request"
                        );
                        return Err(Error::RetriesExhausted {
                            url: request.url.clone(),
                            status: response.status,
                            attempts,
                        });
                    }
                    self.report.retries += 1;
                    metrics::inc_retry(self.source.name(), stream.name());
                    tracing::warn!(
                        stream = stream.name(),
                        url = %request.url,
                        status = response.status,
                        attempt = attempts,
                        "request failed, retrying"
                    );
                }

                self.pacer.pause(self.source.request_spacing(&response)).await;
            }

            Ok(())
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted collaborators shared by job and orchestration tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::sources::traits::{Request, Response};

    /// Serves canned responses by URL, in order; the last one repeats.
    #[derive(Default)]
    pub struct ScriptedHttp {
        pub routes: Mutex<HashMap<String, VecDeque<Response>>>,
        pub requests: Mutex<Vec<Request>>,
    }

    impl ScriptedHttp {
        pub fn route(self, url: &str, status: u16, body: &str) -> Self {
            self.routes
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(Response::new(url, status, body));
            self
        }

        pub fn urls(&self) -> Vec<String> {
            self.requests.lock().unwrap().iter().map(|r| r.url.clone()).collect()
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedHttp {
        async fn execute(&self, request: &Request) -> FlowResult<Response> {
            self.requests.lock().unwrap().push(request.clone());
            let mut routes = self.routes.lock().unwrap();
            let queue = routes
                .get_mut(&request.url)
                .ok_or_else(|| Error::InvalidInput(format!("no route for {}", request.url)))?;
            let response = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            response.ok_or_else(|| Error::InvalidInput(format!("no response for {}", request.url)))
        }
    }

    #[derive(Default)]
    pub struct RecordingPacer {
        pub pauses: Mutex<Vec<Duration>>,
    }

    impl RecordingPacer {
        pub fn count(&self) -> usize {
            self.pauses.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Pacer for RecordingPacer {
        async fn pause(&self, duration: Duration) {
            self.pauses.lock().unwrap().push(duration);
        }
    }

    /// Written batches as (stream, records), plus open/close bookkeeping.
    #[derive(Default)]
    pub struct Sink {
        pub batches: Mutex<Vec<(String, Vec<Value>)>>,
        pub opened: Mutex<u32>,
        pub closed: Mutex<u32>,
    }

    pub struct SinkDestination(pub Arc<Sink>);

    #[async_trait]
    impl Destination for SinkDestination {
        fn name(&self) -> &str {
            "sink"
        }
        async fn open(&mut self, _context: &JobContext) -> FlowResult<()> {
            *self.0.opened.lock().unwrap() += 1;
            Ok(())
        }
        async fn write(&mut self, batch: &Batch, _context: &JobContext) -> FlowResult<()> {
            self.0
                .batches
                .lock()
                .unwrap()
                .push((batch.stream.clone(), batch.records().to_vec()));
            Ok(())
        }
        async fn close(&mut self, _context: &JobContext) -> FlowResult<()> {
            *self.0.closed.lock().unwrap() += 1;
            Ok(())
        }
    }

    pub fn args(source: &str) -> JobArgs {
        JobArgs {
            job_id: "job-1".to_string(),
            connection_id: "conn-1".to_string(),
            source: ConnectorArgs {
                id: "src-1".to_string(),
                provider: source.to_string(),
                credentials: serde_json::json!({"token": "t0k"}),
                options: Value::Null,
            },
            destination: ConnectorArgs {
                id: "dst-1".to_string(),
                provider: "sink".to_string(),
                credentials: Value::Null,
                options: Value::Null,
            },
        }
    }

    pub fn register_sink(registry: &mut ConnectorRegistry, sink: Arc<Sink>) {
        registry.register_destination("sink", move |_: &Value, _: &Value| {
            Ok(Box::new(SinkDestination(Arc::clone(&sink))) as Box<dyn Destination>)
        });
    }
}
