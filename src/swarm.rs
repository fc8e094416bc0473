//! Demo load driver.
//!
//! Spawns a fixed number of virtual users, each picking scenario tasks at
//! random until the run duration is up. When time runs out the user
//! futures are dropped, so calls still in flight are cancelled and leave no
//! record behind. Completed records flow through a channel into a
//! [`Summary`].

use bytes::Bytes;
use hdrhistogram::Histogram;
use opentelemetry::trace::{FutureExt, TraceContextExt};
use opentelemetry::Context;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SwarmConfig;
use crate::matcher::Expectation;
use crate::recorder::{EventSink, OutcomeRecord};
use crate::telemetry::{self, TraceHook};
use crate::user::TcpUser;

/// One request/response exchange inside a task.
#[derive(Debug, Clone)]
pub struct Step {
    label: String,
    payload: Bytes,
    expect: Option<Expectation>,
    record_as: Option<String>,
}

impl Step {
    pub fn new(label: impl Into<String>, payload: impl Into<Bytes>, expect: Option<Expectation>) -> Self {
        Step {
            label: label.into(),
            payload: payload.into(),
            expect,
            record_as: None,
        }
    }

    /// Record this step under `name` instead of the task name.
    pub fn record_as(mut self, name: impl Into<String>) -> Self {
        self.record_as = Some(name.into());
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn expectation(&self) -> Option<&Expectation> {
        self.expect.as_ref()
    }
}

/// A named scenario a virtual user can pick.
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    steps: Vec<Step>,
}

impl Task {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Task {
            name: name.into(),
            steps,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// The stock scenarios for the stub server.
    pub fn defaults() -> Vec<Task> {
        let world = || Some(Expectation::exact(&b"world"[..]));
        vec![
            Task::new("hello", vec![Step::new("hello", &b"hello"[..], world())]),
            Task::new(
                "loud_speaker",
                vec![
                    Step::new("hello", &b"hello"[..], world()),
                    Step::new(
                        "get yes",
                        &b"get yes"[..],
                        Some(Expectation::exact(&b"yes"[..])),
                    ),
                    Step::new(
                        "bye",
                        &b"bye"[..],
                        Some(Expectation::exact(&b"default response"[..])),
                    ),
                ],
            ),
        ]
    }

    /// Run every step in order. A failed step does not stop the task.
    ///
    /// The task gets an OpenTelemetry span and each step a child span, so
    /// every outcome record carries the ids of the step that produced it.
    /// Returns how many steps passed.
    pub async fn run(&self, user: &TcpUser) -> usize {
        let task_cx = telemetry::child_context(&Context::current(), self.name.clone());
        let mut passed = 0;
        for step in &self.steps {
            let name = step.record_as.as_deref().unwrap_or(&self.name);
            let step_cx = telemetry::child_context(&task_cx, step.label.clone());
            let ok = user
                .send_bytes_rec(name, &step.payload, step.expect.as_ref())
                .with_context(step_cx.clone())
                .instrument(info_span!("step", label = %step.label))
                .await
                .is_some();
            step_cx.span().end();
            if ok {
                passed += 1;
            }
        }
        task_cx.span().end();
        passed
    }
}

/// Swarm failures that end the whole run.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("failed to set up latency histogram: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),
    #[error("aggregator task failed: {0}")]
    Aggregator(#[from] tokio::task::JoinError),
}

/// Highest latency tracked by the summary, in microseconds
const MAX_TRACKED_MICROS: u64 = 60 * 60 * 1_000_000;

/// Per-name statistics
struct Entry {
    requests: u64,
    failures: u64,
    response_bytes: u64,
    latency: Histogram<u64>,
}

/// Aggregated view of outcome records, keyed by operation name.
pub struct Summary {
    template: Histogram<u64>,
    entries: BTreeMap<String, Entry>,
}

impl Summary {
    pub fn new() -> Result<Self, SwarmError> {
        Ok(Summary {
            template: Histogram::new_with_bounds(1, MAX_TRACKED_MICROS, 3)?,
            entries: BTreeMap::new(),
        })
    }

    pub fn add(&mut self, record: &OutcomeRecord) {
        let template = &self.template;
        let entry = self
            .entries
            .entry(record.name.clone())
            .or_insert_with(|| Entry {
                requests: 0,
                failures: 0,
                response_bytes: 0,
                latency: Histogram::new_from(template),
            });

        entry.requests += 1;
        if !record.is_success() {
            entry.failures += 1;
        }
        entry.response_bytes += record.response_size as u64;
        let micros = u64::try_from(record.elapsed.as_micros()).unwrap_or(u64::MAX);
        entry.latency.saturating_record(micros.max(1));
    }

    pub fn requests(&self, name: &str) -> u64 {
        self.entries.get(name).map_or(0, |e| e.requests)
    }

    pub fn failures(&self, name: &str) -> u64 {
        self.entries.get(name).map_or(0, |e| e.failures)
    }

    pub fn total_requests(&self) -> u64 {
        self.entries.values().map(|e| e.requests).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.entries.values().map(|e| e.failures).sum()
    }

    /// Latency at `quantile` for `name`, in milliseconds
    pub fn quantile_ms(&self, name: &str, quantile: f64) -> Option<f64> {
        self.entries
            .get(name)
            .map(|e| e.latency.value_at_quantile(quantile) as f64 / 1_000.0)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = |micros: u64| micros as f64 / 1_000.0;

        writeln!(
            f,
            "{:<20} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9} {:>10}",
            "Name", "# reqs", "# fails", "avg ms", "min ms", "p50 ms", "p95 ms", "max ms", "avg bytes"
        )?;
        for (name, e) in &self.entries {
            writeln!(
                f,
                "{:<20} {:>8} {:>8} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>10}",
                name,
                e.requests,
                e.failures,
                e.latency.mean() / 1_000.0,
                ms(e.latency.min()),
                ms(e.latency.value_at_quantile(0.5)),
                ms(e.latency.value_at_quantile(0.95)),
                ms(e.latency.max()),
                e.response_bytes / e.requests.max(1),
            )?;
        }
        write!(
            f,
            "{:<20} {:>8} {:>8}",
            "Aggregated",
            self.total_requests(),
            self.total_failures()
        )
    }
}

/// Drive `config.users` virtual users for `config.duration`.
pub async fn run(config: SwarmConfig, hook: Option<Arc<dyn TraceHook>>) -> Result<Summary, SwarmError> {
    let mut summary = Summary::new()?;
    let (tx, mut rx) = mpsc::unbounded_channel::<OutcomeRecord>();
    let sink: Arc<dyn EventSink> = Arc::new(tx);

    let aggregator = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            summary.add(&record);
        }
        summary
    });

    let mut user = TcpUser::new(config.endpoint.clone(), sink)
        .timeouts(config.timeouts)
        .record(config.record);
    if let Some(hook) = hook {
        user = user.with_trace_hook(hook);
    }

    info!(
        endpoint = %format!("{}:{}", config.endpoint.host(), config.endpoint.port()),
        users = config.users,
        duration = ?config.duration,
        "Starting swarm"
    );

    let tasks = Arc::new(config.tasks);
    let deadline = tokio::time::Instant::now() + config.duration;
    let mut users = JoinSet::new();

    for id in 0..config.users {
        let user = user.clone();
        let tasks = Arc::clone(&tasks);
        let wait = config.wait;

        users.spawn(
            async move {
                let work = async {
                    let mut rng = StdRng::from_entropy();
                    let mut iterations = 0u64;
                    while let Some(task) = tasks.choose(&mut rng) {
                        let passed = task
                            .run(&user)
                            .instrument(info_span!("task", name = %task.name))
                            .await;
                        debug!(task = %task.name, passed, steps = task.steps.len(), "Task done");
                        iterations += 1;
                        pause(wait).await;
                    }
                    iterations
                };
                // Anything still in flight at the deadline is dropped
                if let Ok(iterations) = tokio::time::timeout_at(deadline, work).await {
                    debug!(iterations, "User ran out of tasks");
                }
            }
            .instrument(info_span!("user", id)),
        );
    }
    drop(user);

    while let Some(joined) = users.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Virtual user failed");
        }
    }

    // Every sink clone is gone now, so the aggregator sees the channel close
    Ok(aggregator.await?)
}

async fn pause(wait: Duration) {
    if wait.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Endpoint, Timeouts};
    use crate::config::ServerConfig;
    use crate::error::HarnessError;
    use crate::server::{Latency, StubServer};
    use crate::telemetry::NoopTraceHook;
    use std::time::SystemTime;

    fn record(name: &str, elapsed_ms: u64, failed: bool) -> OutcomeRecord {
        OutcomeRecord {
            name: name.to_string(),
            kind: "tcp".to_string(),
            start_time: SystemTime::now(),
            response: None,
            response_size: 5,
            elapsed: Duration::from_millis(elapsed_ms),
            failure: failed.then(|| Arc::new(HarnessError::Cancelled)),
            trace: None,
        }
    }

    #[test]
    fn test_defaults() {
        let tasks = Task::defaults();
        let names: Vec<_> = tasks.iter().map(Task::name).collect();
        assert_eq!(names, ["hello", "loud_speaker"]);
        let labels: Vec<_> = tasks[1].steps().iter().map(Step::label).collect();
        assert_eq!(labels, ["hello", "get yes", "bye"]);
    }

    #[test]
    fn test_summary_aggregates() {
        let mut summary = Summary::new().unwrap();
        for ms in 1..=100 {
            summary.add(&record("hello", ms, ms % 10 == 0));
        }
        summary.add(&record("bye", 3, false));

        assert_eq!(summary.requests("hello"), 100);
        assert_eq!(summary.failures("hello"), 10);
        assert_eq!(summary.total_requests(), 101);
        assert_eq!(summary.total_failures(), 10);
        assert_eq!(summary.requests("missing"), 0);

        let p50 = summary.quantile_ms("hello", 0.5).unwrap();
        assert!((49.0..=51.0).contains(&p50), "p50 {p50}");

        let names: Vec<_> = summary.names().collect();
        assert_eq!(names, ["bye", "hello"]);

        let rendered = summary.to_string();
        assert!(rendered.contains("hello"));
        assert!(rendered.contains("Aggregated"));
    }

    #[tokio::test]
    async fn test_swarm_against_stub_server() {
        let server = StubServer::bind(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            latency: Latency::uniform(0.005).unwrap(),
            seed: Some(21),
            backlog: 10,
            read_timeout: Duration::from_secs(1),
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let config = SwarmConfig {
            endpoint: Endpoint::new("127.0.0.1", addr.port(), 4096).unwrap(),
            timeouts: Timeouts::default(),
            users: 3,
            duration: Duration::from_millis(300),
            wait: Duration::ZERO,
            record: true,
            tasks: vec![Task::new(
                "hello",
                vec![Step::new("hello", &b"hello"[..], Some(Expectation::exact(&b"world"[..])))],
            )],
        };

        let summary = run(config, Some(Arc::new(NoopTraceHook))).await.unwrap();
        assert!(summary.requests("hello") > 0);
        assert_eq!(summary.failures("hello"), 0);
    }

    #[tokio::test]
    async fn test_swarm_without_recording() {
        let server = StubServer::bind(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            latency: Latency::uniform(0.005).unwrap(),
            seed: Some(22),
            backlog: 10,
            read_timeout: Duration::from_secs(1),
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let config = SwarmConfig {
            endpoint: Endpoint::new("127.0.0.1", addr.port(), 4096).unwrap(),
            timeouts: Timeouts::default(),
            users: 2,
            duration: Duration::from_millis(100),
            wait: Duration::from_millis(5),
            record: false,
            tasks: Task::defaults(),
        };

        let summary = run(config, Some(Arc::new(NoopTraceHook))).await.unwrap();
        assert_eq!(summary.total_requests(), 0);
    }

    #[tokio::test]
    async fn test_loud_speaker_steps_carry_trace_ids() {
        use crate::recorder::MemorySink;
        use crate::telemetry::OtelTraceHook;
        use std::collections::HashSet;

        opentelemetry::global::set_tracer_provider(
            opentelemetry_sdk::trace::TracerProvider::builder().build(),
        );

        let server = StubServer::bind(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            latency: Latency::uniform(0.005).unwrap(),
            seed: Some(23),
            backlog: 10,
            read_timeout: Duration::from_secs(1),
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let sink = Arc::new(MemorySink::new());
        let user = TcpUser::new(Endpoint::new("127.0.0.1", addr.port(), 4096).unwrap(), sink.clone())
            .with_trace_hook(Arc::new(OtelTraceHook));
        let tasks = Task::defaults();
        let (hello, loud_speaker) = (&tasks[0], &tasks[1]);

        // "get yes" may draw "no"; the other two always pass
        assert!(loud_speaker.run(&user).await >= 2);

        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.name == "loud_speaker"));

        let ids: Vec<_> = records
            .iter()
            .map(|r| r.trace.clone().expect("step span ids attached"))
            .collect();
        assert!(ids.iter().all(|t| t.trace_id == ids[0].trace_id));
        assert!(ids.iter().all(|t| t.trace_id.len() == 32 && t.span_id.len() == 16));
        let span_ids: HashSet<_> = ids.iter().map(|t| t.span_id.as_str()).collect();
        assert_eq!(span_ids.len(), 3);

        // A separate task run is a separate trace
        assert_eq!(hello.run(&user).await, 1);
        let records = sink.records();
        let hello_trace = records[3].trace.as_ref().expect("step span ids attached");
        assert_ne!(hello_trace.trace_id, ids[0].trace_id);
    }
}
