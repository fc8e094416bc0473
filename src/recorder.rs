//! Outcome recording.
//!
//! A [`Recorder`] wraps exactly one operation. [`Recorder::begin`] captures
//! the start time and hands back a [`Recording`]; [`Recording::finish`]
//! fills in elapsed time, failure and trace ids and fires the record at the
//! sink. A record is emitted once per operation, except:
//!
//! - recording is disabled for the call: the record is discarded
//! - the operation ended with [`HarnessError::Cancelled`]: nothing is emitted
//! - the [`Recording`] is dropped without being finished, which is what
//!   happens when the runtime drops the future driving the operation
//!
//! Every recording owns its own record; nothing is shared between
//! concurrent recordings.

use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::error::HarnessError;
use crate::telemetry::{self, TraceHook, TraceIds};

/// Request kind tag for TCP operations
pub const KIND_TCP: &str = "tcp";

/// One completed operation, as handed to the aggregator.
#[derive(Debug, Clone)]
pub struct OutcomeRecord {
    pub name: String,
    pub kind: String,
    pub start_time: SystemTime,
    pub response: Option<Bytes>,
    pub response_size: usize,
    pub elapsed: Duration,
    pub failure: Option<Arc<HarnessError>>,
    pub trace: Option<TraceIds>,
}

impl OutcomeRecord {
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1_000.0
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Receives outcome records. Fire and forget.
pub trait EventSink: Send + Sync {
    fn fire(&self, record: OutcomeRecord);
}

impl EventSink for UnboundedSender<OutcomeRecord> {
    fn fire(&self, record: OutcomeRecord) {
        // Receiver gone means nobody aggregates any more
        let _ = self.send(record);
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<OutcomeRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<OutcomeRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl EventSink for MemorySink {
    fn fire(&self, record: OutcomeRecord) {
        self.records.lock().push(record);
    }
}

/// Builder for a single recording.
pub struct Recorder {
    name: String,
    kind: String,
    enabled: bool,
    sink: Arc<dyn EventSink>,
    hook: Option<Arc<dyn TraceHook>>,
}

impl Recorder {
    pub fn new(name: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Recorder {
            name: name.into(),
            kind: "notset".to_string(),
            enabled: true,
            sink,
            hook: None,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// When disabled the record is built but never fired.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Use this hook instead of the process-wide one.
    pub fn with_trace_hook(mut self, hook: Arc<dyn TraceHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn begin(self) -> Recording {
        Recording {
            record: OutcomeRecord {
                name: self.name,
                kind: self.kind,
                start_time: SystemTime::now(),
                response: None,
                response_size: 0,
                elapsed: Duration::ZERO,
                failure: None,
                trace: None,
            },
            started: Instant::now(),
            elapsed: None,
            enabled: self.enabled,
            sink: self.sink,
            hook: self.hook.unwrap_or_else(telemetry::current),
            finished: false,
        }
    }

    /// Run `op` inside a recording.
    ///
    /// The response of a successful operation is set on the record. A
    /// failed operation is stored on the record and not propagated; the
    /// caller gets `None`. Dropping the returned future before it completes
    /// emits nothing.
    pub async fn observe<F>(self, op: F) -> Option<Bytes>
    where
        F: Future<Output = Result<Bytes, HarnessError>>,
    {
        let mut recording = self.begin();
        match op.await {
            Ok(response) => {
                recording.set_response(response.clone());
                recording.finish(Ok(()));
                Some(response)
            }
            Err(e) => {
                recording.finish(Err(e));
                None
            }
        }
    }
}

/// An operation in flight.
pub struct Recording {
    record: OutcomeRecord,
    started: Instant,
    elapsed: Option<Duration>,
    enabled: bool,
    sink: Arc<dyn EventSink>,
    hook: Arc<dyn TraceHook>,
    finished: bool,
}

impl Recording {
    /// Set the response and stop the clock.
    pub fn set_response(&mut self, response: Bytes) {
        self.record.response_size = response.len();
        self.record.response = Some(response);
        self.elapsed = Some(self.started.elapsed());
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Complete the recording and emit the record.
    pub fn finish(mut self, outcome: Result<(), HarnessError>) {
        self.finished = true;

        let span = self.hook.current_span();

        match outcome {
            Ok(()) => {}
            Err(HarnessError::Cancelled) => {
                trace!(name = %self.record.name, "Operation cancelled; record discarded");
                return;
            }
            Err(e) => {
                if let Some(span) = &span {
                    span.mark_error(&e);
                }
                self.record.failure = Some(Arc::new(e));
            }
        }

        self.record.elapsed = *self
            .elapsed
            .get_or_insert_with(|| self.started.elapsed());

        if let Some(span) = span.filter(|s| s.is_recording()) {
            self.record.trace = Some(span.ids());
        }

        if self.enabled {
            let record = std::mem::replace(&mut self.record, placeholder());
            self.sink.fire(record);
        }
    }
}

impl Drop for Recording {
    fn drop(&mut self) {
        if !self.finished {
            trace!(name = %self.record.name, "Recording dropped before finishing; record discarded");
        }
    }
}

fn placeholder() -> OutcomeRecord {
    OutcomeRecord {
        name: String::new(),
        kind: String::new(),
        start_time: SystemTime::UNIX_EPOCH,
        response: None,
        response_size: 0,
        elapsed: Duration::ZERO,
        failure: None,
        trace: None,
    }
}
