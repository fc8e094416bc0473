//! A TCP virtual user: client, assertions and recording glued together.

use bytes::Bytes;
use std::sync::Arc;

use crate::client::{Client, Endpoint, Timeouts};
use crate::error::HarnessError;
use crate::matcher::{self, Expectation};
use crate::recorder::{EventSink, Recorder, KIND_TCP};
use crate::telemetry::TraceHook;

/// Issues recorded request/response operations against one endpoint.
///
/// Each operation opens its own connection, so a user can be cloned and
/// driven from as many tasks as needed.
#[derive(Clone)]
pub struct TcpUser {
    endpoint: Endpoint,
    timeouts: Timeouts,
    record: bool,
    sink: Arc<dyn EventSink>,
    hook: Option<Arc<dyn TraceHook>>,
}

impl TcpUser {
    pub fn new(endpoint: Endpoint, sink: Arc<dyn EventSink>) -> Self {
        TcpUser {
            endpoint,
            timeouts: Timeouts::default(),
            record: true,
            sink,
            hook: None,
        }
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Disable to run operations without emitting records.
    pub fn record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    pub fn with_trace_hook(mut self, hook: Arc<dyn TraceHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// A fresh client for this user's endpoint.
    pub fn client(&self) -> Client {
        Client::new(self.endpoint.clone(), self.timeouts)
    }

    /// Send `payload`, check the response and record the outcome as `name`.
    ///
    /// Returns the response when the call and the check both pass. Any
    /// failure ends up on the outcome record instead of being returned.
    pub async fn send_bytes_rec(
        &self,
        name: &str,
        payload: &[u8],
        expect: Option<&Expectation>,
    ) -> Option<Bytes> {
        let mut recorder = Recorder::new(name, self.sink.clone())
            .kind(KIND_TCP)
            .enabled(self.record);
        if let Some(hook) = &self.hook {
            recorder = recorder.with_trace_hook(hook.clone());
        }

        recorder
            .observe(async {
                let response = self.client().call(payload).await?;
                matcher::check(&response, expect)?;
                Ok::<_, HarnessError>(response)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::matcher::Mismatch;
    use crate::recorder::MemorySink;
    use crate::server::{Latency, StubServer};
    use crate::telemetry::NoopTraceHook;
    use std::time::Duration;

    async fn user_with_server(fixed_latency: Option<f64>) -> (TcpUser, Arc<MemorySink>) {
        let latency = match fixed_latency {
            Some(secs) => Latency::fixed(secs).unwrap(),
            None => Latency::uniform(0.01).unwrap(),
        };
        let server = StubServer::bind(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            latency,
            seed: Some(99),
            backlog: 10,
            read_timeout: Duration::from_secs(1),
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let sink = Arc::new(MemorySink::new());
        let endpoint = Endpoint::new("127.0.0.1", addr.port(), 4096).unwrap();
        let user = TcpUser::new(endpoint, sink.clone()).with_trace_hook(Arc::new(NoopTraceHook));
        (user, sink)
    }

    #[tokio::test]
    async fn test_hello_passes() {
        let (user, sink) = user_with_server(None).await;
        let expect = Expectation::exact(&b"world"[..]);
        let response = user.send_bytes_rec("hello", b"HELLO", Some(&expect)).await;
        assert_eq!(response.as_deref(), Some(&b"world"[..]));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "hello");
        assert_eq!(records[0].kind, "tcp");
        assert_eq!(records[0].response_size, 5);
        assert!(records[0].is_success());
    }

    #[tokio::test]
    async fn test_mismatch_recorded_with_both_values() {
        let (user, sink) = user_with_server(None).await;
        let expect = Expectation::exact(&b"world"[..]);
        let response = user.send_bytes_rec("bye", b"bye", Some(&expect)).await;
        assert!(response.is_none());

        let records = sink.records();
        assert_eq!(records.len(), 1);
        match records[0].failure.as_deref() {
            Some(HarnessError::Assertion(Mismatch::Bytes { actual, expected })) => {
                assert_eq!(&actual[..], b"default response");
                assert_eq!(&expected[..], b"world");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        // Failed checks do not set the response
        assert!(records[0].response.is_none());
    }

    #[tokio::test]
    async fn test_pattern_and_predicate() {
        let (user, sink) = user_with_server(None).await;
        let yes_or_no = Expectation::pattern("(yes|no)").unwrap();
        let short = Expectation::predicate("short", |b| b.len() <= 3);
        for _ in 0..5 {
            assert!(user
                .send_bytes_rec("get yes", b"get yes", Some(&yes_or_no))
                .await
                .is_some());
            assert!(user
                .send_bytes_rec("get yes", b"get yes", Some(&short))
                .await
                .is_some());
        }
        assert_eq!(sink.len(), 10);
        assert!(sink.records().iter().all(|r| r.is_success()));
    }

    #[tokio::test]
    async fn test_every_call_emits_once() {
        let (user, sink) = user_with_server(None).await;
        let expect = Expectation::exact(&b"world"[..]);
        for payload in [&b"hello"[..], b"nope", b"", b"Hello"] {
            user.send_bytes_rec("mixed", payload, Some(&expect)).await;
        }
        let records = sink.records();
        assert_eq!(records.len(), 4);
        assert_eq!(records.iter().filter(|r| r.is_success()).count(), 2);
    }

    #[tokio::test]
    async fn test_record_disabled() {
        let (user, sink) = user_with_server(None).await;
        let user = user.record(false);
        assert!(user.send_bytes_rec("hello", b"hello", None).await.is_some());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_connection_failure_recorded() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let sink = Arc::new(MemorySink::new());
        let user = TcpUser::new(Endpoint::new("127.0.0.1", addr.port(), 4096).unwrap(), sink.clone())
            .with_trace_hook(Arc::new(NoopTraceHook));

        assert!(user.send_bytes_rec("hello", b"hello", None).await.is_none());
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(matches!(
            records[0].failure.as_deref(),
            Some(HarnessError::Connection { .. })
        ));
    }

    #[tokio::test]
    async fn test_elapsed_at_least_fixed_latency() {
        let (user, sink) = user_with_server(Some(0.03)).await;
        user.send_bytes_rec("hello", b"hello", None).await;
        let records = sink.records();
        assert!(records[0].elapsed >= Duration::from_millis(30));
        assert!(records[0].elapsed_ms() >= 30.0);
    }
}
