//! tcp-harness: TCP request/response load-testing harness
//!
//! Two halves share one wire convention (raw bytes, read until a short
//! read):
//! - A stub server that answers canned replies after a random mock latency
//! - A client-side harness that sends payloads, checks responses against
//!   expectations, and records one outcome per operation
//!
//! Features:
//! - Serial stub server with an ordered, case-insensitive rule table
//! - Per-step connect/write/read timeouts
//! - Exact, pattern and predicate expectations
//! - Outcome records with OpenTelemetry trace ids when a span is active
//! - Configuration via CLI arguments or TOML file

pub mod client;
pub mod config;
pub mod error;
pub mod matcher;
pub mod protocols;
pub mod recorder;
pub mod server;
pub mod swarm;
pub mod telemetry;
pub mod user;
pub mod wire;

pub use client::{Client, Endpoint, Timeouts};
pub use error::{HarnessError, Phase};
pub use matcher::{Expectation, Mismatch};
pub use recorder::{EventSink, MemorySink, OutcomeRecord, Recorder, Recording};
pub use server::{Latency, StubServer};
pub use user::TcpUser;
