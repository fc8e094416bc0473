//! Stub reply protocol.
//!
//! A canned-reply service for exercising TCP load-testing clients:
//! - Client sends raw bytes, no framing, then waits
//! - Server waits a random mock latency, replies, and closes the connection
//!
//! ## Rules
//!
//! Matching is case-insensitive and checked in order:
//!
//! ```text
//! hello     -> world
//! get yes   -> yes | no   (uniform)
//! anything  -> default response
//! ```
//!
//! Empty or malformed input just falls through to the default response.

pub mod handler;
pub mod rules;

pub use handler::handle_connection;
pub use rules::{Reply, Rule, RuleTable, DEFAULT_RESPONSE};
