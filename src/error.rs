//! Failure taxonomy for harness operations.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::config::ConfigError;
use crate::matcher::Mismatch;

/// Point of the connection lifecycle where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Write,
    Read,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Connect => "connect",
            Phase::Write => "write",
            Phase::Read => "read",
        })
    }
}

/// Errors surfaced by a single harness operation.
///
/// Connection and timeout failures are never retried here. Retrying is up to
/// whoever drives the operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Refused, reset or otherwise failed TCP I/O.
    #[error("{phase} failed: {source}")]
    Connection {
        phase: Phase,
        #[source]
        source: io::Error,
    },

    /// A connect, write or read exceeded its bound.
    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: Phase, after: Duration },

    /// The response did not satisfy the expectation.
    #[error(transparent)]
    Assertion(#[from] Mismatch),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The runtime cancelled the operation (e.g. during shutdown).
    #[error("operation cancelled")]
    Cancelled,
}

impl HarnessError {
    pub fn connection(phase: Phase, source: io::Error) -> Self {
        HarnessError::Connection { phase, source }
    }

    pub fn timeout(phase: Phase, after: Duration) -> Self {
        HarnessError::Timeout { phase, after }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HarnessError::Cancelled)
    }
}
