//! TCP connection client.
//!
//! One connection per call: connect, write the payload, read the response
//! to quiescence, close. Nothing is shared between calls, so any number of
//! callers can use clients concurrently.

use bytes::Bytes;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::trace;
use url::Url;

use crate::config::ConfigError;
use crate::error::{HarnessError, Phase};
use crate::wire::read_to_quiescence;

/// Default read buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Where to connect and how much to read at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    buffer_size: usize,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, buffer_size: usize) -> Result<Self, ConfigError> {
        let host = host.into();
        if port == 0 {
            return Err(ConfigError::InvalidEndpoint {
                target: format!("{host}:{port}"),
                reason: "port must be in 1..=65535".to_string(),
            });
        }
        if buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        Ok(Endpoint {
            host,
            port,
            buffer_size,
        })
    }

    /// Parse a `tcp://host:port` target.
    pub fn parse(target: &str, buffer_size: usize) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            target: target.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(target).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "tcp" {
            return Err(invalid("scheme must be tcp"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url.port().ok_or_else(|| invalid("missing port"))?;

        // IPv6 literals come back bracketed
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Self::new(host, port, buffer_size)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Independent bounds for each blocking step of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub write: Duration,
    /// Applied to every single read, not the whole response.
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Duration::from_secs(5),
            write: Duration::from_secs(10),
            read: Duration::from_secs(10),
        }
    }
}

/// Stateless request/response client.
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: Endpoint,
    timeouts: Timeouts,
}

impl Client {
    pub fn new(endpoint: Endpoint, timeouts: Timeouts) -> Self {
        Client { endpoint, timeouts }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send `payload` on a fresh connection and return the full response.
    ///
    /// The connection is closed on every exit path, including when the
    /// returned future is dropped mid-way.
    pub async fn call(&self, payload: &[u8]) -> Result<Bytes, HarnessError> {
        let Timeouts {
            connect,
            write,
            read,
        } = self.timeouts;

        let mut stream = tokio::time::timeout(
            connect,
            TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)),
        )
        .await
        .map_err(|_| HarnessError::timeout(Phase::Connect, connect))?
        .map_err(|e| HarnessError::connection(Phase::Connect, e))?;

        // write_all loops over partial writes
        tokio::time::timeout(write, stream.write_all(payload))
            .await
            .map_err(|_| HarnessError::timeout(Phase::Write, write))?
            .map_err(|e| HarnessError::connection(Phase::Write, e))?;

        let response = read_to_quiescence(&mut stream, self.endpoint.buffer_size, read).await?;
        trace!(sent = payload.len(), received = response.len(), "Call complete");

        Ok(response.freeze())
    }
}
