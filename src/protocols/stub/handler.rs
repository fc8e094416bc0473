//! Stub protocol connection handler.

use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::rules::RuleTable;
use crate::error::{HarnessError, Phase};
use crate::server::Latency;
use crate::wire::read_to_quiescence;

/// Receive buffer size on the server side
pub const BUFFER_SIZE: usize = 4096;

/// Serve one request on an accepted connection.
///
/// Reads the request to quiescence, sleeps the mock latency, answers from
/// the rule table and shuts the write side down. The caller drops the
/// stream afterwards, so the connection is never kept alive.
pub async fn handle_connection<S, R>(
    stream: &mut S,
    rules: &RuleTable,
    latency: &Latency,
    rng: &mut R,
    read_timeout: Duration,
) -> Result<(), HarnessError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Rng + ?Sized,
{
    let request = read_to_quiescence(stream, BUFFER_SIZE, read_timeout).await?;

    tokio::time::sleep(latency.sample(rng)).await;

    let response = rules.classify(&request, rng);
    debug!(
        received = ?bytes::Bytes::copy_from_slice(&request),
        reply = ?bytes::Bytes::from_static(response),
        "Replying"
    );

    stream
        .write_all(response)
        .await
        .map_err(|e| HarnessError::connection(Phase::Write, e))?;
    stream
        .shutdown()
        .await
        .map_err(|e| HarnessError::connection(Phase::Write, e))?;

    Ok(())
}
