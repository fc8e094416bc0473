//! Read-to-quiescence framing shared by the stub server and the client.
//!
//! There is no length prefix on the wire. A message is considered complete
//! as soon as one read returns fewer bytes than the read buffer holds.
//!
//! ## Known limitation
//!
//! This is a heuristic that only holds for short, bursty payloads. A
//! message whose length is an exact multiple of the buffer size makes the
//! reader wait for one more read, which only ends when the peer closes
//! (0 bytes) or the read timeout fires. A sender that trickles data slower
//! than the reader drains it will have its message cut short. Both sides
//! of this harness rely on the same rule, so it is kept as is.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{HarnessError, Phase};

/// Read until a read returns less than `buffer_size` bytes.
///
/// Each individual read is bounded by `read_timeout`.
pub async fn read_to_quiescence<R>(
    reader: &mut R,
    buffer_size: usize,
    read_timeout: Duration,
) -> Result<BytesMut, HarnessError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; buffer_size];
    let mut data = BytesMut::with_capacity(buffer_size);

    loop {
        let n = tokio::time::timeout(read_timeout, reader.read(&mut chunk))
            .await
            .map_err(|_| HarnessError::timeout(Phase::Read, read_timeout))?
            .map_err(|e| HarnessError::connection(Phase::Read, e))?;

        data.extend_from_slice(&chunk[..n]);

        if n < buffer_size {
            return Ok(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_short_read_completes() {
        let mut mock = Builder::new().read(b"world").build();
        let data = read_to_quiescence(&mut mock, 4096, SECOND).await.unwrap();
        assert_eq!(&data[..], b"world");
    }

    #[tokio::test]
    async fn test_full_buffers_keep_reading() {
        let mut mock = Builder::new().read(b"abcd").read(b"efgh").read(b"ij").build();
        let data = read_to_quiescence(&mut mock, 4, SECOND).await.unwrap();
        assert_eq!(&data[..], b"abcdefghij");
    }

    #[tokio::test]
    async fn test_exact_boundary_waits_for_eof() {
        // Lands exactly on the buffer size: only the trailing EOF ends it.
        let mut mock = Builder::new().read(b"abcd").build();
        let data = read_to_quiescence(&mut mock, 4, SECOND).await.unwrap();
        assert_eq!(&data[..], b"abcd");
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut mock = Builder::new().build();
        let data = read_to_quiescence(&mut mock, 16, SECOND).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_read_error_is_connection_failure() {
        let mut mock = Builder::new()
            .read_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .build();
        let err = read_to_quiescence(&mut mock, 16, SECOND).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Connection {
                phase: Phase::Read,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stalled_peer_times_out() {
        let (mut client, _server) = tokio::io::duplex(64);
        let err = read_to_quiescence(&mut client, 16, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Timeout {
                phase: Phase::Read,
                ..
            }
        ));
    }
}
