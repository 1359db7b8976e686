//! Single-message framing over a local connection.
//!
//! One frame per connection: a 4-byte big-endian length followed by that many
//! bytes of UTF-8. The sender shuts down its write half after the frame.

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single payload. Paths are far shorter than this.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no complete message within {0:?}")]
    Timeout(Duration),

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_MESSAGE_BYTES)]
    TooLarge(usize),

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the wire representation of `text`.
pub fn encode(text: &str) -> Result<Bytes, ChannelError> {
    let payload = text.as_bytes();
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(ChannelError::TooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Write one frame, flush, and close the write half, all within `timeout`.
pub async fn send<S>(conn: &mut S, text: &str, timeout: Duration) -> Result<(), ChannelError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(text)?;
    let write = async {
        conn.write_all(&frame).await?;
        conn.flush().await?;
        conn.shutdown().await?;
        Ok::<(), std::io::Error>(())
    };
    tokio::time::timeout(timeout, write)
        .await
        .map_err(|_| ChannelError::Timeout(timeout))??;
    Ok(())
}

/// Read exactly one frame. Anything short of a complete, valid frame within
/// `timeout` is an error the caller treats as "no message".
pub async fn receive<S>(conn: &mut S, timeout: Duration) -> Result<String, ChannelError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    tokio::time::timeout(timeout, read_frame(conn))
        .await
        .map_err(|_| ChannelError::Timeout(timeout))?
}

async fn read_frame<S>(conn: &mut S) -> Result<String, ChannelError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    read_full(conn, &mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(ChannelError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    read_full(conn, &mut payload).await?;
    String::from_utf8(payload).map_err(|_| ChannelError::InvalidUtf8)
}

async fn read_full<S>(conn: &mut S, buf: &mut [u8]) -> Result<(), ChannelError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    match conn.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ChannelError::Truncated),
        Err(e) => Err(ChannelError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn delivers_one_path() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        send(&mut client, "/data/photos", WAIT).await.unwrap();
        assert_eq!(receive(&mut server, WAIT).await.unwrap(), "/data/photos");
    }

    #[tokio::test]
    async fn empty_payload_is_a_valid_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        send(&mut client, "", WAIT).await.unwrap();
        assert_eq!(receive(&mut server, WAIT).await.unwrap(), "");
    }

    #[tokio::test]
    async fn connection_closed_without_frame_is_truncated() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(matches!(
            receive(&mut server, WAIT).await,
            Err(ChannelError::Truncated)
        ));
    }

    #[tokio::test]
    async fn short_payload_is_truncated() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"/data").await.unwrap();
        drop(client);
        assert!(matches!(
            receive(&mut server, WAIT).await,
            Err(ChannelError::Truncated)
        ));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let err = receive(&mut server, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }

    #[tokio::test]
    async fn oversized_header_is_rejected_before_reading_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(
            receive(&mut server, WAIT).await,
            Err(ChannelError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn invalid_utf8_is_dropped() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&2u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0xff, 0xfe]).await.unwrap();
        assert!(matches!(
            receive(&mut server, WAIT).await,
            Err(ChannelError::InvalidUtf8)
        ));
    }

    #[test]
    fn encode_prefixes_length() {
        let frame = encode("abc").unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
        assert!(matches!(
            encode(&"x".repeat(MAX_MESSAGE_BYTES + 1)),
            Err(ChannelError::TooLarge(_))
        ));
    }
}
