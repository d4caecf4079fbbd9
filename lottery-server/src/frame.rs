//! Length-prefixed framing over a byte stream.
//!
//! A frame is a 2-byte big-endian length followed by that many payload
//! bytes. The helpers here hide partial reads and writes; they know nothing
//! about what the payload means.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LENGTH_PREFIX: usize = 2;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed by peer")]
    Closed,
    #[error("connection broken: write made no progress")]
    Broken,
    #[error("payload of {len} bytes does not fit in a frame (max {max})", max = MAX_PAYLOAD)]
    TooLarge { len: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reads exactly `n` bytes, looping over short reads.
pub async fn read_exact<R>(reader: &mut R, n: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => return Err(FrameError::Closed),
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(buf)
}

/// Writes every byte of `bytes`, looping over short writes, then flushes.
pub async fn write_all<W>(writer: &mut W, bytes: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < bytes.len() {
        match writer.write(&bytes[written..]).await {
            Ok(0) => return Err(FrameError::Broken),
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Reads one frame and returns its raw payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let header = read_exact(reader, LENGTH_PREFIX).await?;
    let len = u16::from_be_bytes([header[0], header[1]]) as usize;
    read_exact(reader, len).await
}

/// Writes `payload` as a single frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(payload.len())
        .map_err(|_| FrameError::TooLarge { len: payload.len() })?;

    let mut encoded = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    encoded.extend_from_slice(&len.to_be_bytes());
    encoded.extend_from_slice(payload);
    write_all(writer, &encoded).await
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use super::*;

    /// Accepts writes but never takes a byte.
    struct StalledWriter;

    impl AsyncWrite for StalledWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(0))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn frame_survives_split_delivery() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let sender = tokio::spawn(async move {
            // Deliver the header and payload in small pieces.
            for chunk in [&b"\x00"[..], &b"\x05"[..], &b"he"[..], &b"llo"[..]] {
                client.write_all(chunk).await.expect("write chunk");
                client.flush().await.expect("flush chunk");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            client
        });

        let payload = read_frame(&mut server).await.expect("read frame");
        assert_eq!(payload, b"hello");
        drop(sender.await.expect("sender task"));
    }

    #[tokio::test]
    async fn peer_closing_mid_frame_is_reported() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 10, b'a', b'b']).await.expect("write");
        drop(client);

        let err = read_frame(&mut server).await.expect_err("frame is incomplete");
        assert!(matches!(err, FrameError::Closed));
    }

    #[tokio::test]
    async fn write_frame_prefixes_big_endian_length() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let payload = vec![b'x'; 300];

        write_frame(&mut client, &payload).await.expect("write frame");
        let header = read_exact(&mut server, 2).await.expect("read header");
        assert_eq!(header, vec![0x01, 0x2c]);
        let body = read_exact(&mut server, 300).await.expect("read body");
        assert_eq!(body, payload);
    }

    #[tokio::test]
    async fn oversized_payload_is_refused() {
        let (mut client, _server) = tokio::io::duplex(16);
        let payload = vec![0u8; MAX_PAYLOAD + 1];

        let err = write_frame(&mut client, &payload)
            .await
            .expect_err("payload too large");
        assert!(matches!(err, FrameError::TooLarge { len } if len == MAX_PAYLOAD + 1));
    }

    #[tokio::test]
    async fn write_without_progress_is_broken() {
        let err = write_all(&mut StalledWriter, b"2,0\n")
            .await
            .expect_err("nothing was written");
        assert!(matches!(err, FrameError::Broken));

        let err = write_frame(&mut StalledWriter, b"ALL_SENT")
            .await
            .expect_err("nothing was written");
        assert!(matches!(err, FrameError::Broken));
    }

    #[tokio::test]
    async fn empty_frame_is_valid() {
        let (mut client, mut server) = tokio::io::duplex(16);
        write_frame(&mut client, b"").await.expect("write frame");
        let payload = read_frame(&mut server).await.expect("read frame");
        assert!(payload.is_empty());
    }
}
