//! Length-prefixed framing for byte streams.
//!
//! Every message travels as one frame:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length excludes the prefix itself. The same size cap is enforced on
//! both sides: the sender refuses to enqueue an oversized payload and the
//! receiver refuses to allocate for an oversized length prefix.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum payload size: 16 KiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024;

/// Size cap shared by the reader and the writer of a stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes.
    pub max_message_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl FrameConfig {
    /// Check a payload length against the cap without touching any stream.
    pub fn check_len(&self, len: usize) -> Result<(), FrameError> {
        match u32::try_from(len) {
            Ok(size) if size <= self.max_message_size => Ok(()),
            _ => Err(FrameError::Oversized {
                size: len,
                max: self.max_message_size,
            }),
        }
    }
}

/// Errors that can occur while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload is larger than the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    Oversized {
        /// Actual payload size.
        size: usize,
        /// Configured maximum.
        max: u32,
    },

    /// The peer closed the stream, either cleanly or mid-frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read one frame and return its payload.
///
/// Waits until the whole frame is buffered. A length prefix above the cap is
/// rejected before the payload buffer is allocated.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(eof_as_closed)?;

    let len = u32::from_le_bytes(len_buf) as usize;
    config.check_len(len)?;

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await.map_err(eof_as_closed)?;
    }
    Ok(payload)
}

/// Write one frame and flush the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    encode_frame(writer, payload, config).await?;
    writer.flush().await?;
    Ok(())
}

/// Write several frames back to back, in order, with a single flush at the end.
///
/// Used by the send loop to drain a whole outbound queue in one go.
pub async fn write_frames<W, I>(
    writer: &mut W,
    payloads: I,
    config: &FrameConfig,
) -> Result<usize, FrameError>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut written = 0;
    for payload in payloads {
        encode_frame(writer, payload.as_ref(), config).await?;
        written += 1;
    }
    writer.flush().await?;
    Ok(written)
}

async fn encode_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    config.check_len(payload.len())?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frames_arrive_separately_and_in_order() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        write_frames(&mut client, [b"aaa", b"bbb", b"ccc"], &config)
            .await
            .unwrap();

        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"aaa");
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"bbb");
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"ccc");
    }

    #[tokio::test]
    async fn test_partial_reads_reassemble_frame() {
        // An 8-byte pipe forces the payload through in several chunks.
        let (mut client, mut server) = duplex(8);
        let config = FrameConfig::default();
        let payload = b"a payload longer than the pipe buffer";

        let writer = tokio::spawn(async move {
            write_frame(&mut client, payload, &config).await.unwrap();
        });

        let received = read_frame(&mut server, &config).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected_before_allocation() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig {
            max_message_size: 16,
        };

        client.write_all(&4096u32.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, &config).await;
        assert!(matches!(
            result,
            Err(FrameError::Oversized { size: 4096, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected_on_write() {
        let (mut client, _server) = duplex(8192);
        let config = FrameConfig {
            max_message_size: 16,
        };

        let result = write_frame(&mut client, &[0u8; 17], &config).await;
        assert!(matches!(result, Err(FrameError::Oversized { .. })));
    }

    #[tokio::test]
    async fn test_payload_at_exact_cap_accepted() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig {
            max_message_size: 16,
        };

        write_frame(&mut client, &[7u8; 16], &config).await.unwrap();
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), [7u8; 16]);
    }

    #[tokio::test]
    async fn test_empty_frame_is_valid() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        write_frame(&mut client, &[], &config).await.unwrap();
        assert!(read_frame(&mut server, &config).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_mid_frame_reports_connection_closed() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let result = read_frame(&mut server, &config).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_length_prefix_is_little_endian() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig::default();

        write_frame(&mut client, b"hello", &config).await.unwrap();

        let mut raw = [0u8; 9];
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw[..4], &[5, 0, 0, 0]);
        assert_eq!(&raw[4..], b"hello");
    }

    #[test]
    fn test_check_len_boundaries() {
        let config = FrameConfig {
            max_message_size: 4,
        };
        assert!(config.check_len(0).is_ok());
        assert!(config.check_len(4).is_ok());
        assert!(config.check_len(5).is_err());
    }
}
