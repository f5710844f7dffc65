//! Frame I/O over async byte streams: 4-byte BE length, then the payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use voodoo_core::wire::{encode_frame, frame_len, FrameError};

/// Stream failure. Any of these ends the connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
}

impl TransportError {
    /// Peer closed the stream between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, TransportError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Read one whole frame and return its payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = frame_len(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write an already framed buffer.
pub async fn write_raw<W>(writer: &mut W, frame: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Frame `payload` and write it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    write_raw(writer, &frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use voodoo_core::wire::MAX_FRAME_LEN;

    #[tokio::test]
    async fn frames_roundtrip_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        write_frame(&mut a, b"third").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap(), b"");
        assert_eq!(read_frame(&mut b).await.unwrap(), b"third");
    }

    #[tokio::test]
    async fn eof_between_frames() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN + 1).to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::Frame(FrameError::TooLarge))
        ));
    }
}
