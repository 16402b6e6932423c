//! Framed message IO over any async byte stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, Result};
use crate::protocol::{FrameHeader, NetworkMessage, HEADER_LEN};

/// Read one complete message.
///
/// The header is validated before any payload byte is read, so a frame from
/// another protocol version is rejected without touching its body.
///
/// # Errors
///
/// Returns [`NetError::ConnectionClosed`] on a clean EOF before a header,
/// any header validation error, or [`NetError::Codec`] for a bad payload.
pub async fn read_message<R>(reader: &mut R) -> Result<NetworkMessage>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header_bytes)
        .await
        .map_err(map_eof)?;
    let header = FrameHeader::decode(&header_bytes)?;

    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;
    NetworkMessage::decode(&header, &payload)
}

/// Write one complete message and flush it.
///
/// # Errors
///
/// Returns encoding errors or [`NetError::Io`].
pub async fn write_message<W>(writer: &mut W, message: &NetworkMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn map_eof(err: std::io::Error) -> NetError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        NetError::ConnectionClosed
    } else {
        NetError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageKind, PROTOCOL_VERSION};

    #[tokio::test]
    async fn test_messages_survive_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = vec![
            NetworkMessage::Hello { name: "alpha".into() },
            NetworkMessage::TickAck {
                tick: 9,
                checksum: 0x1234_5678,
            },
            NetworkMessage::Goodbye,
        ];
        for message in &sent {
            write_message(&mut a, message).await.unwrap();
        }
        for message in &sent {
            assert_eq!(&read_message(&mut b).await.unwrap(), message);
        }
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_message(&mut b).await,
            Err(NetError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_foreign_version_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = FrameHeader::new(MessageKind::Hello, 4).encode();
        header[0..2].copy_from_slice(&(PROTOCOL_VERSION + 1).to_be_bytes());
        a.write_all(&header).await.unwrap();
        a.write_all(&[1, 2, 3, 4]).await.unwrap();
        assert!(matches!(
            read_message(&mut b).await,
            Err(NetError::ProtocolMismatch { .. })
        ));
    }
}
