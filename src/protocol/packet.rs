//! Low-level frame I/O
//!
//! Every message travels as one frame: a 4-byte little-endian payload length
//! followed by the bincode payload.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, TwoPcError};
use super::constants::{FRAME_HEADER_LEN, MAX_FRAME_LEN};

/// Reads and writes length-prefixed frames on a byte stream
pub struct PacketIO<S = TcpStream> {
    stream: S,
}

impl<S> PacketIO<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Read one frame and return its payload
    pub async fn read_packet(&mut self) -> Result<BytesMut> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.stream.read_exact(&mut header).await?;

        let payload_len = u32::from_le_bytes(header) as usize;
        if payload_len > MAX_FRAME_LEN {
            return Err(TwoPcError::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                payload_len, MAX_FRAME_LEN
            )));
        }

        let mut payload = BytesMut::zeroed(payload_len);
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Write one frame
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(TwoPcError::Protocol(format!(
                "refusing to send {} byte frame, limit is {}",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.put_u32_le(payload.len() as u32);
        frame.put_slice(payload);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read a frame and decode it as `T`
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Result<T> {
        let payload = self.read_packet().await?;
        bincode::deserialize(&payload)
            .map_err(|e| TwoPcError::Protocol(format!("malformed message: {}", e)))
    }

    /// Encode `message` and write it as one frame
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let payload = bincode::serialize(message)?;
        self.write_packet(&payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frame_layout() {
        let (client, mut server) = duplex(1024);
        let mut io = PacketIO::new(client);
        io.write_packet(b"hello").await.unwrap();

        let mut raw = [0u8; 9];
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw[..4], &5u32.to_le_bytes());
        assert_eq!(&raw[4..], b"hello");
    }

    #[tokio::test]
    async fn test_read_back_frames() {
        let (client, server) = duplex(1024);
        let mut writer = PacketIO::new(client);
        let mut reader = PacketIO::new(server);

        writer.write_packet(b"one").await.unwrap();
        writer.write_packet(b"").await.unwrap();
        assert_eq!(&reader.read_packet().await.unwrap()[..], b"one");
        assert!(reader.read_packet().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, server) = duplex(64);
        let mut reader = PacketIO::new(server);
        client
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes())
            .await
            .unwrap();

        let err = reader.read_packet().await.unwrap_err();
        assert!(matches!(err, TwoPcError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_io_error() {
        let (mut client, server) = duplex(64);
        let mut reader = PacketIO::new(server);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let err = reader.read_packet().await.unwrap_err();
        assert!(matches!(err, TwoPcError::Io(_)));
    }
}
