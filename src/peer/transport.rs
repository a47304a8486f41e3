use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN, MAX_FRAME_LEN};

/// A peer silent for this long is dead.
pub const READ_TIMEOUT: Duration = Duration::from_secs(120);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handshake-phase transport owning the whole stream.
///
/// After the handshake the stream splits into a [`FrameReader`] and
/// [`FrameWriter`] so the connection task can pump reads and writes from
/// one select loop.
pub struct PeerTransport {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl PeerTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        let data = handshake.encode();
        timeout(WRITE_TIMEOUT, self.stream.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        while self.read_buf.len() < HANDSHAKE_LEN {
            let n = timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| PeerError::Timeout)??;

            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }

        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    /// Splits into framed halves, carrying over any bytes already buffered.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            FrameReader {
                half: read_half,
                buf: self.read_buf,
            },
            FrameWriter { half: write_half },
        )
    }
}

/// Reads length-prefixed frames from the peer.
pub struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    /// Reads the next recognized message.
    ///
    /// Frames with unknown ids are consumed and skipped. Oversized frames
    /// (beyond [`MAX_FRAME_LEN`]) are a protocol violation. Returns
    /// [`PeerError::Timeout`] after two minutes of silence.
    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        loop {
            while self.buf.len() < 4 {
                self.fill().await?;
            }

            let length =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;

            if 4 + length > MAX_FRAME_LEN {
                return Err(PeerError::InvalidMessage(format!(
                    "frame too large: {} bytes",
                    length
                )));
            }

            while self.buf.len() < 4 + length {
                self.fill().await?;
            }

            let frame = self.buf.split_to(4 + length);
            if let Some(message) = Message::decode(frame.freeze())? {
                return Ok(message);
            }
            // Unknown id: frame consumed, keep reading.
        }
    }

    async fn fill(&mut self) -> Result<(), PeerError> {
        let n = timeout(READ_TIMEOUT, self.half.read_buf(&mut self.buf))
            .await
            .map_err(|_| PeerError::Timeout)??;

        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        Ok(())
    }
}

/// Writes framed messages to the peer.
pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        let data = message.encode();
        timeout(WRITE_TIMEOUT, self.half.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }
}
