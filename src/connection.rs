use std::io;

use bytes::BytesMut;
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::command::Command;
use crate::config::Config;
use crate::frame::{self, Frame};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] frame::Error),
    #[error("protocol error; frame size {size} exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A byte stream to a server plus the buffer its replies are decoded from.
///
/// Any `AsyncRead + AsyncWrite` works: a `TcpStream`, a TLS stream, or an in-memory duplex in
/// tests. Opening the stream is the caller's business.
pub struct Connection<S> {
    id: Uuid,
    stream: S,
    // Data is read from the socket into the read buffer. When a frame is parsed, the corresponding
    // data is removed from the buffer.
    buffer: BytesMut,
    codec: FrameCodec,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Connection<S> {
        Connection::with_config(stream, &Config::default())
    }

    pub fn with_config(stream: S, config: &Config) -> Connection<S> {
        let id = Uuid::new_v4();
        debug!(connection_id = %id, "connection opened");

        Connection {
            id,
            stream,
            buffer: BytesMut::with_capacity(config.read_buffer_capacity),
            codec: FrameCodec::with_config(config),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Writes every command back to back with a single flush.
    pub async fn write_commands<'a, I>(&mut self, commands: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = &'a Command>,
    {
        let mut out = BytesMut::new();
        let mut count = 0;
        for command in commands {
            self.codec.encode(command, &mut out)?;
            count += 1;
        }

        debug!(connection_id = %self.id, count, bytes = out.len(), "writing commands");
        self.write_all(&out).await
    }

    pub async fn write_command(&mut self, command: &Command) -> Result<(), Error> {
        self.write_commands([command]).await
    }

    /// Reads one frame, waiting for more bytes as long as the buffered ones are not enough.
    ///
    /// `Ok(None)` means the peer closed the stream cleanly between frames.
    #[instrument(level = "trace", skip(self), fields(connection_id = %self.id))]
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                debug!(%frame, "received frame");
                return Ok(Some(frame));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    debug!("connection closed");
                    Ok(None)
                } else {
                    Err(Error::ConnectionReset)
                };
            }
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
