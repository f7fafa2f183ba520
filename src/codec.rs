use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::command::Command;
use crate::config::Config;
use crate::connection::Error;
use crate::frame::{Frame, ParseCursor, DEFAULT_MAX_DEPTH};

/// Decodes replies and encodes commands.
///
/// `max_frame_size` bounds both a decoded frame and the incomplete input buffered while waiting
/// for the rest of one.
pub struct FrameCodec {
    max_frame_size: usize,
    max_depth: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec {
            max_frame_size,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_config(config: &Config) -> FrameCodec {
        FrameCodec {
            max_frame_size: config.max_frame_size,
            max_depth: config.max_nesting_depth,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn too_large(&self, size: usize) -> Error {
        warn!(size, max = self.max_frame_size, "frame size exceeds limit");
        Error::FrameTooLarge {
            size,
            max: self.max_frame_size,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::with_config(&Config::default())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cursor = ParseCursor::over(src).with_max_depth(self.max_depth);

        if !cursor.try_parse(src)? {
            // A frame that still is not complete past the limit is either hostile or a sign that
            // the stream is desynchronized.
            if src.len() > self.max_frame_size {
                return Err(self.too_large(src.len()));
            }
            return Ok(None);
        }

        if cursor.offset() > self.max_frame_size {
            return Err(self.too_large(cursor.offset()));
        }

        // Remove the parsed frame from the buffer.
        src.advance(cursor.offset());

        Ok(cursor.take_result())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&frame.serialize());
        Ok(())
    }
}

impl Encoder<&Command> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, command: &Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&command.to_bytes());
        Ok(())
    }
}
