// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::Buf;
use bytes::Bytes;
use std::io::Cursor;
use std::string::FromUtf8Error;
use thiserror::Error as ThisError;

pub(crate) static CRLF: &[u8; 2] = b"\r\n";

/// How many array levels a frame may nest unless the cursor is told otherwise.
pub const DEFAULT_MAX_DEPTH: usize = 512;

#[derive(Debug, ThisError, PartialEq)]
pub enum Error {
    /// Not an error from the caller's point of view: `ParseCursor::try_parse` turns it into
    /// `Ok(false)` and it never escapes this module.
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("protocol error; invalid frame data type: {0:#04x}")]
    InvalidDataType(u8),
    #[error("protocol error; invalid length token {0:?}")]
    InvalidLength(String),
    #[error("protocol error; invalid integer {0:?}")]
    InvalidInteger(String),
    #[error("protocol error; expected CRLF after bulk payload")]
    MissingTerminator,
    #[error("protocol error; invalid frame format")]
    InvalidUtf8,
    #[error("protocol error; arrays nested deeper than {0} levels")]
    NestingTooDeep(usize),
}

impl Error {
    /// Corrupt-protocol errors mean the byte stream is desynchronized and the connection that
    /// produced it must be dropped.
    pub fn is_corrupt(&self) -> bool {
        !matches!(self, Error::Incomplete)
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        Error::InvalidUtf8
    }
}

/// A decoded RESP2 value. Null and empty are distinct at every level: `NullBulk` is not
/// `Bulk("")` and `NullArray` is not `Array(vec![])`.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    NullBulk,
    Array(Vec<Frame>),
    NullArray,
}

/// Working state for decoding one frame out of a growing buffer.
///
/// The cursor addresses the window `buffer[offset..offset + length]`. A successful
/// [`ParseCursor::try_parse`] advances `offset` and shrinks `length` by exactly the bytes of the
/// decoded frame. An unsuccessful one leaves both untouched, so the caller can append bytes,
/// call [`ParseCursor::feed`] and retry from the same position.
#[derive(Debug)]
pub struct ParseCursor {
    offset: usize,
    length: usize,
    max_depth: usize,
    result: Option<Frame>,
    completed: bool,
}

impl Default for ParseCursor {
    fn default() -> Self {
        ParseCursor::new(0, 0)
    }
}

impl ParseCursor {
    pub fn new(offset: usize, length: usize) -> ParseCursor {
        ParseCursor {
            offset,
            length,
            max_depth: DEFAULT_MAX_DEPTH,
            result: None,
            completed: false,
        }
    }

    /// Caps how many array levels a frame may nest. Deeper input is rejected as corrupt instead
    /// of being decoded recursively.
    pub fn with_max_depth(mut self, max_depth: usize) -> ParseCursor {
        self.max_depth = max_depth;
        self
    }

    /// A cursor covering the whole of `buffer`.
    pub fn over(buffer: &[u8]) -> ParseCursor {
        ParseCursor::new(0, buffer.len())
    }

    /// Extends the window after the caller appended `additional` bytes to the buffer.
    pub fn feed(&mut self, additional: usize) {
        self.length += additional;
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn result(&self) -> Option<&Frame> {
        self.result.as_ref()
    }

    /// Takes the decoded frame out and re-arms the cursor for the next frame at the current
    /// offset.
    pub fn take_result(&mut self) -> Option<Frame> {
        self.completed = false;
        self.result.take()
    }

    /// Attempts to decode exactly one frame from the cursor's window of `buffer`.
    ///
    /// Returns `Ok(true)` when a frame was decoded, `Ok(false)` when more bytes are needed, and
    /// `Err` for corrupt input. Panics if the window reaches past the end of `buffer`.
    pub fn try_parse(&mut self, buffer: &[u8]) -> Result<bool, Error> {
        let end = self.offset + self.length;
        assert!(
            end <= buffer.len(),
            "parse window {}..{} exceeds buffer of {} bytes",
            self.offset,
            end,
            buffer.len()
        );

        let mut src = Cursor::new(&buffer[..end]);
        src.set_position(self.offset as u64);

        match Frame::parse(&mut src, 0, self.max_depth) {
            Ok(frame) => {
                let position = src.position() as usize;
                self.length -= position - self.offset;
                self.offset = position;
                self.result = Some(frame);
                self.completed = true;
                Ok(true)
            }
            Err(Error::Incomplete) => {
                self.completed = false;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    /// Parses one frame starting at the cursor position, `depth` arrays deep. On
    /// `Err(Incomplete)` the cursor position is meaningless and must be reset by the caller.
    fn parse(src: &mut Cursor<&[u8]>, depth: usize, max_depth: usize) -> Result<Self, Error> {
        // The first byte in an RESP-serialized payload always identifies its type.
        // Subsequent bytes constitute the type's contents.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => {
                let line = get_line(src)?.to_vec();
                Ok(Frame::Simple(String::from_utf8(line)?))
            }
            DataType::SimpleError => {
                let line = get_line(src)?.to_vec();
                Ok(Frame::Error(String::from_utf8(line)?))
            }
            DataType::Integer => {
                let line = get_line(src)?;
                Ok(Frame::Integer(parse_integer(line)?))
            }
            // $<length>\r\n<data>\r\n
            DataType::BulkString => {
                let length = match get_length(src)? {
                    Some(length) => length,
                    None => return Ok(Frame::NullBulk),
                };

                if src.remaining() < length + CRLF.len() {
                    return Err(Error::Incomplete);
                }

                let start = src.position() as usize;
                let data = &src.get_ref()[start..start + length];
                if &src.get_ref()[start + length..start + length + CRLF.len()] != CRLF {
                    return Err(Error::MissingTerminator);
                }
                let data = Bytes::copy_from_slice(data);
                src.advance(length + CRLF.len());

                Ok(Frame::Bulk(data))
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array => {
                let length = match get_length(src)? {
                    Some(length) => length,
                    None => return Ok(Frame::NullArray),
                };

                if length > 0 && depth >= max_depth {
                    return Err(Error::NestingTooDeep(max_depth));
                }

                // Every element takes at least three bytes, so the remaining input bounds how
                // much is worth reserving up front.
                let mut frames = Vec::with_capacity(length.min(src.remaining() / 3));
                for _ in 0..length {
                    frames.push(Self::parse(src, depth + 1, max_depth)?);
                }

                Ok(Frame::Array(frames))
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes);
        bytes
    }

    fn write_to(&self, bytes: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                bytes.push(u8::from(DataType::SimpleString));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Frame::Error(s) => {
                bytes.push(u8::from(DataType::SimpleError));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Frame::Integer(i) => {
                bytes.push(u8::from(DataType::Integer));
                bytes.extend_from_slice(i.to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
            }
            Frame::Bulk(data) => {
                bytes.push(u8::from(DataType::BulkString));
                bytes.extend_from_slice(data.len().to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(CRLF);
            }
            Frame::NullBulk => {
                bytes.push(u8::from(DataType::BulkString));
                bytes.extend_from_slice(b"-1");
                bytes.extend_from_slice(CRLF);
            }
            Frame::Array(arr) => {
                bytes.push(u8::from(DataType::Array));
                bytes.extend_from_slice(arr.len().to_string().as_bytes());
                bytes.extend_from_slice(CRLF);
                for frame in arr {
                    frame.write_to(bytes);
                }
            }
            Frame::NullArray => {
                bytes.push(u8::from(DataType::Array));
                bytes.extend_from_slice(b"-1");
                bytes.extend_from_slice(CRLF);
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Frame::NullBulk | Frame::NullArray)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Short type name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Simple(_) => "simple string",
            Frame::Error(_) => "error",
            Frame::Integer(_) => "integer",
            Frame::Bulk(_) => "bulk string",
            Frame::NullBulk => "null bulk string",
            Frame::Array(_) => "array",
            Frame::NullArray => "null array",
        }
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::NullBulk => write!(f, "$-1"),
            Frame::Array(arr) => {
                write!(f, "*{}", arr.len())?;
                for frame in arr {
                    write!(f, " {}", frame)?;
                }
                Ok(())
            }
            Frame::NullArray => write!(f, "*-1"),
        }
    }
}

/// Returns the bytes up to (not including) the next CRLF and moves the cursor past it.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buffer: &'a [u8] = *src.get_ref();

    let line_end = buffer[start..]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(Error::Incomplete)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&buffer[start..line_end])
}

/// Reads a length line. `-1` is the null marker and yields `None`.
fn get_length(src: &mut Cursor<&[u8]>) -> Result<Option<usize>, Error> {
    let line = get_line(src)?;
    let invalid = || Error::InvalidLength(String::from_utf8_lossy(line).into_owned());

    let length = std::str::from_utf8(line)
        .map_err(|_| invalid())?
        .parse::<i64>()
        .map_err(|_| invalid())?;

    match length {
        -1 => Ok(None),
        length if length >= 0 => usize::try_from(length).map(Some).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn parse_integer(line: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::InvalidInteger(String::from_utf8_lossy(line).into_owned()))
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::Array => b'*',
        }
    }
}
