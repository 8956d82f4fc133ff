//! Value stream codec used between the remote call client and server.
//!
//! A stream is a plain sequence of self-describing values. Each value is
//! a one byte type code followed by its payload:
//!
//! ```text
//! 0x00 NULL   (no payload)
//! 0x01 TEXT   <len: u32 BE> <len bytes of UTF-8>
//! 0x02 BYTES  <len: u32 BE> <len bytes>
//! 0x03 INT    <i64 BE>
//!
//! Example: TEXT "abc" followed by BYTES [0xff]
//! 01 00 00 00 03 61 62 63 02 00 00 00 01 ff
//! ```
//!
//! The client writes the correlation tag first and the message second.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload a single TEXT or BYTES value may declare.
pub const MAX_VALUE_LEN: usize = 16 * 1024 * 1024;

/// Initial read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

const TYPE_NULL: u8 = 0x00;
const TYPE_TEXT: u8 = 0x01;
const TYPE_BYTES: u8 = 0x02;
const TYPE_INT: u8 = 0x03;

/// A decoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Text(String),
    Bytes(Vec<u8>),
    Int(i64),
}

impl Value {
    /// Short name of the value's kind, used in log lines and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Int(_) => "int",
        }
    }
}

/// Malformed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Type code not in the table above
    UnknownType(u8),
    /// TEXT payload is not valid UTF-8
    InvalidUtf8,
    /// Declared length exceeds `MAX_VALUE_LEN`
    TooLarge(usize),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnknownType(code) => write!(f, "unknown value type 0x{code:02x}"),
            ParseError::InvalidUtf8 => write!(f, "text value is not valid UTF-8"),
            ParseError::TooLarge(len) => {
                write!(f, "value length {len} exceeds limit of {MAX_VALUE_LEN}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed value with bytes consumed.
    Complete(Value, usize),
    /// Need more data.
    Incomplete,
    /// Input can never become a valid value.
    Invalid(ParseError),
}

/// Parse one value from the front of the input buffer.
pub fn parse(input: &[u8]) -> ParseResult {
    let Some((&type_code, mut rest)) = input.split_first() else {
        return ParseResult::Incomplete;
    };

    match type_code {
        TYPE_NULL => ParseResult::Complete(Value::Null, 1),
        TYPE_INT => {
            if rest.len() < 8 {
                return ParseResult::Incomplete;
            }
            ParseResult::Complete(Value::Int(rest.get_i64()), 9)
        }
        TYPE_TEXT | TYPE_BYTES => {
            if rest.len() < 4 {
                return ParseResult::Incomplete;
            }
            let len = rest.get_u32() as usize;
            if len > MAX_VALUE_LEN {
                return ParseResult::Invalid(ParseError::TooLarge(len));
            }
            if rest.len() < len {
                return ParseResult::Incomplete;
            }

            let payload = rest[..len].to_vec();
            let consumed = 1 + 4 + len;
            if type_code == TYPE_BYTES {
                return ParseResult::Complete(Value::Bytes(payload), consumed);
            }
            match String::from_utf8(payload) {
                Ok(text) => ParseResult::Complete(Value::Text(text), consumed),
                Err(_) => ParseResult::Invalid(ParseError::InvalidUtf8),
            }
        }
        other => ParseResult::Invalid(ParseError::UnknownType(other)),
    }
}

/// Append the encoding of `value` to `output`.
///
/// Payloads the parser would reject are refused and nothing is written.
#[cfg_attr(not(test), allow(dead_code))]
pub fn encode(value: &Value, output: &mut BytesMut) -> Result<(), ParseError> {
    match value {
        Value::Null => output.put_u8(TYPE_NULL),
        Value::Text(text) => put_payload(TYPE_TEXT, text.as_bytes(), output)?,
        Value::Bytes(bytes) => put_payload(TYPE_BYTES, bytes, output)?,
        Value::Int(n) => {
            output.put_u8(TYPE_INT);
            output.put_i64(*n);
        }
    }
    Ok(())
}

#[cfg_attr(not(test), allow(dead_code))]
fn put_payload(type_code: u8, payload: &[u8], output: &mut BytesMut) -> Result<(), ParseError> {
    if payload.len() > MAX_VALUE_LEN {
        return Err(ParseError::TooLarge(payload.len()));
    }
    output.reserve(1 + 4 + payload.len());
    output.put_u8(type_code);
    output.put_u32(payload.len() as u32);
    output.extend_from_slice(payload);
    Ok(())
}

/// Errors while reading values off a connection.
#[derive(Debug)]
pub enum DecodeError {
    Io(std::io::Error),
    /// Peer closed the stream before a complete value arrived
    Truncated { buffered: usize },
    Malformed(ParseError),
    /// A value of the wrong kind arrived at this position
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Io(e) => write!(f, "read failed: {e}"),
            DecodeError::Truncated { buffered } => write!(
                f,
                "stream closed before a complete value was received ({buffered} bytes pending)"
            ),
            DecodeError::Malformed(e) => write!(f, "malformed value: {e}"),
            DecodeError::UnexpectedType { expected, found } => {
                write!(f, "expected a {expected} value, got {found}")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Io(e) => Some(e),
            DecodeError::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        DecodeError::Io(e)
    }
}

/// Reads values one at a time from an async byte stream.
pub struct ValueReader<R> {
    inner: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> ValueReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Read the next value, waiting for more bytes as needed.
    pub async fn read_value(&mut self) -> Result<Value, DecodeError> {
        loop {
            match parse(&self.buffer) {
                ParseResult::Complete(value, consumed) => {
                    self.buffer.advance(consumed);
                    return Ok(value);
                }
                ParseResult::Invalid(e) => return Err(DecodeError::Malformed(e)),
                ParseResult::Incomplete => {
                    let n = self.inner.read_buf(&mut self.buffer).await?;
                    if n == 0 {
                        return Err(DecodeError::Truncated {
                            buffered: self.buffer.len(),
                        });
                    }
                }
            }
        }
    }
}
