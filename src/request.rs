//! The remote call request: a correlation tag followed by a message.

use crate::protocol::{DecodeError, Value, ValueReader};
use std::fmt;
use tokio::io::AsyncRead;

/// Correlation tag sent by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    Text(String),
    Bytes(Vec<u8>),
    /// Any other value kind; the call is traced untagged.
    Invalid(&'static str),
}

impl From<Value> for Tag {
    fn from(value: Value) -> Self {
        match value {
            Value::Text(text) => Tag::Text(text),
            Value::Bytes(bytes) => Tag::Bytes(bytes),
            other => Tag::Invalid(other.kind()),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Text(text) => f.write_str(text),
            Tag::Bytes(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Tag::Invalid(kind) => write!(f, "<{kind}>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub tag: Tag,
    pub message: String,
}

impl IncomingRequest {
    /// Read the tag and then the message from the stream.
    pub async fn read_from<R>(reader: &mut ValueReader<R>) -> Result<Self, DecodeError>
    where
        R: AsyncRead + Unpin,
    {
        let tag = Tag::from(reader.read_value().await?);
        let message = match reader.read_value().await? {
            Value::Text(message) => message,
            other => {
                return Err(DecodeError::UnexpectedType {
                    expected: "text",
                    found: other.kind(),
                })
            }
        };

        Ok(IncomingRequest { tag, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;
    use bytes::BytesMut;
    use tokio_test::io::Builder;

    fn stream_of(values: &[Value]) -> tokio_test::io::Mock {
        let mut buf = BytesMut::new();
        for value in values {
            encode(value, &mut buf).unwrap();
        }
        Builder::new().read(&buf).build()
    }

    #[test]
    fn test_tag_from_value() {
        assert_eq!(Tag::from(Value::Text("abc".into())), Tag::Text("abc".into()));
        assert_eq!(Tag::from(Value::Bytes(vec![1, 2])), Tag::Bytes(vec![1, 2]));
        assert_eq!(Tag::from(Value::Null), Tag::Invalid("null"));
        assert_eq!(Tag::from(Value::Int(7)), Tag::Invalid("int"));
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(Tag::Text("abc123".into()).to_string(), "abc123");
        assert_eq!(Tag::Bytes(vec![0x0a, 0xff]).to_string(), "0aff");
        assert_eq!(Tag::Invalid("int").to_string(), "<int>");
    }

    #[tokio::test]
    async fn test_read_text_tag() {
        let mut reader = ValueReader::new(stream_of(&[
            Value::Text("abc123".into()),
            Value::Text("hello".into()),
        ]));

        let request = IncomingRequest::read_from(&mut reader).await.unwrap();
        assert_eq!(request.tag, Tag::Text("abc123".into()));
        assert_eq!(request.message, "hello");
    }

    #[tokio::test]
    async fn test_read_invalid_tag_is_not_an_error() {
        let mut reader = ValueReader::new(stream_of(&[Value::Int(42), Value::Text("hi".into())]));

        let request = IncomingRequest::read_from(&mut reader).await.unwrap();
        assert_eq!(request.tag, Tag::Invalid("int"));
        assert_eq!(request.message, "hi");
    }

    #[tokio::test]
    async fn test_message_must_be_text() {
        let mut reader = ValueReader::new(stream_of(&[
            Value::Text("abc".into()),
            Value::Bytes(b"hello".to_vec()),
        ]));

        match IncomingRequest::read_from(&mut reader).await {
            Err(DecodeError::UnexpectedType {
                expected: "text",
                found: "bytes",
            }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_message() {
        let mut reader = ValueReader::new(stream_of(&[Value::Text("abc".into())]));

        assert!(matches!(
            IncomingRequest::read_from(&mut reader).await,
            Err(DecodeError::Truncated { buffered: 0 })
        ));
    }
}
