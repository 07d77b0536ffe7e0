//! Parameter and column values.
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use std::{fmt, io, pin::Pin};

/// Data transmission format of a parameter.
///
/// Text and binary both travel as bytes on the wire; the format tag decides
/// how a payload is carried inside a descriptor and which frame kind a large
/// payload is sent as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgFormat {
    Text,
    Binary,
}

impl PgFormat {
    /// Wire name of the format, used as the descriptor `type` tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            PgFormat::Text => "text",
            PgFormat::Binary => "binary",
        }
    }
}

impl serde::Serialize for PgFormat {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// A finite lazy byte sequence with a known length.
///
/// The declared length decides whether the parameter rides inside the
/// descriptor or in its own frame; the stream itself is consumed exactly once
/// on send.
pub struct ByteStream {
    len: usize,
    inner: Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>,
}

impl ByteStream {
    /// Wrap a stream of chunks declared to total `len` bytes.
    pub fn new(len: usize, stream: impl Stream<Item = io::Result<Bytes>> + Send + 'static) -> ByteStream {
        ByteStream { len, inner: Box::pin(stream) }
    }

    /// Single chunk stream over a buffer.
    pub fn from_bytes(data: impl Into<Bytes>) -> ByteStream {
        let data = data.into();
        ByteStream {
            len: data.len(),
            inner: Box::pin(futures_util::stream::once(std::future::ready(Ok(data)))),
        }
    }

    /// Declared byte length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drain the stream into one buffer.
    pub(crate) async fn collect(mut self) -> io::Result<Bytes> {
        use futures_util::StreamExt;

        let mut buf = BytesMut::with_capacity(self.len);
        while let Some(chunk) = self.inner.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub(crate) fn into_inner(self) -> Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>> {
        self.inner
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream").field("len", &self.len).finish_non_exhaustive()
    }
}

/// Raw statement parameter, ready for frame encoding.
#[derive(Debug)]
pub enum ParamValue {
    /// Nullable text string.
    Text(Option<String>),
    /// Byte array. Text can arrive as bytes, hence the explicit format tag.
    Bytes { data: Bytes, format: PgFormat },
    /// Bounded byte stream with a known length.
    Stream { data: ByteStream, format: PgFormat },
}

/// A statement parameter or decoded column value.
#[derive(Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    Json(serde_json::Value),
    Timestamp(time::OffsetDateTime),
    /// Text carried as a bounded byte stream.
    TextStream(ByteStream),
    /// Binary carried as a bounded byte stream.
    ByteStream(ByteStream),
}

impl Value {
    /// Bounded stream parameter tagged with a format.
    pub fn stream(format: PgFormat, stream: ByteStream) -> Value {
        match format {
            PgFormat::Text => Value::TextStream(stream),
            PgFormat::Binary => Value::ByteStream(stream),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            // streams are consumed once and never compare equal
            _ => false,
        }
    }
}

macro_rules! value_from {
    (<$ty:ty>$variant:ident) => {
        impl From<$ty> for Value {
            fn from(value: $ty) -> Value {
                Value::$variant(value.into())
            }
        }
    };
}

value_from!(<bool>Bool);
value_from!(<i16>Int);
value_from!(<i32>Int);
value_from!(<i64>Int);
value_from!(<f32>Float);
value_from!(<f64>Float);
value_from!(<&str>Text);
value_from!(<String>Text);
value_from!(<Bytes>Bytes);
value_from!(<Vec<u8>>Bytes);
value_from!(<serde_json::Value>Json);
value_from!(<time::OffsetDateTime>Timestamp);

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Value {
        match value {
            Some(value) => value.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn collect_stream() {
        let chunks = ["he", "llo"].map(|c|Ok(Bytes::from_static(c.as_bytes())));
        let stream = ByteStream::new(5, futures_util::stream::iter(chunks));
        assert_eq!(stream.len(), 5);
        assert_eq!(stream.collect().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn from_option() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some(42)), Value::Int(42));
    }
}
