use std::{
    collections::VecDeque,
    fmt,
    io::{self, Read},
};

use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;

/// Value carried by one message.
///
/// The variant picks the frame kind on the way out and records it on the way in; it is
/// never inferred from the shape of the value.
#[derive(Debug)]
pub enum Payload {
    Data(Value),
    Buffer(Bytes),
    Stream(ByteStream),
}

impl Payload {
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            Payload::Data(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Bytes> {
        match self {
            Payload::Buffer(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<ByteStream> {
        match self {
            Payload::Stream(stream) => Some(stream),
            _ => None,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Data(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Buffer(bytes)
    }
}

impl From<ByteStream> for Payload {
    fn from(stream: ByteStream) -> Self {
        Payload::Stream(stream)
    }
}

enum Source {
    Chunks(VecDeque<Bytes>),
    Reader(Box<dyn Read + Send>),
}

/// Body of a stream frame.
///
/// Decoded streams hold the chunks the parser forwarded, in arrival order and without
/// concatenating them. Outgoing streams can also wrap any reader, which is drained
/// chunk by chunk when the frame is written.
pub struct ByteStream {
    source: Source,
}

impl ByteStream {
    pub fn new() -> Self {
        Self {
            source: Source::Chunks(VecDeque::new()),
        }
    }

    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Self {
        Self {
            source: Source::Reader(Box::new(reader)),
        }
    }

    /// Appends a chunk. Has no effect on reader-backed streams.
    pub(crate) fn push(&mut self, chunk: Bytes) {
        if let Source::Chunks(chunks) = &mut self.source {
            if !chunk.is_empty() {
                chunks.push_back(chunk);
            }
        }
    }

    /// Bytes still buffered, or `None` when backed by a reader.
    pub fn buffered_len(&self) -> Option<usize> {
        match &self.source {
            Source::Chunks(chunks) => Some(chunks.iter().map(Bytes::len).sum()),
            Source::Reader(_) => None,
        }
    }

    /// Drains the whole stream into one buffer.
    pub fn into_bytes(mut self) -> io::Result<Bytes> {
        match &mut self.source {
            Source::Chunks(chunks) if chunks.len() == 1 => {
                Ok(chunks.pop_front().unwrap_or_default())
            }
            Source::Chunks(chunks) => {
                let mut out = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
                for chunk in chunks.drain(..) {
                    out.extend_from_slice(&chunk);
                }
                Ok(out.freeze())
            }
            Source::Reader(reader) => {
                let mut out = Vec::new();
                reader.read_to_end(&mut out)?;
                Ok(Bytes::from(out))
            }
        }
    }
}

impl Default for ByteStream {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Bytes> for ByteStream {
    fn from(bytes: Bytes) -> Self {
        let mut stream = ByteStream::new();
        stream.push(bytes);
        stream
    }
}

impl From<Vec<u8>> for ByteStream {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            Source::Reader(reader) => reader.read(buf),
            Source::Chunks(chunks) => {
                let Some(front) = chunks.front_mut() else {
                    return Ok(0);
                };
                let n = front.len().min(buf.len());
                buf[..n].copy_from_slice(&front[..n]);
                front.advance(n);
                if front.is_empty() {
                    chunks.pop_front();
                }
                Ok(n)
            }
        }
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Source::Chunks(chunks) => f
                .debug_struct("ByteStream")
                .field("chunks", &chunks.len())
                .field("len", &self.buffered_len())
                .finish(),
            Source::Reader(_) => f.debug_struct("ByteStream").field("reader", &true).finish(),
        }
    }
}
