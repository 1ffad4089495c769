//! Incremental frame parser.
//!
//! The [`Parser`] turns an arbitrary sequence of byte chunks, as read from a socket, back
//! into the messages the peer wrote. It never performs I/O: the owner hands it chunks with
//! [`Parser::feed`] and gets back every [`Event`] those bytes completed.
//!
//! # State machine
//!
//! Decoding cycles through six states, advancing only when the bytes a state needs are
//! queued and stalling otherwise until the next `feed`:
//!
//! 1. [`State::ContentType`]: two bytes, the frame's [`ContentType`].
//! 2. [`State::KeyLength`]: two bytes.
//! 3. [`State::Key`]: `key length` bytes of UTF-8.
//! 4. [`State::ContentLength`]: two bytes, zero for streams.
//! 5. [`State::Payload`]: exactly `content length` bytes for data and buffer frames. Stream
//!    frames instead forward every byte into a [`ByteStream`] until the key's sentinel
//!    shows up, possibly many chunks later.
//! 6. [`State::Parse`]: the finished frame becomes an [`Event`].
//!
//! Input is kept as a FIFO of the chunks it arrived in, together with a running count of
//! queued bytes, so a state can check whether it can proceed without concatenating
//! anything. Reads that span chunks split the first chunk they do not fully consume and
//! push the remainder back. The decoded messages are therefore the same however the
//! transport fragmented the bytes.
//!
//! Once the terminator frame is decoded the parser reports [`Event::End`] and stops; input
//! that arrives afterwards is queued but not parsed until [`Parser::reset`]. A malformed
//! frame poisons the parser the same way.
use std::{collections::VecDeque, mem};

use bytes::{Bytes, BytesMut};
use log::trace;
use serde_json::Value;
use thiserror::Error;

use super::{
    ByteStream, Payload,
    codec::{self, CodecError, ContentType, FIELD_LEN, TERMINATOR_KEY, TERMINATOR_VALUE},
};

/// Default upper bound for a single decoded stream body (64 MiB).
pub const DEFAULT_MAX_STREAM_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame header: {0}")]
    Header(#[from] CodecError),

    #[error("frame key is not valid UTF-8: {0}")]
    InvalidKey(#[from] std::string::FromUtf8Error),

    #[error("payload for '{key}' is not valid JSON: {source}")]
    Json {
        key: String,
        source: serde_json::Error,
    },

    #[error("stream frame '{key}' declares a payload length of {len}")]
    StreamWithLength { key: String, len: u16 },

    #[error("stream '{key}' exceeded {limit} bytes")]
    StreamTooLarge { key: String, limit: usize },

    #[error("parser stopped after an earlier malformed frame")]
    Poisoned,
}

/// Where the parser is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ContentType,
    KeyLength,
    Key,
    ContentLength,
    Payload,
    Parse,
}

/// One decoded message.
#[derive(Debug)]
pub struct Message {
    pub key: String,
    pub value: Payload,
}

#[derive(Debug)]
pub enum Event {
    Message(Message),
    /// The terminator frame was decoded.
    End,
}

#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Largest stream body a single frame may carry.
    pub max_stream_len: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_stream_len: DEFAULT_MAX_STREAM_LEN,
        }
    }
}

enum Body {
    Bytes(Bytes),
    Stream(ByteStream),
}

/// Fields of the frame currently being decoded.
struct PartialFrame {
    content_type: ContentType,
    key_len: usize,
    key: String,
    payload_len: usize,
    body: Option<Body>,
}

impl Default for PartialFrame {
    fn default() -> Self {
        Self {
            content_type: ContentType::Data,
            key_len: 0,
            key: String::new(),
            payload_len: 0,
            body: None,
        }
    }
}

/// Scan state for an open stream body.
struct OpenStream {
    sentinel: Vec<u8>,
    sink: ByteStream,
    len: usize,
    /// Tail of the forwarded input that may be the start of the sentinel.
    carry: BytesMut,
}

pub struct Parser {
    config: ParserConfig,
    state: State,
    frame: PartialFrame,
    stream: Option<OpenStream>,
    queue: VecDeque<Bytes>,
    buffered: usize,
    ended: bool,
    poisoned: bool,
}

impl Parser {
    pub fn new() -> Self {
        Self::with_config(ParserConfig::default())
    }

    pub fn with_config(config: ParserConfig) -> Self {
        Self {
            config,
            state: State::ContentType,
            frame: PartialFrame::default(),
            stream: None,
            queue: VecDeque::new(),
            buffered: 0,
            ended: false,
            poisoned: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Bytes queued but not yet consumed by any state.
    pub fn buffered_len(&self) -> usize {
        self.buffered
    }

    /// Whether the terminator frame has been decoded since the last reset.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Queues `chunk` and decodes as far as the queued bytes allow.
    ///
    /// Never blocks. Returns the events completed by this chunk in the order their frames
    /// were written; an empty vector means the parser is waiting for more input.
    pub fn feed(&mut self, chunk: impl Into<Bytes>) -> Result<Vec<Event>, ProtocolError> {
        if self.poisoned {
            return Err(ProtocolError::Poisoned);
        }

        let chunk = chunk.into();
        if !chunk.is_empty() {
            self.buffered += chunk.len();
            self.queue.push_back(chunk);
        }

        let mut events = Vec::new();
        if let Err(err) = self.drive(&mut events) {
            self.poisoned = true;
            return Err(err);
        }
        Ok(events)
    }

    /// Drops all queued input and partial state.
    pub fn reset(&mut self) {
        self.state = State::ContentType;
        self.frame = PartialFrame::default();
        self.stream = None;
        self.queue.clear();
        self.buffered = 0;
        self.ended = false;
        self.poisoned = false;
    }

    fn drive(&mut self, events: &mut Vec<Event>) -> Result<(), ProtocolError> {
        while !self.ended {
            match self.state {
                State::ContentType => {
                    let Some(field) = self.read_bytes(FIELD_LEN) else {
                        break;
                    };
                    self.frame.content_type = ContentType::try_from(codec::read_field(&field)?)?;
                    self.state = State::KeyLength;
                }
                State::KeyLength => {
                    let Some(field) = self.read_bytes(FIELD_LEN) else {
                        break;
                    };
                    self.frame.key_len = codec::read_field(&field)? as usize;
                    self.state = State::Key;
                }
                State::Key => {
                    let Some(key) = self.read_bytes(self.frame.key_len) else {
                        break;
                    };
                    self.frame.key = String::from_utf8(key.to_vec())?;
                    self.state = State::ContentLength;
                }
                State::ContentLength => {
                    let Some(field) = self.read_bytes(FIELD_LEN) else {
                        break;
                    };
                    let len = codec::read_field(&field)?;
                    if self.frame.content_type == ContentType::Stream {
                        if len != 0 {
                            return Err(ProtocolError::StreamWithLength {
                                key: mem::take(&mut self.frame.key),
                                len,
                            });
                        }
                        self.stream = Some(OpenStream {
                            sentinel: codec::sentinel(&self.frame.key),
                            sink: ByteStream::new(),
                            len: 0,
                            carry: BytesMut::new(),
                        });
                    }
                    self.frame.payload_len = len as usize;
                    self.state = State::Payload;
                }
                State::Payload => {
                    if self.frame.content_type == ContentType::Stream {
                        let Some(sink) = self.scan_stream()? else {
                            break;
                        };
                        self.frame.body = Some(Body::Stream(sink));
                    } else {
                        let Some(payload) = self.read_bytes(self.frame.payload_len) else {
                            break;
                        };
                        self.frame.body = Some(Body::Bytes(payload));
                    }
                    self.state = State::Parse;
                }
                State::Parse => {
                    let frame = mem::take(&mut self.frame);
                    self.state = State::ContentType;

                    let event = frame.into_event()?;
                    if let Event::End = event {
                        trace!("terminator decoded, {} bytes left queued", self.buffered);
                        self.ended = true;
                    }
                    events.push(event);
                }
            }
        }
        Ok(())
    }

    /// Takes exactly `n` bytes off the front of the queue, or nothing if fewer are queued.
    fn read_bytes(&mut self, n: usize) -> Option<Bytes> {
        if self.buffered < n {
            return None;
        }
        if n == 0 {
            return Some(Bytes::new());
        }
        self.buffered -= n;

        let front = self.queue.front_mut()?;
        if front.len() == n {
            return self.queue.pop_front();
        }
        if front.len() > n {
            return Some(front.split_to(n));
        }

        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let mut chunk = self.queue.pop_front()?;
            let need = n - out.len();
            if chunk.len() > need {
                out.extend_from_slice(&chunk.split_to(need));
                self.queue.push_front(chunk);
            } else {
                out.extend_from_slice(&chunk);
            }
        }
        Some(out.freeze())
    }

    /// Forwards queued bytes into the open stream until its sentinel is found.
    ///
    /// Returns the finished body once the sentinel has been consumed. Bytes following the
    /// sentinel go back to the front of the queue for the next frame.
    fn scan_stream(&mut self) -> Result<Option<ByteStream>, ProtocolError> {
        let limit = self.config.max_stream_len;
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Some(ByteStream::new()));
        };

        while let Some(chunk) = self.queue.pop_front() {
            self.buffered -= chunk.len();

            let window = if stream.carry.is_empty() {
                chunk
            } else {
                let mut joined = mem::take(&mut stream.carry);
                joined.extend_from_slice(&chunk);
                joined.freeze()
            };

            if let Some(at) = find(&window, &stream.sentinel) {
                let rest = window.slice(at + stream.sentinel.len()..);
                if !rest.is_empty() {
                    self.buffered += rest.len();
                    self.queue.push_front(rest);
                }
                stream.forward(window.slice(..at), limit, &self.frame.key)?;

                let Some(done) = self.stream.take() else {
                    return Ok(Some(ByteStream::new()));
                };
                return Ok(Some(done.sink));
            }

            let keep = partial_suffix(&window, &stream.sentinel);
            let split = window.len() - keep;
            stream.carry.extend_from_slice(&window[split..]);
            stream.forward(window.slice(..split), limit, &self.frame.key)?;
        }
        Ok(None)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenStream {
    fn forward(&mut self, chunk: Bytes, limit: usize, key: &str) -> Result<(), ProtocolError> {
        self.len += chunk.len();
        if self.len > limit {
            return Err(ProtocolError::StreamTooLarge {
                key: key.to_string(),
                limit,
            });
        }
        self.sink.push(chunk);
        Ok(())
    }
}

impl PartialFrame {
    fn into_event(self) -> Result<Event, ProtocolError> {
        let PartialFrame {
            content_type,
            key,
            body,
            ..
        } = self;

        let value = match (content_type, body) {
            (ContentType::Stream, Some(Body::Stream(stream))) => Payload::Stream(stream),
            (ContentType::Buffer, Some(Body::Bytes(bytes))) => Payload::Buffer(bytes),
            (ContentType::Data, Some(Body::Bytes(bytes))) => {
                let value: Value = match serde_json::from_slice(&bytes) {
                    Ok(value) => value,
                    Err(source) => return Err(ProtocolError::Json { key, source }),
                };
                if key == TERMINATOR_KEY && value.as_f64() == Some(f64::from(TERMINATOR_VALUE)) {
                    return Ok(Event::End);
                }
                Payload::Data(value)
            }
            (_, _) => Payload::Buffer(Bytes::new()),
        };

        trace!("decoded frame '{key}' ({content_type:?})");
        Ok(Event::Message(Message { key, value }))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest suffix of `haystack` that is a proper prefix of `needle`.
fn partial_suffix(haystack: &[u8], needle: &[u8]) -> usize {
    let longest = haystack.len().min(needle.len().saturating_sub(1));
    (1..=longest)
        .rev()
        .find(|&k| haystack.ends_with(&needle[..k]))
        .unwrap_or(0)
}
