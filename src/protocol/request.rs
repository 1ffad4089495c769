use bytes::{Buf, BytesMut};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Literal liveness probe, answered outside the framed protocol.
pub const PING: &[u8] = b"ping";
pub const PONG: &[u8] = b"pong";

/// Reply to bytes that are not a usable request.
pub const INVALID_REQUEST: &[u8] = b"invalid request";

const TRANSACTION_ID_LEN: usize = 26;
const TRANSACTION_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Default cap on the bytes a single initiating request may occupy (1 MiB).
pub const DEFAULT_MAX_REQUEST_LEN: usize = 1024 * 1024;

/// The request opening a transaction, written as one bare JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(default)]
    pub transaction_id: String,
    pub handler_name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub params: Value,
}

impl Transaction {
    pub fn new(handler_name: impl Into<String>, data: Value, params: Value) -> Self {
        Self {
            transaction_id: transaction_id(),
            handler_name: handler_name.into(),
            data,
            params,
        }
    }
}

/// Opaque id used only to correlate log lines on both ends.
pub fn transaction_id() -> String {
    let mut rng = rand::thread_rng();
    (0..TRANSACTION_ID_LEN)
        .map(|_| {
            let index = rng.gen_range(0..TRANSACTION_ID_ALPHABET.len());
            char::from(TRANSACTION_ID_ALPHABET[index])
        })
        .collect()
}

/// What a server connection received at a request boundary.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Ping,
    Transaction(Transaction),
    Invalid,
}

/// Accumulates raw bytes until they form a complete request.
///
/// Requests carry no frame header, so the reader keeps asking for input while the bytes
/// are an unfinished JSON document or a proper prefix of [`PING`].
///
/// A request that grows past `max_len` bytes without completing, or completes larger than
/// that, reads as [`Inbound::Invalid`].
#[derive(Debug)]
pub struct RequestReader {
    buf: BytesMut,
    max_len: usize,
}

impl Default for RequestReader {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_REQUEST_LEN)
    }
}

impl RequestReader {
    pub fn with_limit(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_len,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn next_request(&mut self) -> Option<Inbound> {
        let start = self
            .buf
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(self.buf.len());
        self.buf.advance(start);
        if self.buf.is_empty() {
            return None;
        }

        if self.is_ping() {
            self.buf.clear();
            return Some(Inbound::Ping);
        }
        if PING.starts_with(&self.buf) {
            return None;
        }

        let mut documents = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
        let parsed = documents.next();
        let consumed = documents.byte_offset();
        match parsed {
            Some(Ok(_)) if consumed > self.max_len => self.reject(),
            Some(Ok(value)) => {
                self.buf.advance(consumed);
                Some(validate(value))
            }
            Some(Err(err)) if err.is_eof() && self.buf.len() <= self.max_len => None,
            Some(Err(_)) => self.reject(),
            None => None,
        }
    }

    /// `ping`, optionally followed by whitespace, and nothing else.
    fn is_ping(&self) -> bool {
        self.buf.starts_with(PING) && self.buf[PING.len()..].iter().all(u8::is_ascii_whitespace)
    }

    fn reject(&mut self) -> Option<Inbound> {
        self.buf.clear();
        Some(Inbound::Invalid)
    }
}

fn validate(value: Value) -> Inbound {
    let named = value
        .get("handlerName")
        .and_then(Value::as_str)
        .is_some_and(|name| !name.is_empty());
    if !named {
        return Inbound::Invalid;
    }

    match serde_json::from_value(value) {
        Ok(transaction) => Inbound::Transaction(transaction),
        Err(_) => Inbound::Invalid,
    }
}
