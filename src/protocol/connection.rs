use std::{
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use log::{debug, trace};
use serde::Serialize;
use thiserror::Error;

use super::{
    Payload, Transaction,
    codec::{self, CodecError},
    parser::{Event, Parser, ParserConfig, ProtocolError},
};

/// Size of a single socket read.
const READ_CHUNK: usize = 16 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to encode frame: {0}")]
    Codec(#[from] CodecError),

    #[error("failed to encode request: {0}")]
    Request(#[from] serde_json::Error),

    #[error("peer closed the connection")]
    Disconnected,

    #[error("connection failed earlier and is no longer usable")]
    Failed,
}

impl ConnectionError {
    /// Failures that leave no trace on the peer worth worrying about, so the whole
    /// transaction can run again on another connection.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectionError::Io(err) => matches!(
                err.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::UnexpectedEof
            ),
            ConnectionError::Disconnected => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            ConnectionError::Io(err) => {
                matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
            }
            _ => false,
        }
    }
}

/// One live socket bound to one [`Parser`].
///
/// Outgoing messages are encoded and written immediately. Incoming bytes are parsed as
/// they are read and handed out one [`Event`] at a time by [`recv`](Connection::recv). Any
/// I/O or protocol error marks the connection as failed; its owner must then drop it.
pub struct Connection {
    id: u64,
    stream: TcpStream,
    parser: Parser,
    pending: VecDeque<Event>,
    read_buf: Box<[u8]>,
    failed: bool,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_parser(stream, ParserConfig::default())
    }

    pub fn with_parser(stream: TcpStream, config: ParserConfig) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            parser: Parser::with_config(config),
            pending: VecDeque::new(),
            read_buf: vec![0; READ_CHUNK].into_boxed_slice(),
            failed: false,
        }
    }

    /// Process-unique id, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub(crate) fn socket(&self) -> &TcpStream {
        &self.stream
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Writes the request opening a transaction.
    pub fn send_transaction(&mut self, transaction: &Transaction) -> Result<(), ConnectionError> {
        let body = serde_json::to_vec(transaction)?;
        debug!(
            "[conn {}] transaction {} for '{}'",
            self.id, transaction.transaction_id, transaction.handler_name
        );
        self.write(&body)
    }

    pub fn send_message<T: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &T,
    ) -> Result<(), ConnectionError> {
        let frame = codec::encode_data(key, value)?;
        self.write(&frame)
    }

    pub fn send_buffer(&mut self, key: &str, bytes: &[u8]) -> Result<(), ConnectionError> {
        let frame = codec::encode_buffer(key, bytes)?;
        self.write(&frame)
    }

    /// Writes a stream frame, copying `source` to the socket until it is exhausted.
    pub fn send_stream<R: Read>(
        &mut self,
        key: &str,
        mut source: R,
    ) -> Result<(), ConnectionError> {
        let header = codec::encode_stream_header(key)?;
        self.write(&header)?;

        let mut chunk = vec![0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            let n = match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.fail(err.into())),
            };
            self.write(&chunk[..n])?;
            total += n;
        }
        trace!("[conn {}] streamed {total} bytes for '{key}'", self.id);
        self.write(&codec::stream_trailer(key))
    }

    pub fn send(&mut self, key: &str, payload: Payload) -> Result<(), ConnectionError> {
        match payload {
            Payload::Data(value) => self.send_message(key, &value),
            Payload::Buffer(bytes) => self.send_buffer(key, &bytes),
            Payload::Stream(stream) => self.send_stream(key, stream),
        }
    }

    /// Writes the terminator frame closing the current transaction.
    pub fn done(&mut self) -> Result<(), ConnectionError> {
        let frame = codec::encode_terminator()?;
        self.write(&frame)
    }

    /// Blocks until the next decoded event.
    pub fn recv(&mut self) -> Result<Event, ConnectionError> {
        if self.failed {
            return Err(ConnectionError::Failed);
        }

        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            let n = match self.stream.read(&mut self.read_buf) {
                Ok(0) => return Err(self.fail(ConnectionError::Disconnected)),
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.fail(err.into())),
            };
            trace!("[conn {}] read {n} bytes", self.id);

            match self.parser.feed(Bytes::copy_from_slice(&self.read_buf[..n])) {
                Ok(events) => self.pending.extend(events),
                Err(err) => return Err(self.fail(err.into())),
            }
        }
    }

    /// Clears parser and queued events so the socket can carry a new transaction.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.pending.clear();
    }

    /// Checks that the socket is still usable for a new transaction.
    ///
    /// Healthy means no earlier failure, no pending socket error, and a non-blocking peek
    /// that would block: the peer has neither closed its side nor left unread bytes behind.
    pub fn is_healthy(&self) -> bool {
        if self.failed || !self.pending.is_empty() {
            return false;
        }
        if !matches!(self.stream.take_error(), Ok(None)) {
            return false;
        }
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }

        let mut probe = [0u8; 1];
        let idle = match self.stream.peek(&mut probe) {
            Ok(_) => false,
            Err(err) => err.kind() == ErrorKind::WouldBlock,
        };
        self.stream.set_nonblocking(false).is_ok() && idle
    }

    pub fn shutdown(&self) {
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            trace!("[conn {}] shutdown: {err}", self.id);
        }
    }

    /// Reads raw, unframed bytes. Used at request boundaries.
    pub(crate) fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        loop {
            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.fail(err.into())),
            }
        }
    }

    /// Writes raw, unframed bytes.
    pub(crate) fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.write(bytes)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if self.failed {
            return Err(ConnectionError::Failed);
        }
        if let Err(err) = self.stream.write_all(bytes) {
            return Err(self.fail(err.into()));
        }
        Ok(())
    }

    fn fail(&mut self, err: ConnectionError) -> ConnectionError {
        debug!("[conn {}] failed: {err}", self.id);
        self.failed = true;
        err
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.stream.peer_addr().ok())
            .field("state", &self.parser.state())
            .field("failed", &self.failed)
            .finish()
    }
}
