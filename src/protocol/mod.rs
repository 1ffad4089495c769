//! Client-server communication protocol.
//!
//! This module defines the wire protocol spoken between wirecall clients and servers: the
//! framing format, the incremental parser that decodes it, and the connection, pool, client
//! and server types built on top.
//!
//! # Overview
//!
//! A transaction starts with the client writing a bare JSON request naming a handler on the
//! server. The server answers with any number of framed messages, each carrying a key and a
//! payload, and closes the transaction with a terminator frame. Connections are persistent;
//! once a transaction ends the same socket carries the next one.
//!
//! # Key Components
//!
//! - [`Parser`]: Sans-IO decoder turning arbitrary byte chunks into [`Event`]s.
//! - [`Connection`]: A socket paired with a parser and the frame encoders.
//! - [`Pool`]: Bounded set of reusable connections to one server.
//! - [`Client`]: Runs transactions over the pool, retrying transient failures.
//! - [`Server`]: Accepts connections and dispatches transactions to handlers.
//!
//! # Binary Format
//!
//! Every response message is one frame:
//!
//! ```text
//! [u16 content type][u16 key length][key][u16 payload length][payload]
//! ```
//!
//! - All integers are big-endian.
//! - Content type `0` is a JSON document, `1` a stream, `2` raw bytes.
//! - A stream frame declares length `0`; its body runs until the sentinel `__end_<key>`.
//! - The terminator is a JSON frame with key `$$__END__$$` and value `1`.
//!
//! The initiating request is not framed:
//!
//! ```text
//! {"transactionId": "...", "handlerName": "echo", "data": {...}, "params": {...}}
//! ```
//!
//! The literal request `ping` is answered with `pong`, anything unparseable with
//! `invalid request`, and the socket is closed in both cases.
pub mod codec;

mod client;
mod connection;
mod parser;
mod payload;
mod pool;
pub(crate) mod request;
mod response;
mod server;
mod thread;

pub use client::{Client, ClientConfig, ClientError, RetryPolicy};
pub use codec::{CodecError, ContentType};
pub use connection::{Connection, ConnectionError};
pub use parser::{Event, Message, Parser, ParserConfig, ProtocolError, State};
pub use payload::{ByteStream, Payload};
pub use pool::{Pool, PoolConfig, PoolError};
pub use request::{Inbound, Transaction};
pub use response::{DATA_KEY, ERROR_KEY, Response};
pub use server::{
    HandlerError, HandlerResult, Reply, Responder, Server, ServerConfig, ServerError,
    ServerHandle,
};
