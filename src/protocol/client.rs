//! Pooled, retrying transactional client.
//!
//! [`Client::send`] runs one transaction: it leases a connection from the [`Pool`], writes
//! the initiating request, and folds every message the server sends into a [`Response`]
//! until the terminator arrives. A lease covers exactly one transaction, so responses can
//! never interleave on a socket.
//!
//! When the connection breaks in a way that is safe to repeat (reset, broken pipe, peer
//! closing before the terminator) the connection is destroyed and the transaction starts
//! over on a fresh lease, up to [`RetryPolicy::max_retries`] times with exponential
//! backoff. Everything else, including read timeouts, fails the call.
use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::Arc,
    thread,
    time::Duration,
};

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

use super::{
    Connection, ConnectionError, Event, Message, Pool, PoolConfig, PoolError, Response,
    Transaction,
    request::{PING, PONG},
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("transaction {transaction_id} failed: {source}")]
    Connection {
        transaction_id: String,
        source: ConnectionError,
    },

    #[error("transaction {transaction_id} timed out")]
    Timeout { transaction_id: String },

    #[error("transaction {transaction_id} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        transaction_id: String,
        attempts: u32,
        source: ConnectionError,
    },

    #[error("ping failed: {0}")]
    Ping(#[from] std::io::Error),
}

/// Bounded retry with exponential backoff for transient connection failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (starting at 1).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
}

/// Cheap to clone; clones share one pool.
#[derive(Debug, Clone)]
pub struct Client {
    pool: Arc<Pool>,
    retry: RetryPolicy,
}

impl Client {
    /// Creates a client for `address` (`host:port`, an empty host meaning `0.0.0.0`). No
    /// connection is opened until the first call.
    pub fn new(address: &str, config: ClientConfig) -> Result<Self, ClientError> {
        let address = parse_address(address)?;
        Ok(Self {
            pool: Arc::new(Pool::new(address, config.pool)),
            retry: config.retry,
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Runs `handler_name` on the server and returns every message it sent back.
    pub fn send(
        &self,
        handler_name: &str,
        data: Value,
        params: Value,
    ) -> Result<Response, ClientError> {
        let transaction = Transaction::new(handler_name, data, params);
        let mut retries = 0;

        loop {
            let mut conn = self.pool.acquire()?;
            let err = match exchange(&mut conn, &transaction) {
                Ok(response) => {
                    self.pool.release(conn);
                    return Ok(response);
                }
                Err(err) => err,
            };
            self.pool.destroy(conn);

            let transaction_id = transaction.transaction_id.clone();
            if err.is_timeout() {
                return Err(ClientError::Timeout { transaction_id });
            }
            if !err.is_transient() {
                return Err(ClientError::Connection {
                    transaction_id,
                    source: err,
                });
            }
            if retries >= self.retry.max_retries {
                return Err(ClientError::RetriesExhausted {
                    transaction_id,
                    attempts: retries + 1,
                    source: err,
                });
            }

            retries += 1;
            let delay = self.retry.delay(retries);
            warn!(
                "transaction {transaction_id} hit '{err}', retry {retries}/{} in {delay:?}",
                self.retry.max_retries
            );
            thread::sleep(delay);
        }
    }

    /// Liveness probe over a fresh socket, outside the pool.
    pub fn ping(&self) -> Result<bool, ClientError> {
        let config = self.pool.config();
        let mut last_err = None;
        for addr in self.pool.address().to_socket_addrs()? {
            let mut stream = match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => stream,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };
            stream.set_read_timeout(Some(config.connect_timeout))?;
            stream.write_all(PING)?;

            let mut reply = Vec::new();
            stream.read_to_end(&mut reply)?;
            debug!("ping {addr}: {} byte reply", reply.len());
            return Ok(reply == PONG);
        }
        Err(last_err
            .unwrap_or_else(|| std::io::Error::other("address resolved to nothing"))
            .into())
    }
}

fn exchange(conn: &mut Connection, transaction: &Transaction) -> Result<Response, ConnectionError> {
    conn.send_transaction(transaction)?;

    let mut response = Response::default();
    loop {
        match conn.recv()? {
            Event::Message(Message { key, value }) => response.insert(key, value),
            Event::End => return Ok(response),
        }
    }
}

fn parse_address(address: &str) -> Result<String, ClientError> {
    let invalid = |reason: &str| ClientError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    if address.starts_with("http") {
        return Err(invalid("expected host:port, not a URL"));
    }
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(invalid("missing port"));
    };
    if port.parse::<u16>().is_err() {
        return Err(invalid("port is not a number between 0 and 65535"));
    }

    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        io::Cursor,
        net::{SocketAddr, TcpListener},
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::protocol::{
        ByteStream, HandlerError, Inbound, Reply, Server, ServerConfig, ServerHandle, codec,
        request::RequestReader,
    };

    fn test_server(configure: impl FnOnce(&mut Server)) -> ServerHandle {
        let mut server = Server::bind("127.0.0.1:0", ServerConfig::default()).unwrap();
        server.handle("echo", |data, _, _| Ok(Reply::Data(data)));
        configure(&mut server);
        server.spawn().unwrap()
    }

    fn client_for(address: SocketAddr, max_connections: usize) -> Client {
        let config = ClientConfig {
            pool: PoolConfig {
                max_connections,
                acquire_timeout: Duration::from_secs(10),
                read_timeout: Some(Duration::from_secs(10)),
                ..PoolConfig::default()
            },
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
        };
        Client::new(&address.to_string(), config).unwrap()
    }

    /// Reads one initiating request off a raw server-side socket.
    fn read_request(stream: &mut TcpStream) -> Transaction {
        let mut reader = RequestReader::default();
        let mut buf = [0u8; 1024];
        loop {
            match reader.next_request() {
                Some(Inbound::Transaction(txn)) => return txn,
                Some(other) => panic!("unexpected {other:?}"),
                None => {}
            }
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "client hung up");
            reader.push(&buf[..n]);
        }
    }

    #[test]
    fn echo_round_trip() {
        let server = test_server(|_| {});
        let client = client_for(server.local_addr(), 2);

        let response = client.send("echo", json!({"n": 42}), json!(null)).unwrap();

        assert_eq!(response.len(), 1);
        assert_eq!(response.data(), Some(&json!({"n": 42})));
        assert_eq!(client.pool().open_connections(), 1);
        assert_eq!(client.pool().idle_connections(), 1);
    }

    #[test]
    fn connection_is_reused_across_calls() {
        let server = test_server(|_| {});
        let client = client_for(server.local_addr(), 4);

        for n in 0..5 {
            let response = client.send("echo", json!(n), json!(null)).unwrap();
            assert_eq!(response.data(), Some(&json!(n)));
        }
        assert_eq!(client.pool().open_connections(), 1);
    }

    #[test]
    fn params_and_multiple_messages() {
        let server = test_server(|server| {
            server.handle("report", |data, params, responder| {
                responder.send_message("params", &params)?;
                responder.send_buffer("raw", &[1, 2, 3])?;
                responder.send_stream("log", Cursor::new(b"line\n".repeat(3)))?;
                let id = responder.transaction_id().to_string();
                responder.send_message("id", &id)?;
                Ok(Reply::Data(data))
            });
        });
        let client = client_for(server.local_addr(), 1);

        let mut response = client
            .send("report", json!("body"), json!({"token": "t"}))
            .unwrap();

        assert_eq!(response.data(), Some(&json!("body")));
        assert_eq!(
            response.get("params").and_then(|p| p.as_data()),
            Some(&json!({"token": "t"}))
        );
        assert_eq!(
            response.get("raw").and_then(|p| p.as_buffer()),
            Some(&Bytes::from_static(&[1, 2, 3]))
        );
        let id = response.get("id").and_then(|p| p.as_data()).and_then(Value::as_str);
        assert_eq!(id.map(str::len), Some(26));

        let log = response.remove("log").and_then(|p| p.into_stream()).unwrap();
        assert_eq!(&log.into_bytes().unwrap()[..], b"line\nline\nline\n");
    }

    #[test]
    fn stream_and_buffer_replies() {
        let server = test_server(|server| {
            server
                .handle("upper", |data, _, _| {
                    let text = data["text"].as_str().unwrap_or_default().to_uppercase();
                    Ok(Reply::Stream(ByteStream::from(text.into_bytes())))
                })
                .handle("bytes", |_, _, _| Ok(Reply::Buffer(Bytes::from_static(b"\xff\x00"))));
        });
        let client = client_for(server.local_addr(), 1);

        let mut response = client
            .send("upper", json!({"text": "shout"}), json!(null))
            .unwrap();
        let body = response.remove("data").and_then(|p| p.into_stream()).unwrap();
        assert_eq!(&body.into_bytes().unwrap()[..], b"SHOUT");

        let response = client.send("bytes", json!(null), json!(null)).unwrap();
        assert_eq!(
            response.get("data").and_then(|p| p.as_buffer()),
            Some(&Bytes::from_static(b"\xff\x00"))
        );
    }

    #[test]
    fn handler_failure_is_an_error_message() {
        let server = test_server(|server| {
            server
                .handle("fail", |_, _, _| Err(HandlerError::new("no luck")))
                .handle("panic", |_, _, _| panic!("handler blew up"));
        });
        let client = client_for(server.local_addr(), 1);

        let response = client.send("fail", json!(null), json!(null)).unwrap();
        let error = response.error().unwrap();
        assert_eq!(error["message"], "no luck");
        assert_eq!(error["isError"], true);
        assert!(error["transactionId"].is_string());

        let response = client.send("panic", json!(null), json!(null)).unwrap();
        assert_eq!(response.error().unwrap()["message"], "handler blew up");

        let response = client.send("missing", json!(null), json!(null)).unwrap();
        assert!(response.is_error());

        // the connection survives handler failures
        assert_eq!(client.pool().open_connections(), 1);
        assert!(client.send("echo", json!(1), json!(null)).is_ok());
    }

    #[test]
    fn pool_bounds_concurrent_transactions() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let peers = Arc::new(Mutex::new(HashSet::new()));

        let server = {
            let (active, peak, peers) =
                (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&peers));
            test_server(move |server| {
                server.handle("slow", move |data, _, responder| {
                    peers.lock().unwrap().insert(responder.peer_addr()?);
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    for part in 0..3 {
                        responder.send_message(&format!("part{part}"), &data)?;
                        thread::sleep(Duration::from_millis(5));
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(Reply::Data(data))
                });
            })
        };
        let client = client_for(server.local_addr(), 2);

        let callers: Vec<_> = (0..8)
            .map(|n| {
                let client = client.clone();
                thread::spawn(move || client.send("slow", json!({"caller": n}), json!(null)))
            })
            .collect();

        for (n, caller) in callers.into_iter().enumerate() {
            let response = caller.join().unwrap().unwrap();
            let expected = json!({"caller": n});
            assert_eq!(response.len(), 4);
            for key in ["part0", "part1", "part2", "data"] {
                assert_eq!(response.get(key).and_then(|p| p.as_data()), Some(&expected));
            }
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peers.lock().unwrap().len() <= 2);
        assert!(client.pool().open_connections() <= 2);
    }

    #[test]
    fn idle_connections_do_not_starve_other_clients() {
        let config = ServerConfig {
            workers: 2,
            ..ServerConfig::default()
        };
        let mut server = Server::bind("127.0.0.1:0", config).unwrap();
        server.handle("echo", |data, _, _| Ok(Reply::Data(data)));
        let server = server.spawn().unwrap();

        // each client keeps its connection idle in its own pool
        let clients: Vec<_> = (0..5).map(|_| client_for(server.local_addr(), 1)).collect();
        for (n, client) in clients.iter().enumerate() {
            let response = client.send("echo", json!(n), json!(null)).unwrap();
            assert_eq!(response.data(), Some(&json!(n)));
            assert_eq!(client.pool().idle_connections(), 1);
        }
        for client in &clients {
            assert!(client.send("echo", json!("again"), json!(null)).is_ok());
        }
    }

    #[test]
    fn workers_bound_running_handlers() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut server = Server::bind(
            "127.0.0.1:0",
            ServerConfig {
                workers: 1,
                ..ServerConfig::default()
            },
        )
        .unwrap();
        {
            let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
            server.handle("slow", move |data, _, _| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Reply::Data(data))
            });
        }
        let server = server.spawn().unwrap();
        let client = client_for(server.local_addr(), 4);

        let callers: Vec<_> = (0..4)
            .map(|n| {
                let client = client.clone();
                thread::spawn(move || client.send("slow", json!(n), json!(null)))
            })
            .collect();
        for (n, caller) in callers.into_iter().enumerate() {
            let response = caller.join().unwrap().unwrap();
            assert_eq!(response.data(), Some(&json!(n)));
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_failure_is_retried_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&attempts);
        let server = thread::spawn(move || {
            // first connection dies halfway through the response
            let (mut first, _) = listener.accept().unwrap();
            read_request(&mut first);
            counter.fetch_add(1, Ordering::SeqCst);
            first
                .write_all(&codec::encode_data("partial", &true).unwrap())
                .unwrap();
            drop(first);

            let (mut second, _) = listener.accept().unwrap();
            let txn = read_request(&mut second);
            counter.fetch_add(1, Ordering::SeqCst);
            let mut conn = Connection::new(second);
            conn.send_message("data", &txn.data).unwrap();
            conn.done().unwrap();
            thread::sleep(Duration::from_millis(100));
        });

        let client = client_for(address, 1);
        let response = client.send("echo", json!({"n": 42}), json!(null)).unwrap();

        assert_eq!(response.len(), 1);
        assert_eq!(response.data(), Some(&json!({"n": 42})));
        assert!(response.get("partial").is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        server.join().unwrap();
    }

    #[test]
    fn retries_are_bounded() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&accepted);
        thread::spawn(move || {
            for mut stream in listener.incoming().flatten() {
                read_request(&mut stream);
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let client = client_for(address, 1);
        let err = client.send("echo", json!(null), json!(null)).unwrap_err();

        assert!(matches!(err, ClientError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert_eq!(client.pool().open_connections(), 0);
    }

    #[test]
    fn malformed_reply_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            stream.write_all(b"invalid request").unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let client = client_for(address, 1);
        let err = client.send("echo", json!(null), json!(null)).unwrap_err();

        assert!(matches!(
            err,
            ClientError::Connection { source: ConnectionError::Protocol(_), .. }
        ));
        assert_eq!(client.pool().open_connections(), 0);
    }

    #[test]
    fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
        });

        let config = ClientConfig {
            pool: PoolConfig {
                read_timeout: Some(Duration::from_millis(50)),
                ..PoolConfig::default()
            },
            ..ClientConfig::default()
        };
        let client = Client::new(&address.to_string(), config).unwrap();

        assert!(matches!(
            client.send("echo", json!(null), json!(null)),
            Err(ClientError::Timeout { .. })
        ));
    }

    #[test]
    fn refused_connection_is_not_retried() {
        let address = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let client = client_for(address, 1);

        assert!(matches!(
            client.send("echo", json!(null), json!(null)),
            Err(ClientError::Pool(PoolError::Connect { .. }))
        ));
    }

    #[test]
    fn stopped_server_fails_without_stale_connections() {
        let server = test_server(|_| {});
        let address = server.local_addr();
        let client = client_for(address, 1);
        client.send("echo", json!(1), json!(null)).unwrap();

        server.stop().unwrap();
        assert!(client.send("echo", json!(2), json!(null)).is_err());
        assert_eq!(client.pool().idle_connections(), 0);
    }

    #[test]
    fn ping_probe() {
        let server = test_server(|_| {});
        let client = client_for(server.local_addr(), 1);

        assert!(client.ping().unwrap());
        assert_eq!(client.pool().open_connections(), 0);
    }

    #[test]
    fn address_parsing() {
        assert_eq!(parse_address("localhost:4867").unwrap(), "localhost:4867");
        assert_eq!(parse_address(":4867").unwrap(), "0.0.0.0:4867");
        assert!(matches!(
            parse_address("http://localhost:4867"),
            Err(ClientError::InvalidAddress { .. })
        ));
        assert!(parse_address("localhost").is_err());
        assert!(parse_address("localhost:port").is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(35),
        };

        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(35));
        assert_eq!(policy.delay(30), Duration::from_millis(35));
    }
}
