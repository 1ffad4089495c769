use std::{
    any::Any,
    collections::HashMap,
    error::Error,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use log::{debug, info, warn};
use serde_json::{Value, json};
use thiserror::Error;

use super::{
    ByteStream, Connection, ConnectionError, Payload, Transaction,
    request::{DEFAULT_MAX_REQUEST_LEN, INVALID_REQUEST, Inbound, PONG, RequestReader},
    response::{DATA_KEY, ERROR_KEY},
    thread::{ThreadPool, ThreadPoolClosed},
};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Workers(#[from] ThreadPoolClosed),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("server thread panicked")]
    Panicked,
}

/// Failure raised by a handler. Sent to the caller as an error-shaped message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn from_error<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        Self::new(message)
    }

    /// Error chain below the top-level message, one cause per line.
    fn stack(&self) -> String {
        let mut lines = vec![format!("HandlerError: {}", self.message)];
        let mut cause = self.source.as_deref().and_then(|err| err.source());
        while let Some(err) = cause {
            lines.push(format!("caused by: {err}"));
            cause = err.source();
        }
        lines.join("\n")
    }

    fn to_message(&self, transaction_id: &str) -> Value {
        json!({
            "transactionId": transaction_id,
            "isError": true,
            "message": self.message,
            "stack": self.stack(),
        })
    }
}

impl From<ConnectionError> for HandlerError {
    fn from(err: ConnectionError) -> Self {
        Self::from_error(err)
    }
}

impl From<io::Error> for HandlerError {
    fn from(err: io::Error) -> Self {
        Self::from_error(err)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::from_error(err)
    }
}

/// What a handler sends back once it returns.
#[derive(Debug)]
pub enum Reply {
    /// JSON value sent under `data`.
    Data(Value),
    /// Raw bytes sent under `data`.
    Buffer(Bytes),
    /// Stream sent under `data`.
    Stream(ByteStream),
    /// Nothing beyond what the handler already sent through its [`Responder`].
    Done,
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Data(value)
    }
}

pub type HandlerResult = Result<Reply, HandlerError>;

type Handler = dyn Fn(Value, Value, &mut Responder<'_>) -> HandlerResult + Send + Sync;

type Handlers = HashMap<String, Arc<Handler>>;

/// Lets a handler write messages of its own before it returns.
pub struct Responder<'a> {
    conn: &'a mut Connection,
    transaction_id: &'a str,
}

impl Responder<'_> {
    pub fn transaction_id(&self) -> &str {
        self.transaction_id
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.conn.peer_addr()
    }

    pub fn send_message<T: serde::Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &T,
    ) -> Result<(), ConnectionError> {
        self.conn.send_message(key, value)
    }

    pub fn send_buffer(&mut self, key: &str, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.conn.send_buffer(key, bytes)
    }

    pub fn send_stream<R: io::Read>(
        &mut self,
        key: &str,
        source: R,
    ) -> Result<(), ConnectionError> {
        self.conn.send_stream(key, source)
    }

    pub fn send(&mut self, key: &str, payload: Payload) -> Result<(), ConnectionError> {
        self.conn.send(key, payload)
    }
}

/// Server configuration.
///
/// Every accepted connection gets a thread of its own that waits for requests; handlers
/// run on a shared pool of `workers` threads, so idle connections never hold a worker.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Handlers allowed to run at the same time.
    pub workers: usize,
    /// Closes connections that stay silent this long. `None` keeps them open.
    pub idle_timeout: Option<Duration>,
    /// Largest initiating request accepted; bigger ones get `invalid request`.
    pub max_request_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            idle_timeout: None,
            max_request_len: DEFAULT_MAX_REQUEST_LEN,
        }
    }
}

/// Connections the accept loop handed to workers, so `stop` can unblock them.
#[derive(Debug, Default)]
struct Shutdown {
    stopping: AtomicBool,
    live: Mutex<HashMap<u64, TcpStream>>,
}

impl Shutdown {
    fn track(&self, id: u64, stream: &TcpStream) {
        if let Ok(clone) = stream.try_clone() {
            self.live
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, clone);
        }
    }

    fn forget(&self, id: u64) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn close_all(&self) {
        let live = std::mem::take(&mut *self.live.lock().unwrap_or_else(PoisonError::into_inner));
        for stream in live.into_values() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Accepts connections and routes each transaction to the handler registered under its
/// `handlerName`.
pub struct Server {
    listener: TcpListener,
    handlers: Handlers,
    config: ServerConfig,
    shutdown: Arc<Shutdown>,
}

impl Server {
    pub fn bind(address: impl ToSocketAddrs, config: ServerConfig) -> Result<Self, ServerError> {
        Ok(Self {
            listener: TcpListener::bind(address)?,
            handlers: HashMap::new(),
            config,
            shutdown: Arc::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registers `handler` under `name`, replacing any earlier one.
    pub fn handle<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Value, Value, &mut Responder<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Serves connections until [`ServerHandle::stop`] is called.
    pub fn listen(self) -> Result<(), ServerError> {
        info!("listening at {}", self.local_addr()?);
        let workers = Arc::new(ThreadPool::new(self.config.workers));
        let handlers = Arc::new(self.handlers);
        let mut connections: Vec<thread::JoinHandle<()>> = Vec::new();

        for stream in self.listener.incoming() {
            if self.shutdown.stopping.load(Ordering::SeqCst) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("broken connection: {e:?}");
                    continue;
                }
            };
            if let Err(e) = stream.set_read_timeout(self.config.idle_timeout) {
                warn!("failed to configure connection: {e}");
                continue;
            }

            connections.retain(|conn| !conn.is_finished());

            let conn = Connection::new(stream);
            let id = conn.id();
            self.shutdown.track(id, conn.socket());

            let handlers = Arc::clone(&handlers);
            let workers = Arc::clone(&workers);
            let shutdown = Arc::clone(&self.shutdown);
            let max_request_len = self.config.max_request_len;
            let spawned = thread::Builder::new()
                .name(format!("wirecall-conn-{id}"))
                .spawn(move || {
                    if let Err(e) = serve_connection(conn, &handlers, &workers, max_request_len) {
                        debug!("[conn {id}] closed: {e}");
                    }
                    shutdown.forget(id);
                });
            match spawned {
                Ok(thread) => connections.push(thread),
                Err(e) => {
                    warn!("[conn {id}] no thread to serve it: {e}");
                    self.shutdown.forget(id);
                }
            }
        }

        info!("server stopping");
        self.shutdown.close_all();
        for conn in connections {
            if conn.join().is_err() {
                warn!("connection thread panicked");
            }
        }
        drop(workers);
        Ok(())
    }

    /// Runs [`listen`](Server::listen) on a background thread.
    pub fn spawn(self) -> Result<ServerHandle, ServerError> {
        let address = self.local_addr()?;
        let shutdown = Arc::clone(&self.shutdown);
        let thread = thread::Builder::new()
            .name(format!("wirecall-server-{}", address.port()))
            .spawn(move || self.listen())?;

        Ok(ServerHandle {
            address,
            shutdown,
            thread: Some(thread),
        })
    }
}

/// Handle to a server running on its own thread. Stops the server when dropped.
#[derive(Debug)]
pub struct ServerHandle {
    address: SocketAddr,
    shutdown: Arc<Shutdown>,
    thread: Option<thread::JoinHandle<Result<(), ServerError>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Stops accepting, closes live connections and waits for the workers to finish.
    pub fn stop(mut self) -> Result<(), ServerError> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Result<(), ServerError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.shutdown.stopping.store(true, Ordering::SeqCst);

        // wake the blocking accept
        let mut wake = self.address;
        if wake.ip().is_unspecified() {
            wake.set_ip(match wake.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        let _ = TcpStream::connect_timeout(&wake, Duration::from_secs(1));

        thread.join().map_err(|_| ServerError::Panicked)?
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_and_join() {
            warn!("server shutdown failed: {e}");
        }
    }
}

fn serve_connection(
    mut conn: Connection,
    handlers: &Arc<Handlers>,
    workers: &ThreadPool,
    max_request_len: usize,
) -> Result<(), ServerError> {
    let mut reader = RequestReader::with_limit(max_request_len);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let inbound = loop {
            if let Some(inbound) = reader.next_request() {
                break inbound;
            }
            let n = conn.read_raw(&mut buf)?;
            if n == 0 {
                debug!("[conn {}] peer closed", conn.id());
                return Ok(());
            }
            reader.push(&buf[..n]);
        };

        match inbound {
            Inbound::Ping => {
                conn.write_raw(PONG)?;
                conn.shutdown();
                return Ok(());
            }
            Inbound::Invalid => {
                warn!("[conn {}] invalid request", conn.id());
                conn.write_raw(INVALID_REQUEST)?;
                conn.shutdown();
                return Ok(());
            }
            Inbound::Transaction(transaction) => {
                // the connection travels to a worker and comes back once the reply is written
                let (done, returned) = mpsc::channel();
                let handlers = Arc::clone(handlers);
                workers.execute(move || {
                    let result = dispatch(&mut conn, &handlers, transaction);
                    let _ = done.send((conn, result));
                })?;

                let (back, result) = returned.recv().map_err(|_| ThreadPoolClosed)?;
                conn = back;
                result?;
            }
        }
    }
}

fn dispatch(
    conn: &mut Connection,
    handlers: &Handlers,
    transaction: Transaction,
) -> Result<(), ConnectionError> {
    let Transaction {
        transaction_id,
        handler_name,
        data,
        params,
    } = transaction;
    info!("[conn {}] {transaction_id} -> '{handler_name}'", conn.id());

    let outcome = match handlers.get(&handler_name) {
        Some(handler) => {
            let mut responder = Responder {
                conn: &mut *conn,
                transaction_id: &transaction_id,
            };
            panic::catch_unwind(AssertUnwindSafe(|| handler(data, params, &mut responder)))
                .unwrap_or_else(|panic| Err(HandlerError::from_panic(panic)))
        }
        None => Err(HandlerError::new(format!(
            "no handler registered for '{handler_name}'"
        ))),
    };

    match outcome {
        Ok(Reply::Data(value)) => conn.send_message(DATA_KEY, &value)?,
        Ok(Reply::Buffer(bytes)) => conn.send_buffer(DATA_KEY, &bytes)?,
        Ok(Reply::Stream(stream)) => conn.send_stream(DATA_KEY, stream)?,
        Ok(Reply::Done) => {}
        Err(err) => {
            warn!("[conn {}] {transaction_id} '{handler_name}' failed: {err}", conn.id());
            conn.send_message(ERROR_KEY, &err.to_message(&transaction_id))?;
        }
    }
    conn.done()
}
