use std::{
    io,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use thiserror::Error;

use super::{Connection, ParserConfig};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no connection to {address} became available within {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("failed to resolve '{address}': {source}")]
    Resolve { address: String, source: io::Error },

    #[error("failed to connect to {address}: {source}")]
    Connect { address: String, source: io::Error },
}

/// Pool configuration.
///
/// Defaults: 10 connections, 30 second acquire timeout, 5 second connect timeout, no read
/// timeout, `TCP_NODELAY` on.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of open connections, leased or idle.
    pub max_connections: usize,
    /// How long `acquire` waits for a slot when the pool is at capacity.
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    /// Socket read timeout. `None` waits for the peer indefinitely.
    pub read_timeout: Option<Duration>,
    pub nodelay: bool,
    pub parser: ParserConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            read_timeout: None,
            nodelay: true,
            parser: ParserConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<Connection>,
    /// Connections handed out or idle, plus slots reserved by in-progress connects.
    open: usize,
}

/// Bounded set of connections to one server.
///
/// A connection handed out by [`acquire`](Pool::acquire) is owned by the caller until it
/// goes back through [`release`](Pool::release) or [`destroy`](Pool::destroy), so a socket
/// never carries two transactions at once. Connections are created lazily and checked with
/// [`Connection::is_healthy`] when borrowed and when returned; unhealthy ones are retired.
///
/// `acquire`, `release` and `destroy` are the only operations that touch the shared state,
/// and each does so under the pool's lock.
#[derive(Debug)]
pub struct Pool {
    address: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl Pool {
    pub fn new(address: impl Into<String>, config: PoolConfig) -> Self {
        Self {
            address: address.into(),
            config,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open
    }

    pub fn idle_connections(&self) -> usize {
        self.lock().idle.len()
    }

    /// Leases a healthy connection, creating one if the pool is below capacity and waiting
    /// for a release otherwise.
    pub fn acquire(&self) -> Result<Connection, PoolError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let mut state = self.lock();

        loop {
            while let Some(conn) = state.idle.pop() {
                if conn.is_healthy() {
                    debug!("[pool {}] reusing conn {}", self.address, conn.id());
                    return Ok(conn);
                }
                warn!("[pool {}] retiring unhealthy conn {}", self.address, conn.id());
                conn.shutdown();
                state.open = state.open.saturating_sub(1);
            }

            if state.open < self.config.max_connections {
                state.open += 1;
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Timeout {
                    address: self.address.clone(),
                    timeout: self.config.acquire_timeout,
                });
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        drop(state);

        match self.connect() {
            Ok(conn) => Ok(conn),
            Err(err) => {
                self.lock().open -= 1;
                self.available.notify_one();
                Err(err)
            }
        }
    }

    /// Returns a leased connection to the idle set, or retires it if it is no longer
    /// healthy. Any state left over from the finished transaction is cleared first.
    pub fn release(&self, mut conn: Connection) {
        conn.reset();
        if !conn.is_healthy() {
            warn!("[pool {}] conn {} unhealthy on release", self.address, conn.id());
            self.destroy(conn);
            return;
        }

        debug!("[pool {}] conn {} released", self.address, conn.id());
        self.lock().idle.push(conn);
        self.available.notify_one();
    }

    /// Closes a leased connection and frees its slot.
    pub fn destroy(&self, conn: Connection) {
        debug!("[pool {}] destroying conn {}", self.address, conn.id());
        conn.shutdown();
        drop(conn);

        let mut state = self.lock();
        state.open = state.open.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn connect(&self) -> Result<Connection, PoolError> {
        let addrs: Vec<SocketAddr> = self
            .address
            .to_socket_addrs()
            .map_err(|source| PoolError::Resolve {
                address: self.address.clone(),
                source,
            })?
            .collect();

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => return self.wrap(stream),
                Err(err) => last_err = err,
            }
        }
        Err(PoolError::Connect {
            address: self.address.clone(),
            source: last_err,
        })
    }

    fn wrap(&self, stream: TcpStream) -> Result<Connection, PoolError> {
        let configure = |stream: &TcpStream| -> io::Result<()> {
            stream.set_nodelay(self.config.nodelay)?;
            stream.set_read_timeout(self.config.read_timeout)
        };
        configure(&stream).map_err(|source| PoolError::Connect {
            address: self.address.clone(),
            source,
        })?;

        let conn = Connection::with_parser(stream, self.config.parser.clone());
        info!("[pool {}] opened conn {}", self.address, conn.id());
        Ok(conn)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        for conn in self.lock().idle.drain(..) {
            conn.shutdown();
        }
    }
}
