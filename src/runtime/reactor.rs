//! Reactor loop.
//!
//! One reactor owns one readiness backend, one listening socket and one
//! connection table, and is driven by exactly one thread. The listener is
//! registered with the backend like any connection, so a single wait call
//! reports both new connections and data readiness; nothing else ever
//! touches the table.
//!
//! Per connection:
//!
//! ```text
//! read-ready   -> recv until would-block, append to outbound buffer,
//!                 arm write interest on the empty -> non-empty edge
//! write-ready  -> one send from the buffer head, consume what was sent,
//!                 disarm write interest on the non-empty -> empty edge
//! error/hangup -> close
//! recv == 0    -> close
//! ```
//!
//! Closing unregisters the socket and marks the connection `Closing` in a
//! single call. Closing connections stay in the table until the end of the
//! turn, so their keys are not handed to connections accepted later in the
//! same batch and any further event for them is ignored; then they are
//! removed and dropped.
//!
//! An accept that fails for lack of resources (`EMFILE` and friends) leaves
//! connections queued that no new readiness event will announce. The reactor
//! then retries the accept after every wait, at most
//! `ACCEPT_RETRY_INTERVAL` apart, until a drain completes.

use crate::runtime::acceptor::Acceptor;
use crate::runtime::backend::{Event, Interest, Readiness, Wake};
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry};
use crate::runtime::stats::Stats;
use crate::runtime::token::{Token, LISTENER_TOKEN, WAKE_TOKEN};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Reads per read-ready event on level-triggered backends. Anything left is
/// reported again by the next wait.
const LEVEL_READ_BUDGET: usize = 16;

/// Pause after a failed wait so a persistent backend failure does not spin.
const WAIT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Longest wait while queued connections could not be accepted.
const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Tuning knobs for a reactor.
#[derive(Debug, Clone)]
pub struct ReactorOptions {
    /// Connections this reactor holds at most; extra accepts are closed.
    pub max_connections: usize,
    /// Size of a single non-blocking receive.
    pub read_chunk: usize,
    /// Upper bound on one readiness wait, so shutdown is observed even
    /// without a wake-up. `None` waits until an event arrives.
    pub poll_timeout: Option<Duration>,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            read_chunk: 1024,
            poll_timeout: Some(Duration::from_millis(100)),
        }
    }
}

/// Single-owner event loop echoing every connection's input back to it.
pub struct Reactor {
    id: usize,
    backend: Box<dyn Readiness>,
    acceptor: Acceptor,
    connections: ConnectionRegistry,
    events: Vec<Event>,
    scratch: Vec<u8>,
    poll_timeout: Option<Duration>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Stats>,
    waker: Arc<dyn Wake>,
    /// The last accept drain stopped on an error.
    accept_stalled: bool,
    /// Connections closed during the current turn.
    closing: Vec<Token>,
}

impl Reactor {
    /// Register the listener and a wake handle with `backend`.
    pub fn new(
        id: usize,
        mut backend: Box<dyn Readiness>,
        acceptor: Acceptor,
        options: &ReactorOptions,
        shutdown: Arc<AtomicBool>,
        stats: Arc<Stats>,
    ) -> io::Result<Self> {
        backend.register(acceptor.fd(), LISTENER_TOKEN, Interest::READABLE)?;
        let waker = backend.waker(WAKE_TOKEN)?;

        Ok(Self {
            id,
            backend,
            acceptor,
            connections: ConnectionRegistry::new(options.max_connections),
            events: Vec::new(),
            scratch: vec![0u8; options.read_chunk.max(1)],
            poll_timeout: options.poll_timeout,
            shutdown,
            stats,
            waker,
            accept_stalled: false,
            closing: Vec::new(),
        })
    }

    /// Handle that interrupts this reactor's wait.
    pub fn waker(&self) -> Arc<dyn Wake> {
        Arc::clone(&self.waker)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Number of open connections in this reactor's table.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until the shutdown flag is raised, then close every connection.
    pub fn run(&mut self) {
        info!(
            worker = self.id,
            addr = %self.acceptor.local_addr(),
            backend = self.backend.name(),
            edge_triggered = self.backend.is_edge_triggered(),
            max_connections = self.connections.capacity(),
            "Reactor started"
        );

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.turn() {
                warn!(worker = self.id, error = %e, "Readiness wait failed");
                thread::sleep(WAIT_ERROR_BACKOFF);
            }
        }

        self.close_all();
        info!(worker = self.id, "Reactor stopped");
    }

    /// Wait once and dispatch every reported event.
    ///
    /// Returns the number of events handled.
    pub fn turn(&mut self) -> io::Result<usize> {
        let timeout = if self.accept_stalled {
            Some(
                self.poll_timeout
                    .map_or(ACCEPT_RETRY_INTERVAL, |t| t.min(ACCEPT_RETRY_INTERVAL)),
            )
        } else {
            self.poll_timeout
        };

        let mut events = std::mem::take(&mut self.events);
        let result = self.backend.wait(&mut events, timeout);

        if result.is_ok() {
            for event in &events {
                self.dispatch(*event);
            }
        }
        self.reap_closed();

        if self.accept_stalled && !events.iter().any(|e| e.token == LISTENER_TOKEN) {
            self.accept();
        }

        let handled = events.len();
        self.events = events;
        result.map(|()| handled)
    }

    fn dispatch(&mut self, event: Event) {
        match event.token {
            LISTENER_TOKEN => self.accept(),
            WAKE_TOKEN => trace!(worker = self.id, "Woken up"),
            token => {
                if let Err(e) = self.handle_connection_event(token, event) {
                    debug!(worker = self.id, conn_id = token.0, error = %e, "Connection error");
                    self.close_connection(token);
                }
            }
        }
    }

    fn accept(&mut self) {
        let Self {
            id,
            acceptor,
            connections,
            backend,
            stats,
            ..
        } = self;

        let drained = acceptor.accept_pending(|stream, peer| {
            let fd = stream.as_raw_fd();
            let Some(token) = connections.insert(Connection::new(stream, peer)) else {
                warn!(worker = *id, peer = %peer, "Connection limit reached");
                stats.connection_rejected();
                return;
            };

            if let Err(e) = backend.register(fd, token, Interest::READABLE) {
                warn!(worker = *id, peer = %peer, error = %e, "Failed to register connection");
                connections.remove(token);
                return;
            }

            stats.connection_opened();
            debug!(worker = *id, conn_id = token.0, peer = %peer, "Accepted connection");
        });

        match drained {
            Ok(_) => self.accept_stalled = false,
            Err(e) if self.accept_stalled => {
                debug!(worker = self.id, error = %e, "Accept still failing");
            }
            Err(e) => {
                warn!(worker = self.id, error = %e, "Accept failed, will retry");
                self.accept_stalled = true;
            }
        }
    }

    fn handle_connection_event(&mut self, token: Token, event: Event) -> io::Result<()> {
        // Stale event for a connection closed earlier.
        match self.connections.get(token) {
            Some(conn) if conn.state() == ConnState::Active => {}
            _ => return Ok(()),
        }

        if event.is_fatal() {
            let error = self
                .connections
                .get(token)
                .and_then(|conn| conn.stream().take_error().ok().flatten());
            return Err(error.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionReset, "hangup")
            }));
        }

        if event.readable {
            self.handle_readable(token)?;
        }

        if event.writable {
            self.handle_writable(token)?;
        }

        Ok(())
    }

    fn handle_readable(&mut self, token: Token) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        let budget = if self.backend.is_edge_triggered() {
            usize::MAX
        } else {
            LEVEL_READ_BUDGET
        };

        let mut received = 0;
        let mut reads = 0;
        let result = loop {
            if reads == budget {
                break Ok(());
            }
            match conn.recv(&mut self.scratch) {
                Ok(0) => {
                    break Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed connection",
                    ));
                }
                Ok(n) => {
                    reads += 1;
                    received += n;
                    if conn.outbound_mut().append(&self.scratch[..n]) {
                        if let Err(e) = self.backend.modify(conn.fd(), token, conn.interest()) {
                            break Err(e);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            };
        };

        if received > 0 {
            self.stats.received(received);
            trace!(
                worker = self.id,
                conn_id = token.0,
                bytes = received,
                queued = conn.outbound().len(),
                "Received"
            );
        }

        result
    }

    fn handle_writable(&mut self, token: Token) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        if conn.outbound().is_empty() {
            return Ok(());
        }

        let n = loop {
            match conn.send_head() {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        self.stats.sent(n);
        let drained = conn.outbound_mut().consume(n);
        trace!(
            worker = self.id,
            conn_id = token.0,
            bytes = n,
            remaining = conn.outbound().len(),
            "Sent"
        );

        if drained {
            self.backend.modify(conn.fd(), token, conn.interest())?;
        }

        Ok(())
    }

    /// Unregister and mark `token` closing; the socket is dropped by
    /// [`Reactor::reap_closed`].
    fn close_connection(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(token) else {
            return;
        };
        if conn.state() != ConnState::Active {
            return;
        }
        conn.close();
        if let Err(e) = self.backend.unregister(conn.fd(), token) {
            debug!(worker = self.id, conn_id = token.0, error = %e, "Deregister failed");
        }
        self.closing.push(token);
    }

    fn reap_closed(&mut self) {
        for token in self.closing.drain(..) {
            if let Some(conn) = self.connections.remove(token) {
                self.stats.connection_closed();
                debug!(
                    worker = self.id,
                    conn_id = token.0,
                    peer = %conn.peer(),
                    dropped = conn.outbound().len(),
                    "Connection closed"
                );
            }
        }
    }

    fn close_all(&mut self) {
        for token in self.connections.tokens() {
            self.close_connection(token);
        }
        self.reap_closed();
    }
}
