//! Connection state and the connection table.
//!
//! Each connection owns its socket and its outbound buffer. Readiness
//! interest is derived from that state rather than stored: read interest is
//! always on while the connection is active, write interest is on exactly
//! while the outbound buffer holds bytes.

use crate::runtime::backend::Interest;
use crate::runtime::buffer::OutboundBuffer;
use crate::runtime::token::Token;
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered for read, and for write while output is queued.
    Active,
    /// Torn down; the entry is about to leave the table.
    Closing,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
    outbound: OutboundBuffer,
}

impl Connection {
    /// Wrap an accepted, already non-blocking stream.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Active,
            outbound: OutboundBuffer::new(),
        }
    }

    /// Socket descriptor used for backend registration.
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn outbound(&self) -> &OutboundBuffer {
        &self.outbound
    }

    pub fn outbound_mut(&mut self) -> &mut OutboundBuffer {
        &mut self.outbound
    }

    /// One non-blocking receive into `buf`.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    /// One non-blocking send of the queued bytes. The caller consumes what
    /// was actually written.
    pub fn send_head(&mut self) -> io::Result<usize> {
        self.stream.write(self.outbound.chunk())
    }

    /// Interest this connection should currently be registered with.
    pub fn interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READ_WRITE
        }
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }
}

/// Table of open connections keyed by token.
///
/// Backed by a slab, so keys are only handed out again after the previous
/// holder was removed.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity; the connection is
    /// dropped, which closes its socket.
    pub fn insert(&mut self, conn: Connection) -> Option<Token> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(Token(self.connections.insert(conn)))
    }

    pub fn get(&self, token: Token) -> Option<&Connection> {
        self.connections.get(token.0)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.get_mut(token.0)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        self.connections.try_remove(token.0)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains(token.0)
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Tokens of every open connection.
    pub fn tokens(&self) -> Vec<Token> {
        self.connections.iter().map(|(key, _)| Token(key)).collect()
    }
}
