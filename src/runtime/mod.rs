//! Readiness-based connection engine.
//!
//! Building blocks, leaf first:
//! - `OutboundBuffer`: per-connection FIFO of bytes waiting to be echoed
//! - `ConnectionRegistry`: slab-backed table of open connections
//! - `Readiness`: trait over the OS multiplexer, with mio and poll(2) backends
//! - `Acceptor`: listening socket setup and accept draining
//! - `Reactor`: the single-owner loop tying them together

pub mod acceptor;
pub mod backend;
mod buffer;
mod connection;
pub mod reactor;
mod stats;
mod token;

pub use acceptor::{parse_addr, Acceptor, AcceptorError, AcceptorOptions};
pub use backend::{BackendKind, Event, Interest, MioBackend, PollBackend, Readiness, Wake};
pub use buffer::OutboundBuffer;
pub use connection::{ConnState, Connection, ConnectionRegistry};
pub use reactor::{Reactor, ReactorOptions};
pub use stats::{Stats, StatsSnapshot};
pub use token::{Token, LISTENER_TOKEN, WAKE_TOKEN};
