//! tcpkit: a reactor-based TCP echo server and a matching client.
//!
//! Features:
//! - Single-owner reactors over a pluggable readiness backend (mio or poll(2))
//! - Per-connection FIFO outbound buffers with write-interest backpressure
//! - Horizontal scaling through `SO_REUSEPORT` listener sharding
//! - Graceful shutdown from any thread
//! - Configuration via CLI arguments or TOML file

#[cfg(not(unix))]
compile_error!("tcpkit supports Unix platforms only (Linux, macOS)");

pub mod client;
pub mod config;
pub mod logging;
pub mod runtime;
pub mod server;

pub use client::{Client, ClientError};
pub use server::{Server, ServerError, ServerOptions, ShutdownHandle};
