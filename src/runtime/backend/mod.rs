//! Readiness backends.
//!
//! A backend answers one question for the reactor: which of the registered
//! handles became readable, writable, or failed. The reactor is written once
//! against the [`Readiness`] trait; the concrete multiplexer is picked when
//! the server is constructed:
//!
//! - [`MioBackend`]: epoll on Linux, kqueue on macOS (edge-triggered)
//! - [`PollBackend`]: portable `poll(2)` fallback (level-triggered)

mod mio_impl;
mod poll;

pub use self::mio_impl::MioBackend;
pub use self::poll::PollBackend;

use crate::runtime::token::Token;
use serde::Deserialize;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Readiness a handle is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub const READ_WRITE: Interest = Interest {
        readable: true,
        writable: true,
    };

    /// Check if no readiness is requested at all.
    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }
}

/// A readiness event reported by [`Readiness::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// The handle reported an error condition.
    pub error: bool,
    /// Both directions of the handle are closed.
    pub hangup: bool,
}

impl Event {
    /// Event carrying no readiness, used when folding several OS events for
    /// the same token together.
    pub fn empty(token: Token) -> Self {
        Self {
            token,
            readable: false,
            writable: false,
            error: false,
            hangup: false,
        }
    }

    /// Check if the handle is unusable regardless of other readiness.
    pub fn is_fatal(&self) -> bool {
        self.error || self.hangup
    }
}

/// Handle that interrupts a blocked [`Readiness::wait`] from another thread.
pub trait Wake: Send + Sync {
    fn wake(&self) -> io::Result<()>;
}

impl Wake for mio::Waker {
    fn wake(&self) -> io::Result<()> {
        mio::Waker::wake(self)
    }
}

/// OS readiness multiplexer.
///
/// `register`/`modify` are called on every empty/non-empty transition of a
/// connection's outbound buffer, so implementations must keep them cheap.
pub trait Readiness: Send {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Whether a read-ready notification is only delivered once per
    /// readiness edge. Callers must then drain the handle until it would
    /// block before waiting again.
    fn is_edge_triggered(&self) -> bool;

    /// Start watching `fd` for `interest`.
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Replace the interest of an already registered `fd`.
    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd`.
    fn unregister(&mut self, fd: RawFd, token: Token) -> io::Result<()>;

    /// Block until at least one handle is ready or `timeout` elapses
    /// (`None` waits forever).
    ///
    /// `events` is cleared first. Interrupted waits are retried.
    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()>;

    /// Create a wake handle. Waking reports an event for `token`.
    fn waker(&mut self, token: Token) -> io::Result<Arc<dyn Wake>>;
}

/// Which backend the server constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Best backend for the platform.
    #[default]
    Auto,
    /// mio: epoll on Linux, kqueue on macOS.
    Mio,
    /// poll(2) fallback.
    Poll,
}

impl BackendKind {
    /// Resolve `Auto` to a concrete backend.
    pub fn resolve(self) -> BackendKind {
        match self {
            BackendKind::Auto => BackendKind::Mio,
            other => other,
        }
    }

    /// Construct the backend.
    ///
    /// `event_capacity` bounds the number of events returned by one wait.
    pub fn build(self, event_capacity: usize) -> io::Result<Box<dyn Readiness>> {
        match self.resolve() {
            BackendKind::Poll => Ok(Box::new(PollBackend::new(event_capacity))),
            _ => Ok(Box::new(MioBackend::new(event_capacity)?)),
        }
    }
}

fn empty_interest() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "empty readiness interest")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::token::WAKE_TOKEN;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::thread;
    use std::time::Instant;

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

    fn backends() -> Vec<Box<dyn Readiness>> {
        vec![
            BackendKind::Mio.build(64).unwrap(),
            BackendKind::Poll.build(64).unwrap(),
        ]
    }

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (server, client)
    }

    fn wait_for(backend: &mut dyn Readiness, token: Token) -> Event {
        let mut events = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            backend.wait(&mut events, TIMEOUT).unwrap();
            if let Some(event) = events.iter().find(|e| e.token == token) {
                return *event;
            }
        }
        panic!("no event for token {token}");
    }

    #[test]
    fn test_auto_resolves_once() {
        assert_eq!(BackendKind::Auto.resolve(), BackendKind::Mio);
        assert_eq!(BackendKind::Poll.resolve(), BackendKind::Poll);
        assert_eq!(BackendKind::Auto.build(8).unwrap().name(), "mio");
        assert_eq!(BackendKind::Poll.build(8).unwrap().name(), "poll");
    }

    #[test]
    fn test_readable_after_peer_write() {
        for mut backend in backends() {
            let (server, mut client) = connected_pair();
            backend
                .register(server.as_raw_fd(), Token(7), Interest::READABLE)
                .unwrap();

            client.write_all(b"ping").unwrap();

            let event = wait_for(backend.as_mut(), Token(7));
            assert!(event.readable, "{}: {:?}", backend.name(), event);
            assert!(!event.is_fatal());
        }
    }

    #[test]
    fn test_modify_adds_write_interest() {
        for mut backend in backends() {
            let (server, _client) = connected_pair();
            let fd = server.as_raw_fd();
            backend.register(fd, Token(3), Interest::READABLE).unwrap();
            backend.modify(fd, Token(3), Interest::READ_WRITE).unwrap();

            let event = wait_for(backend.as_mut(), Token(3));
            assert!(event.writable, "{}: {:?}", backend.name(), event);
        }
    }

    #[test]
    fn test_unregistered_handle_is_silent() {
        for mut backend in backends() {
            let (server, mut client) = connected_pair();
            let fd = server.as_raw_fd();
            backend.register(fd, Token(1), Interest::READABLE).unwrap();
            backend.unregister(fd, Token(1)).unwrap();

            client.write_all(b"ignored").unwrap();

            let mut events = Vec::new();
            backend
                .wait(&mut events, Some(Duration::from_millis(50)))
                .unwrap();
            assert!(events.is_empty(), "{}: {:?}", backend.name(), events);
        }
    }

    #[test]
    fn test_empty_interest_rejected() {
        let empty = Interest {
            readable: false,
            writable: false,
        };
        for mut backend in backends() {
            let (server, _client) = connected_pair();
            let err = backend
                .register(server.as_raw_fd(), Token(1), empty)
                .unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
    }

    #[test]
    fn test_waker_interrupts_infinite_wait() {
        for mut backend in backends() {
            let waker = backend.waker(WAKE_TOKEN).unwrap();

            let handle = thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                waker.wake().unwrap();
            });

            let mut events = Vec::new();
            backend.wait(&mut events, None).unwrap();
            handle.join().unwrap();

            assert!(
                events.iter().any(|e| e.token == WAKE_TOKEN),
                "{}: {:?}",
                backend.name(),
                events
            );
        }
    }

    #[test]
    fn test_wait_times_out_without_events() {
        for mut backend in backends() {
            let mut events = vec![Event::empty(Token(9))];
            let start = Instant::now();
            backend
                .wait(&mut events, Some(Duration::from_millis(20)))
                .unwrap();
            assert!(events.is_empty());
            assert!(start.elapsed() >= Duration::from_millis(10));
        }
    }
}
