//! mio readiness backend.
//!
//! Uses epoll on Linux and kqueue on macOS. mio registrations are
//! edge-triggered, so the reactor drains sockets after every read-ready
//! notification.

use super::{empty_interest, Event, Interest, Readiness, Wake};
use crate::runtime::token::Token;
use mio::unix::SourceFd;
use mio::{Events, Poll};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Readiness backend over `mio::Poll`.
pub struct MioBackend {
    poll: Poll,
    events: Events,
}

impl MioBackend {
    /// Create a new poll instance returning at most `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
        })
    }
}

fn to_mio(interest: Interest) -> io::Result<mio::Interest> {
    match (interest.readable, interest.writable) {
        (true, true) => Ok(mio::Interest::READABLE | mio::Interest::WRITABLE),
        (true, false) => Ok(mio::Interest::READABLE),
        (false, true) => Ok(mio::Interest::WRITABLE),
        (false, false) => Err(empty_interest()),
    }
}

impl Readiness for MioBackend {
    fn name(&self) -> &'static str {
        "mio"
    }

    fn is_edge_triggered(&self) -> bool {
        true
    }

    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let interest = to_mio(interest)?;
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token.into(), interest)
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let interest = to_mio(interest)?;
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token.into(), interest)
    }

    fn unregister(&mut self, fd: RawFd, _token: Token) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        for event in self.events.iter() {
            events.push(Event {
                token: event.token().into(),
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                hangup: event.is_read_closed() && event.is_write_closed(),
            });
        }

        Ok(())
    }

    fn waker(&mut self, token: Token) -> io::Result<Arc<dyn Wake>> {
        let waker = mio::Waker::new(self.poll.registry(), token.into())?;
        Ok(Arc::new(waker))
    }
}
