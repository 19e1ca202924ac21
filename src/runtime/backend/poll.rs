//! Portable `poll(2)` readiness backend.
//!
//! Level-triggered: a handle keeps being reported for as long as it is
//! ready. The interest set is kept as a dense `pollfd` array handed to the
//! kernel on every wait; removal swaps the last entry into the freed slot.
//! When more handles are ready than one wait may report, the next scan
//! starts where the previous one stopped, so every ready handle gets its
//! turn.
//!
//! Wake-ups use a non-blocking socket pair. The read end is polled like any
//! other handle and drained whenever it fires.

use super::{empty_interest, Event, Interest, Readiness, Wake};
use crate::runtime::token::Token;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

/// Readiness backend over `poll(2)`.
pub struct PollBackend {
    fds: Vec<libc::pollfd>,
    tokens: Vec<Token>,
    index: HashMap<RawFd, usize>,
    /// Read end of the wake socket pair, if a waker was created.
    wake_rx: Option<UnixStream>,
    capacity: usize,
    /// Index the next result scan starts at.
    cursor: usize,
}

impl PollBackend {
    /// Create an empty backend returning at most `capacity` events per wait.
    pub fn new(capacity: usize) -> Self {
        Self {
            fds: Vec::new(),
            tokens: Vec::new(),
            index: HashMap::new(),
            wake_rx: None,
            capacity: capacity.max(1),
            cursor: 0,
        }
    }

    /// Number of registered handles, including the wake handle.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    fn drain_wake(&mut self) {
        if let Some(rx) = self.wake_rx.as_mut() {
            let mut buf = [0u8; 64];
            while let Ok(n) = rx.read(&mut buf) {
                if n == 0 {
                    break;
                }
            }
        }
    }
}

fn to_events(interest: Interest) -> io::Result<libc::c_short> {
    if interest.is_empty() {
        return Err(empty_interest());
    }
    let mut events = 0;
    if interest.readable {
        events |= libc::POLLIN;
    }
    if interest.writable {
        events |= libc::POLLOUT;
    }
    Ok(events)
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        // Round up so a sub-millisecond timeout does not turn into a busy poll.
        Some(t) => {
            let ms = t.as_millis() + u128::from(t.subsec_nanos() % 1_000_000 != 0);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

impl Readiness for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn is_edge_triggered(&self) -> bool {
        false
    }

    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let events = to_events(interest)?;
        if self.index.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {fd} already registered"),
            ));
        }
        self.index.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        self.tokens.push(token);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let events = to_events(interest)?;
        let idx = *self
            .index
            .get(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "fd not registered"))?;
        self.fds[idx].events = events;
        self.tokens[idx] = token;
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd, _token: Token) -> io::Result<()> {
        let idx = self
            .index
            .remove(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "fd not registered"))?;
        self.fds.swap_remove(idx);
        self.tokens.swap_remove(idx);
        if let Some(moved) = self.fds.get(idx) {
            self.index.insert(moved.fd, idx);
        }
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();
        let timeout = timeout_ms(timeout);

        let ready = loop {
            // SAFETY: `fds` is a live, properly initialized array of
            // `fds.len()` pollfd entries that the kernel only writes
            // `revents` into.
            let rc = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    timeout,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        if ready == 0 {
            return Ok(());
        }

        let wake_fd = self.wake_rx.as_ref().map(AsRawFd::as_raw_fd);
        let mut woke = false;

        let len = self.fds.len();
        let start = self.cursor % len;
        let mut scanned = 0;
        while scanned < len {
            let idx = (start + scanned) % len;
            let pfd = self.fds[idx];
            if pfd.revents != 0 {
                if events.len() == self.capacity {
                    break;
                }
                if Some(pfd.fd) == wake_fd {
                    woke = true;
                }
                let revents = pfd.revents;
                events.push(Event {
                    token: self.tokens[idx],
                    readable: revents & libc::POLLIN != 0,
                    writable: revents & libc::POLLOUT != 0,
                    error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                    hangup: revents & libc::POLLHUP != 0,
                });
            }
            scanned += 1;
        }
        // Handles left unreported come first next time.
        self.cursor = (start + scanned) % len;

        if woke {
            self.drain_wake();
        }

        Ok(())
    }

    fn waker(&mut self, token: Token) -> io::Result<Arc<dyn Wake>> {
        if self.wake_rx.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "waker already created",
            ));
        }
        let (rx, tx) = UnixStream::pair()?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;
        self.register(rx.as_raw_fd(), token, Interest::READABLE)?;
        self.wake_rx = Some(rx);
        Ok(Arc::new(PipeWaker { tx }))
    }
}

/// Write end of the wake socket pair.
struct PipeWaker {
    tx: UnixStream,
}

impl Wake for PipeWaker {
    fn wake(&self) -> io::Result<()> {
        match (&self.tx).write(&[1]) {
            Ok(_) => Ok(()),
            // A full pipe already guarantees a pending wake-up.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}
