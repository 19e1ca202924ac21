//! Listening socket setup and accept draining.

use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, warn};

/// Socket options applied by [`Acceptor::bind`].
#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    /// Listen backlog.
    pub backlog: i32,
    /// Set `SO_REUSEPORT` so several listeners can share the port. Off, a
    /// port already in use is a bind error.
    pub reuse_port: bool,
    /// Set `TCP_NODELAY` on accepted connections.
    pub nodelay: bool,
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        Self {
            backlog: 1024,
            reuse_port: false,
            nodelay: true,
        }
    }
}

/// Startup failure of the listening socket.
#[derive(Debug)]
pub enum AcceptorError {
    /// Socket creation or option setting failed.
    Socket(io::Error),
    /// Binding failed: address in use, permission denied, invalid address.
    Bind(String, io::Error),
    /// Listening failed.
    Listen(SocketAddr, io::Error),
}

impl fmt::Display for AcceptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptorError::Socket(e) => write!(f, "Socket creation failed: {e}"),
            AcceptorError::Bind(addr, e) => write!(f, "Bind to {addr} failed: {e}"),
            AcceptorError::Listen(addr, e) => write!(f, "Listen on {addr} failed: {e}"),
        }
    }
}

impl std::error::Error for AcceptorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AcceptorError::Socket(e) | AcceptorError::Bind(_, e) | AcceptorError::Listen(_, e) => {
                Some(e)
            }
        }
    }
}

/// Parse a host literal and port into a socket address.
///
/// Only IP literals are accepted; `0.0.0.0` and `::` bind every interface.
pub fn parse_addr(host: &str, port: u16) -> Result<SocketAddr, AcceptorError> {
    host.trim()
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|e| {
            AcceptorError::Bind(
                format!("{host}:{port}"),
                io::Error::new(io::ErrorKind::InvalidInput, e),
            )
        })
}

/// Owner of a non-blocking listening socket.
#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    nodelay: bool,
}

impl Acceptor {
    /// Create, configure, bind and listen.
    pub fn bind(addr: SocketAddr, options: &AcceptorOptions) -> Result<Self, AcceptorError> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(AcceptorError::Socket)?;

        socket
            .set_reuse_address(true)
            .map_err(AcceptorError::Socket)?;
        if options.reuse_port {
            socket.set_reuse_port(true).map_err(AcceptorError::Socket)?;
        }
        socket
            .set_nonblocking(true)
            .map_err(AcceptorError::Socket)?;

        socket
            .bind(&addr.into())
            .map_err(|e| AcceptorError::Bind(addr.to_string(), e))?;
        socket
            .listen(options.backlog)
            .map_err(|e| AcceptorError::Listen(addr, e))?;

        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr().map_err(AcceptorError::Socket)?;

        debug!(addr = %local_addr, backlog = options.backlog, "Listening");

        Ok(Self {
            listener,
            local_addr,
            nodelay: options.nodelay,
        })
    }

    /// Address actually bound, with the resolved port if port 0 was asked.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accept every pending connection until the listener would block.
    ///
    /// Each stream is switched to non-blocking mode before it is handed to
    /// `on_accept`. Aborted handshakes and interruptions are skipped. Any
    /// other accept error ends the drain and is returned; connections may
    /// still be queued then (`EMFILE`, `ENFILE`, `ENOBUFS`) and the caller
    /// has to retry without waiting for a new readiness event.
    pub fn accept_pending<F>(&self, mut on_accept: F) -> io::Result<usize>
    where
        F: FnMut(TcpStream, SocketAddr),
    {
        let mut accepted = 0;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.prepare(&stream) {
                        warn!(peer = %peer, error = %e, "Failed to configure accepted socket");
                        continue;
                    }
                    accepted += 1;
                    on_accept(stream, peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(accepted),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn prepare(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(())
    }
}
