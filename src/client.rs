//! Blocking TCP client for talking to the echo server.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, info};

/// Bytes returned by a single [`Client::receive`] at most.
pub const RECEIVE_BUFFER_SIZE: usize = 1024;

/// Client errors.
#[derive(Debug)]
pub enum ClientError {
    /// The IP string does not parse.
    InvalidAddress(String),
    /// The TCP connection could not be established.
    Connect(SocketAddr, io::Error),
    /// Send or receive failed on an established connection.
    Io(io::Error),
    /// No connection is open.
    NotConnected,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::InvalidAddress(ip) => write!(f, "Invalid address '{ip}'"),
            ClientError::Connect(addr, e) => write!(f, "Failed to connect to {addr}: {e}"),
            ClientError::Io(e) => write!(f, "Connection error: {e}"),
            ClientError::NotConnected => write!(f, "Not connected"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Connect(_, e) | ClientError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

/// A single blocking connection. Dropping the client disconnects it.
#[derive(Debug, Default)]
pub struct Client {
    stream: Option<TcpStream>,
    timeout: Option<Duration>,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound connect, send and receive calls by `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            stream: None,
            timeout: Some(timeout),
        }
    }

    /// Open a connection to `ip:port`, replacing any open one.
    pub fn connect(&mut self, ip: &str, port: u16) -> Result<(), ClientError> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| ClientError::InvalidAddress(ip.to_string()))?;
        let addr = SocketAddr::new(ip, port);

        self.disconnect();

        let stream = match self.timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        }
        .map_err(|e| ClientError::Connect(addr, e))?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;

        info!(server = %addr, "Connected to server");
        self.stream = Some(stream);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Write all of `data`.
    pub fn send(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        stream.write_all(data)?;
        debug!(len = data.len(), "Sent");
        Ok(())
    }

    /// One read of up to [`RECEIVE_BUFFER_SIZE`] bytes.
    ///
    /// May return fewer bytes than were sent; an empty vector means the
    /// server closed the connection.
    pub fn receive(&mut self) -> Result<Vec<u8>, ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        let n = loop {
            match stream.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        buf.truncate(n);
        Ok(buf)
    }

    /// Read until exactly `len` bytes have arrived.
    pub fn receive_exact(&mut self, len: usize) -> Result<Vec<u8>, ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Close the connection. Does nothing when not connected.
    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone.
            let _ = stream.shutdown(Shutdown::Both);
            info!("Disconnected from server");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}
