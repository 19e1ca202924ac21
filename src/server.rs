//! Echo server facade.
//!
//! `initialize` binds the listening socket(s) and builds the reactors,
//! `start` runs them until a [`ShutdownHandle`] stops the server. With more
//! than one worker every reactor gets its own listener on the same port
//! (`SO_REUSEPORT`), its own backend and its own connection table; the
//! kernel spreads incoming connections across them and no connection state
//! is ever shared between threads.

use crate::runtime::{
    parse_addr, Acceptor, AcceptorError, AcceptorOptions, BackendKind, Reactor, ReactorOptions,
    Stats, Wake,
};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// Everything needed to build the reactors.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub backend: BackendKind,
    /// Number of independent reactors.
    pub workers: usize,
    /// Events returned by a single readiness wait at most.
    pub event_capacity: usize,
    pub acceptor: AcceptorOptions,
    pub reactor: ReactorOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            workers: 1,
            event_capacity: 1024,
            acceptor: AcceptorOptions::default(),
            reactor: ReactorOptions::default(),
        }
    }
}

/// Server lifecycle errors.
#[derive(Debug)]
pub enum ServerError {
    /// Socket creation or option setting failed.
    Socket(io::Error),
    /// Binding failed: address in use, permission denied, invalid address.
    Bind { addr: String, source: io::Error },
    /// Listening failed.
    Listen { addr: SocketAddr, source: io::Error },
    /// The readiness backend could not be created or set up.
    Backend(io::Error),
    /// A reactor thread could not be spawned.
    Spawn(io::Error),
    /// `start` was called without a successful `initialize`.
    NotInitialized,
    /// `initialize` was called twice.
    AlreadyInitialized,
    /// A reactor thread panicked.
    WorkerPanicked(usize),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Socket(e) => write!(f, "Socket creation failed: {e}"),
            ServerError::Bind { addr, source } => write!(f, "Bind to {addr} failed: {source}"),
            ServerError::Listen { addr, source } => {
                write!(f, "Listen on {addr} failed: {source}")
            }
            ServerError::Backend(e) => write!(f, "Readiness backend setup failed: {e}"),
            ServerError::Spawn(e) => write!(f, "Failed to spawn reactor thread: {e}"),
            ServerError::NotInitialized => write!(f, "Server is not initialized"),
            ServerError::AlreadyInitialized => write!(f, "Server is already initialized"),
            ServerError::WorkerPanicked(id) => write!(f, "Reactor {id} panicked"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Socket(e) | ServerError::Backend(e) | ServerError::Spawn(e) => Some(e),
            ServerError::Bind { source, .. } | ServerError::Listen { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<AcceptorError> for ServerError {
    fn from(e: AcceptorError) -> Self {
        match e {
            AcceptorError::Socket(e) => ServerError::Socket(e),
            AcceptorError::Bind(addr, source) => ServerError::Bind { addr, source },
            AcceptorError::Listen(addr, source) => ServerError::Listen { addr, source },
        }
    }
}

/// Cloneable handle that stops a running server.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wakers: Vec<Arc<dyn Wake>>,
}

impl ShutdownHandle {
    /// Ask every reactor to stop and interrupt their waits.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        for waker in &self.wakers {
            if let Err(e) = waker.wake() {
                // The bounded poll timeout still picks the flag up.
                warn!(error = %e, "Failed to wake reactor");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("shutdown", &self.is_shutdown())
            .field("reactors", &self.wakers.len())
            .finish()
    }
}

/// Multi-connection echo server.
pub struct Server {
    options: ServerOptions,
    backend: BackendKind,
    reactors: Vec<Reactor>,
    local_addr: Option<SocketAddr>,
    shutdown: Arc<AtomicBool>,
    wakers: Vec<Arc<dyn Wake>>,
    stats: Arc<Stats>,
}

impl Server {
    /// Create a server instance. The backend kind is resolved here, once.
    pub fn new(options: ServerOptions) -> Self {
        let backend = options.backend.resolve();
        Server {
            options,
            backend,
            reactors: Vec::new(),
            local_addr: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            wakers: Vec::new(),
            stats: Arc::new(Stats::new()),
        }
    }

    /// Bind `address:port`, listen, and prepare the reactors.
    ///
    /// Returns the bound address, which carries the actual port when `port`
    /// is 0. Nothing is accepted before [`Server::start`].
    pub fn initialize(&mut self, port: u16, address: &str) -> Result<SocketAddr, ServerError> {
        if self.local_addr.is_some() {
            return Err(ServerError::AlreadyInitialized);
        }

        let addr = parse_addr(address, port)?;
        let workers = self.options.workers.max(1);
        let mut acceptor_options = self.options.acceptor.clone();
        if workers > 1 {
            acceptor_options.reuse_port = true;
        }

        // The first bind resolves an ephemeral port for the others.
        let first = Acceptor::bind(addr, &acceptor_options)?;
        let bound = first.local_addr();
        let mut acceptors = vec![first];
        for _ in 1..workers {
            acceptors.push(Acceptor::bind(bound, &acceptor_options)?);
        }

        let mut reactors = Vec::with_capacity(workers);
        let mut wakers = Vec::with_capacity(workers);
        for (id, acceptor) in acceptors.into_iter().enumerate() {
            let backend = self
                .backend
                .build(self.options.event_capacity)
                .map_err(ServerError::Backend)?;
            let reactor = Reactor::new(
                id,
                backend,
                acceptor,
                &self.options.reactor,
                Arc::clone(&self.shutdown),
                Arc::clone(&self.stats),
            )
            .map_err(ServerError::Backend)?;
            wakers.push(reactor.waker());
            reactors.push(reactor);
        }

        info!(
            addr = %bound,
            workers,
            backend = ?self.backend,
            "Server initialized"
        );

        self.reactors = reactors;
        self.wakers = wakers;
        self.local_addr = Some(bound);
        Ok(bound)
    }

    /// Run every reactor and block until the server is shut down.
    ///
    /// On return all connections, listening sockets and backends are
    /// released and every reactor thread has been joined.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.reactors.is_empty() {
            return Err(ServerError::NotInitialized);
        }

        let mut reactors = std::mem::take(&mut self.reactors);
        let mut inline = reactors.remove(0);

        let mut handles = Vec::with_capacity(reactors.len());
        for mut reactor in reactors {
            let id = handles.len() + 1;
            let spawned = thread::Builder::new()
                .name(format!("reactor-{id}"))
                .spawn(move || reactor.run());
            match spawned {
                Ok(handle) => handles.push((id, handle)),
                Err(e) => {
                    error!(worker = id, error = %e, "Failed to spawn reactor");
                    self.shutdown_handle().shutdown();
                    // Panics are logged by join_all; the spawn failure is reported.
                    let _ = join_all(handles);
                    return Err(ServerError::Spawn(e));
                }
            }
        }

        inline.run();
        drop(inline);

        let result = join_all(handles);
        info!(stats = ?self.stats.snapshot(), "Server stopped");
        result
    }

    /// Handle that stops [`Server::start`] from any thread.
    ///
    /// Take it after `initialize`: a handle taken earlier only raises the
    /// flag, which reactors notice at their next poll timeout.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            wakers: self.wakers.clone(),
        }
    }

    /// Counters shared by every reactor.
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Bound address, once initialized.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The backend picked at construction.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }
}

fn join_all(handles: Vec<(usize, thread::JoinHandle<()>)>) -> Result<(), ServerError> {
    let mut result = Ok(());
    for (id, handle) in handles {
        if handle.join().is_err() {
            error!(worker = id, "Reactor panicked");
            result = Err(ServerError::WorkerPanicked(id));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use std::net::{TcpListener, UdpSocket};
    use std::thread::JoinHandle;
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Running {
        addr: SocketAddr,
        shutdown: ShutdownHandle,
        stats: Arc<Stats>,
        handle: JoinHandle<Result<(), ServerError>>,
    }

    impl Running {
        fn stop(self) {
            self.shutdown.shutdown();
            self.handle.join().unwrap().unwrap();
        }
    }

    fn spawn_server(options: ServerOptions, address: &str) -> Running {
        let mut server = Server::new(options);
        let addr = server.initialize(0, address).unwrap();
        let shutdown = server.shutdown_handle();
        let stats = server.stats();
        let handle = thread::spawn(move || server.start());
        Running {
            addr,
            shutdown,
            stats,
            handle,
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn round_trip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut client = Client::new();
        client.connect(&addr.ip().to_string(), addr.port()).unwrap();
        client.send(payload).unwrap();
        let echoed = client.receive_exact(payload.len()).unwrap();
        client.disconnect();
        echoed
    }

    #[test]
    fn test_start_before_initialize() {
        let mut server = Server::new(ServerOptions::default());
        assert!(matches!(server.start(), Err(ServerError::NotInitialized)));
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_initialize_twice() {
        let mut server = Server::new(ServerOptions::default());
        server.initialize(0, "127.0.0.1").unwrap();
        assert!(matches!(
            server.initialize(0, "127.0.0.1"),
            Err(ServerError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_bind_errors() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut server = Server::new(ServerOptions::default());
        match server.initialize(port, "127.0.0.1") {
            Err(ServerError::Bind { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse)
            }
            other => panic!("unexpected: {:?}", other),
        }

        let mut server = Server::new(ServerOptions::default());
        match server.initialize(8080, "300.1.2.3") {
            Err(ServerError::Bind { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::InvalidInput)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_second_server_on_same_port_is_refused() {
        let mut first = Server::new(ServerOptions::default());
        let addr = first.initialize(0, "127.0.0.1").unwrap();

        let mut second = Server::new(ServerOptions::default());
        match second.initialize(addr.port(), "127.0.0.1") {
            Err(ServerError::Bind { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse)
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(second.local_addr().is_none());
    }

    #[test]
    fn test_auto_backend_resolved_at_construction() {
        let server = Server::new(ServerOptions::default());
        assert_eq!(server.backend(), BackendKind::Mio);
    }

    #[test]
    fn test_hello_server_scenario() {
        let running = spawn_server(ServerOptions::default(), "127.0.0.1");

        let mut client = Client::new();
        client.connect("127.0.0.1", running.addr.port()).unwrap();
        client.send(b"Hello Server!").unwrap();
        assert_eq!(client.receive_exact(13).unwrap(), b"Hello Server!");
        client.disconnect();

        wait_until(|| running.stats.active_connections() == 0);
        let stats = running.stats.snapshot();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.bytes_received, 13);
        assert_eq!(stats.bytes_sent, 13);

        running.stop();
    }

    #[test]
    fn test_poll_backend_end_to_end() {
        let options = ServerOptions {
            backend: BackendKind::Poll,
            ..ServerOptions::default()
        };
        let running = spawn_server(options, "127.0.0.1");

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        assert_eq!(round_trip(running.addr, &payload), payload);

        wait_until(|| running.stats.active_connections() == 0);
        running.stop();
    }

    #[test]
    fn test_wildcard_address_accepts_any_local_interface() {
        let running = spawn_server(ServerOptions::default(), "0.0.0.0");
        assert!(running.addr.ip().is_unspecified());
        let port = running.addr.port();

        let mut targets: Vec<SocketAddr> = vec![SocketAddr::from(([127, 0, 0, 1], port))];
        // Linux routes the whole 127/8 block to loopback.
        if cfg!(target_os = "linux") {
            targets.push(SocketAddr::from(([127, 0, 0, 2], port)));
        }
        // A routable interface address, if the host has one.
        if let Some(ip) = UdpSocket::bind("0.0.0.0:0")
            .and_then(|s| s.connect("192.0.2.1:9").map(|()| s))
            .and_then(|s| s.local_addr())
            .ok()
            .map(|a| a.ip())
            .filter(|ip| !ip.is_unspecified())
        {
            targets.push(SocketAddr::new(ip, port));
        }

        for target in targets {
            assert_eq!(round_trip(target, b"any interface"), b"any interface");
        }

        running.stop();
    }

    #[test]
    fn test_workers_share_port() {
        let options = ServerOptions {
            workers: 3,
            ..ServerOptions::default()
        };
        let running = spawn_server(options, "127.0.0.1");

        for i in 0..12u8 {
            let payload = vec![i; 100 + i as usize];
            assert_eq!(round_trip(running.addr, &payload), payload);
        }

        wait_until(|| running.stats.active_connections() == 0);
        assert_eq!(running.stats.snapshot().accepted, 12);
        running.stop();
    }

    #[test]
    fn test_shutdown_closes_open_connections() {
        let running = spawn_server(ServerOptions::default(), "127.0.0.1");

        let mut client = Client::new();
        client.connect("127.0.0.1", running.addr.port()).unwrap();
        client.send(b"still here").unwrap();
        assert_eq!(client.receive_exact(10).unwrap(), b"still here");

        let stats = Arc::clone(&running.stats);
        running.stop();

        assert_eq!(stats.active_connections(), 0);
        // Server side is gone: the next read sees EOF or a reset.
        if let Ok(bytes) = client.receive() {
            assert!(bytes.is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clients_are_isolated() {
        let running = spawn_server(ServerOptions::default(), "127.0.0.1");
        let addr = running.addr;

        let mut tasks = Vec::new();
        for i in 0..32usize {
            tasks.push(tokio::spawn(async move {
                let payload: Vec<u8> = (0..(1000 + i * 3001))
                    .map(|j| ((i * 31 + j) % 256) as u8)
                    .collect();
                let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
                let (mut reader, mut writer) = stream.split();

                let send = async {
                    for chunk in payload.chunks(4096) {
                        writer.write_all(chunk).await.unwrap();
                    }
                };
                let mut echoed = vec![0u8; payload.len()];
                let recv = reader.read_exact(&mut echoed);
                let ((), received) = tokio::join!(send, recv);
                received.unwrap();

                assert_eq!(echoed, payload, "client {i} got foreign or reordered bytes");
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        let stats = Arc::clone(&running.stats);
        tokio::task::spawn_blocking(move || {
            wait_until(|| stats.active_connections() == 0);
            running.stop();
        })
        .await
        .unwrap();
    }
}
