/// Router instances
///
/// One [`Router`] runs per configured route. It owns up to two listeners
/// (TCP and a local stream socket), an acceptor task that polls a stop flag
/// about once a second, the admission counters, and the per-source error
/// tracker. Each accepted client gets a detached worker task that binds it
/// to a backend picked by the route's destination strategy and copies
/// packets both ways until either side goes away.
pub mod blocker;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::destination::Destination;
use crate::error::RouterError;
use crate::net::Endpoint;
use crate::protocol::{
    ClientStream, Conduit, RouteProtocol, TransferState, CR_CONN_HOST_ERROR, ER_CON_COUNT,
    ER_HOST_BLOCKED, SQLSTATE_GENERAL,
};
use crate::utils::ip_fingerprint;

pub use blocker::{ErrorRateBlocker, HostKey};

/// How often the acceptor wakes up to check the stop flag.
const ACCEPTOR_STOP_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Modes supported by routes with static destination lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
    ReadWriteRing,
}

impl AccessMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "read-write" => Some(AccessMode::ReadWrite),
            "read-only" => Some(AccessMode::ReadOnly),
            "read-write-ring" => Some(AccessMode::ReadWriteRing),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "read-write",
            AccessMode::ReadOnly => "read-only",
            AccessMode::ReadWriteRing => "read-write-ring",
        }
    }
}

/// Everything a route is configured with.
#[derive(Debug, Clone)]
pub struct RouteSettings {
    pub name: String,
    pub mode: AccessMode,
    pub protocol: RouteProtocol,
    pub bind_address: Option<Endpoint>,
    pub bind_socket: Option<PathBuf>,
    pub max_connections: usize,
    pub destination_connect_timeout: Duration,
    pub client_connect_timeout: Duration,
    pub max_connect_errors: u64,
    pub max_connect_errors_timeout: Duration,
    pub net_buffer_length: usize,
}

enum Ready {
    Server(io::Result<()>),
    Client(io::Result<()>),
}

pub struct Router {
    settings: RouteSettings,
    destination: Arc<dyn Destination>,
    blocker: ErrorRateBlocker,
    active: AtomicUsize,
    handled: AtomicU64,
    stopping: AtomicBool,
}

impl Router {
    pub fn new(
        settings: RouteSettings,
        destination: Arc<dyn Destination>,
    ) -> Result<Arc<Self>, RouterError> {
        if settings.bind_address.is_none() && settings.bind_socket.is_none() {
            return Err(RouterError::Config(crate::config::ConfigError::Validation(
                format!("[{}] no address or socket to bind to", settings.name),
            )));
        }

        let blocker = ErrorRateBlocker::new(
            settings.max_connect_errors,
            settings.max_connect_errors_timeout,
        );
        Ok(Arc::new(Self {
            settings,
            destination,
            blocker,
            active: AtomicUsize::new(0),
            handled: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Number of client sessions currently routed.
    pub fn active_routes(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of client sessions ever bound to a backend.
    pub fn handled_routes(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Sources currently blocked by the error tracker.
    pub fn get_blocked_client_hosts(&self) -> Vec<HostKey> {
        self.blocker.blocked_hosts()
    }

    /// Ask the acceptor to stop at its next polling boundary. Workers for
    /// in-flight sessions run to completion.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Bind the configured listeners and spawn the acceptor task.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<()>, RouterError> {
        let tcp = match &self.settings.bind_address {
            Some(endpoint) => {
                let listener = TcpListener::bind((endpoint.host.as_str(), endpoint.port))
                    .await
                    .map_err(|e| {
                        RouterError::Network(io::Error::new(
                            e.kind(),
                            format!("Setting up TCP service using {}: {}", endpoint, e),
                        ))
                    })?;
                info!(
                    "[{}] started: listening on {}; {}",
                    self.settings.name,
                    endpoint,
                    self.settings.mode.name()
                );
                Some(listener)
            }
            None => None,
        };

        let unix = match &self.settings.bind_socket {
            Some(path) => {
                let listener = bind_unix_socket(path).map_err(|e| {
                    RouterError::Network(io::Error::new(
                        e.kind(),
                        format!(
                            "Setting up named socket service '{}': {}",
                            path.display(),
                            e
                        ),
                    ))
                })?;
                info!(
                    "[{}] started: listening using {}; {}",
                    self.settings.name,
                    path.display(),
                    self.settings.mode.name()
                );
                Some(listener)
            }
            None => None,
        };

        self.destination.start().await;

        Ok(tokio::spawn(self.acceptor(tcp, unix)))
    }

    async fn acceptor(self: Arc<Self>, tcp: Option<TcpListener>, unix: Option<UnixListener>) {
        while !self.is_stopping() {
            tokio::select! {
                // bounds stop latency to roughly one second
                _ = sleep(ACCEPTOR_STOP_POLL_INTERVAL) => {}
                accepted = async {
                    match &tcp {
                        Some(listener) => listener.accept().await,
                        None => std::future::pending().await,
                    }
                } => match accepted {
                    Ok((stream, peer)) => {
                        debug!(
                            "[{}] TCP connection from {} accepted",
                            self.settings.name, peer
                        );
                        if let Err(e) = stream.set_nodelay(true) {
                            error!("[{}] client setsockopt error: {}", self.settings.name, e);
                            continue;
                        }
                        let fingerprint = ip_fingerprint(Some(peer.ip()));
                        Arc::clone(&self)
                            .accept_client(ClientStream::Tcp(stream), fingerprint)
                            .await;
                    }
                    Err(e) => {
                        error!(
                            "[{}] Failed accepting TCP connection: {}",
                            self.settings.name, e
                        );
                    }
                },
                accepted = async {
                    match &unix {
                        Some(listener) => listener.accept().await,
                        None => std::future::pending().await,
                    }
                } => match accepted {
                    Ok((stream, _)) => {
                        debug!(
                            "[{}] local socket connection accepted",
                            self.settings.name
                        );
                        let fingerprint = ip_fingerprint(None);
                        Arc::clone(&self)
                            .accept_client(ClientStream::Unix(stream), fingerprint)
                            .await;
                    }
                    Err(e) => {
                        error!(
                            "[{}] Failed accepting socket connection: {}",
                            self.settings.name, e
                        );
                    }
                },
            }
        }

        if let Some(path) = &self.settings.bind_socket {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed removing socket file {} ({})", path.display(), e);
                }
            }
        }
        info!("[{}] stopped", self.settings.name);
    }

    /// Admission checks, then a detached worker. Rejected clients get a
    /// protocol error packet and are closed without shutdown.
    async fn accept_client(self: Arc<Self>, mut client: ClientStream, fingerprint: HostKey) {
        let source = client.describe();

        if self.blocker.should_block(&fingerprint) {
            let message = format!("Too many connection errors from {}", source);
            let _ = self
                .settings
                .protocol
                .send_error(
                    &mut client,
                    ER_HOST_BLOCKED,
                    &message,
                    SQLSTATE_GENERAL,
                    &self.settings.name,
                )
                .await;
            info!("{}", message);
            return;
        }

        // Claim an admission slot before the worker exists so the ceiling
        // holds even while accepts race.
        let claim = self.active.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
            if active >= self.settings.max_connections {
                None
            } else {
                Some(active + 1)
            }
        });
        if claim.is_err() {
            let _ = self
                .settings
                .protocol
                .send_error(
                    &mut client,
                    ER_CON_COUNT,
                    "Too many connections",
                    SQLSTATE_GENERAL,
                    &self.settings.name,
                )
                .await;
            warn!(
                "[{}] reached max active connections ({} max={})",
                self.settings.name,
                self.active.load(Ordering::SeqCst),
                self.settings.max_connections
            );
            return;
        }

        tokio::spawn(async move {
            self.worker(client, fingerprint, source).await;
        });
    }

    /// One routed session: bind to a backend, copy packets both ways,
    /// account the outcome.
    async fn worker(self: Arc<Self>, mut client: ClientStream, fingerprint: HostKey, source: String) {
        let mut server = match self
            .destination
            .connect(self.settings.destination_connect_timeout)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let message = format!(
                    "Can't connect to remote MySQL server for client connected to '{}'",
                    self.bind_description()
                );
                warn!("[{}] {} ({})", self.settings.name, message, e);
                // at this point, it does not matter whether the client gets the error
                let _ = self
                    .settings
                    .protocol
                    .send_error(
                        &mut client,
                        CR_CONN_HOST_ERROR,
                        &message,
                        SQLSTATE_GENERAL,
                        &self.settings.name,
                    )
                    .await;
                let _ = client.close_write().await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        };

        self.handled.fetch_add(1, Ordering::Relaxed);
        if let Ok(peer) = server.peer_addr() {
            debug!("[{}] source {} - dest {}", self.settings.name, source, peer);
        }

        let mut state = TransferState::default();
        let mut buffer = vec![0u8; self.settings.net_buffer_length];
        let mut bytes_up: u64 = 0;
        let mut bytes_down: u64 = 0;
        let mut extra_msg = String::new();

        loop {
            // classic protocol: the server always talks first, so its side
            // is polled first
            let wait = async {
                tokio::select! {
                    biased;
                    r = Conduit::readable(&server) => Ready::Server(r),
                    r = Conduit::readable(&client) => Ready::Client(r),
                }
            };

            // the handshake runs against the client connect timeout; an
            // established session may idle forever
            let ready = if state.handshake_done {
                wait.await
            } else {
                match timeout(self.settings.client_connect_timeout, wait).await {
                    Ok(ready) => ready,
                    Err(_) => {
                        extra_msg = "Select timed out".to_string();
                        break;
                    }
                }
            };

            match ready {
                Ready::Server(Ok(())) => {
                    match self
                        .settings
                        .protocol
                        .copy_packets(&server, &mut client, &mut buffer, &mut state, true)
                        .await
                    {
                        Ok(n) => bytes_up += n as u64,
                        Err(e) => {
                            if e.kind() != io::ErrorKind::UnexpectedEof {
                                extra_msg = format!("Copy server-client failed: {}", e);
                            }
                            break;
                        }
                    }
                }
                Ready::Client(Ok(())) => {
                    match self
                        .settings
                        .protocol
                        .copy_packets(&client, &mut server, &mut buffer, &mut state, false)
                        .await
                    {
                        Ok(n) => bytes_down += n as u64,
                        Err(e) => {
                            if e.kind() != io::ErrorKind::UnexpectedEof {
                                extra_msg = format!("Copy client-server failed: {}", e);
                            }
                            break;
                        }
                    }
                }
                Ready::Server(Err(e)) | Ready::Client(Err(e)) => {
                    extra_msg = format!("Select failed with error: {}", e);
                    break;
                }
            }
        }

        // a session that never finished its handshake counts against the
        // source host
        if !state.handshake_done {
            debug!(
                "[{}] Routing failed for {}: {}",
                self.settings.name, source, extra_msg
            );
            self.blocker.check_errors_time(&fingerprint);
            if self.blocker.note_failure(&fingerprint, &source, &self.settings.name) {
                let _ = self
                    .settings
                    .protocol
                    .on_block_client_host(&mut server, &self.settings.name)
                    .await;
            }
        }

        let _ = client.close_write().await;
        let _ = Conduit::close_write(&mut server).await;
        drop(client);
        drop(server);

        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(
            "[{}] Routing stopped (up:{}b;down:{}b) {}",
            self.settings.name, bytes_up, bytes_down, extra_msg
        );
    }

    fn bind_description(&self) -> String {
        match (&self.settings.bind_address, &self.settings.bind_socket) {
            (Some(endpoint), _) => endpoint.to_string(),
            (None, Some(path)) => path.display().to_string(),
            (None, None) => "unbound".to_string(),
        }
    }
}

/// Bind a local stream socket, recovering a stale socket file left behind by
/// a dead process: if nothing answers on it, it is deleted and the bind is
/// retried once.
fn bind_unix_socket(path: &PathBuf) -> io::Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            match std::os::unix::net::UnixStream::connect(path) {
                Ok(_) => {
                    error!(
                        "Socket file {} already in use by another process",
                        path.display()
                    );
                    Err(e)
                }
                Err(_) => {
                    warn!(
                        "Socket file {} already exists, but seems to be unused. Deleting and retrying...",
                        path.display()
                    );
                    std::fs::remove_file(path)?;
                    UnixListener::bind(path)
                }
            }
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::RoundRobinDestination;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UnixStream};

    fn classic_packet(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![
            (payload.len() & 0xff) as u8,
            ((payload.len() >> 8) & 0xff) as u8,
            ((payload.len() >> 16) & 0xff) as u8,
            seq,
        ];
        out.extend_from_slice(payload);
        out
    }

    /// A minimal classic-protocol backend: greets, reads the client's
    /// response, confirms authentication, then echoes one packet.
    async fn spawn_classic_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let greeting = classic_packet(0, &[0x0a, b'8', b'.', b'0', 0x00]);
                    if stream.write_all(&greeting).await.is_err() {
                        return;
                    }
                    let mut buf = vec![0u8; 1024];
                    let Ok(n) = stream.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    // OK packet finishing the handshake
                    if stream.write_all(&classic_packet(2, &[0x00, 0x00, 0x00])).await.is_err() {
                        return;
                    }
                    // steady state: echo whatever arrives
                    loop {
                        let Ok(n) = stream.read(&mut buf).await else { return };
                        if n == 0 {
                            return;
                        }
                        if stream.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        port
    }

    /// A backend that accepts and stays silent, so handshakes cannot finish.
    async fn spawn_silent_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let _ = stream.readable().await;
                    // hold the socket open; never speak
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });
        port
    }

    fn settings(name: &str, port: u16) -> RouteSettings {
        RouteSettings {
            name: name.to_string(),
            mode: AccessMode::ReadOnly,
            protocol: RouteProtocol::Classic,
            bind_address: Some(Endpoint::new("127.0.0.1", port)),
            bind_socket: None,
            max_connections: 512,
            destination_connect_timeout: Duration::from_secs(1),
            client_connect_timeout: Duration::from_secs(9),
            max_connect_errors: 100,
            max_connect_errors_timeout: Duration::ZERO,
            net_buffer_length: 16384,
        }
    }

    async fn start_router(
        settings: RouteSettings,
        backends: &[u16],
    ) -> (Arc<Router>, SocketAddr, JoinHandle<()>) {
        let destination = Arc::new(RoundRobinDestination::new());
        for port in backends {
            destination.add(Endpoint::new("127.0.0.1", *port));
        }
        let router = Router::new(settings, destination).unwrap();
        let handle = Arc::clone(&router).start().await.unwrap();
        let bind = router.settings.bind_address.clone().unwrap();
        let addr: SocketAddr = format!("127.0.0.1:{}", bind.port).parse().unwrap();
        (router, addr, handle)
    }

    /// Bind port 0 to learn a free port, then release it for the router.
    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn run_handshake(client: &mut TcpStream) {
        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 4, "expected server greeting through the router");
        assert_eq!(buf[3], 0);

        let response = classic_packet(1, &[0x0d, 0x02, 0x00, 0x00, 0x01, 0x02, 0x03]);
        client.write_all(&response).await.unwrap();

        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 4);
        assert_eq!(buf[3], 2, "expected the auth result packet");
    }

    #[tokio::test]
    async fn test_happy_path_two_clients() {
        let backend = spawn_classic_backend().await;
        let port = free_port().await;
        let (router, addr, _handle) = start_router(settings("happy", port), &[backend]).await;

        assert_eq!(router.active_routes(), 0);

        let mut first = TcpStream::connect(addr).await.unwrap();
        run_handshake(&mut first).await;
        wait_for("first worker", || router.active_routes() == 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        run_handshake(&mut second).await;
        wait_for("second worker", || router.active_routes() == 2).await;

        // established sessions pass bytes verbatim
        let query = classic_packet(0, b"ping");
        first.write_all(&query).await.unwrap();
        let mut echoed = vec![0u8; query.len()];
        first.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, query);

        drop(first);
        wait_for("first teardown", || router.active_routes() == 1).await;
        drop(second);
        wait_for("second teardown", || router.active_routes() == 0).await;
        assert_eq!(router.handled_routes(), 2);

        router.stop();
    }

    #[tokio::test]
    async fn test_admission_rejects_over_max_connections() {
        let backend = spawn_silent_backend().await;
        let port = free_port().await;
        let mut cfg = settings("admission", port);
        cfg.max_connections = 2;
        cfg.client_connect_timeout = Duration::from_secs(30);
        let (router, addr, _handle) = start_router(cfg, &[backend]).await;

        let _first = TcpStream::connect(addr).await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        wait_for("two workers", || router.active_routes() == 2).await;

        let mut third = TcpStream::connect(addr).await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = third.read(&mut buf).await.unwrap();
        assert!(n > 7);
        assert_eq!(buf[4], 0xff);
        assert_eq!(u16::from_le_bytes([buf[5], buf[6]]), ER_CON_COUNT);
        // the rejected connection is closed right after the packet
        assert_eq!(third.read(&mut buf).await.unwrap(), 0);

        assert_eq!(router.active_routes(), 2);
        router.stop();
    }

    #[tokio::test]
    async fn test_source_blocking_after_handshake_failures() {
        let backend = spawn_silent_backend().await;
        let port = free_port().await;
        let mut cfg = settings("blocking", port);
        cfg.max_connect_errors = 3;
        cfg.max_connect_errors_timeout = Duration::from_secs(60);
        cfg.client_connect_timeout = Duration::from_secs(1);
        let (router, addr, _handle) = start_router(cfg, &[backend]).await;

        // three connections that never answer the handshake
        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut buf = vec![0u8; 64];
            // the worker times out after client_connect_timeout and closes
            let n = client.read(&mut buf).await.unwrap();
            assert_eq!(n, 0);
        }
        wait_for("source blocked", || {
            !router.get_blocked_client_hosts().is_empty()
        })
        .await;

        // the fourth attempt is rejected at accept time
        let mut fourth = TcpStream::connect(addr).await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = fourth.read(&mut buf).await.unwrap();
        assert!(n > 7);
        assert_eq!(buf[4], 0xff);
        assert_eq!(u16::from_le_bytes([buf[5], buf[6]]), ER_HOST_BLOCKED);

        let blocked = router.get_blocked_client_hosts();
        assert_eq!(blocked.len(), 1);
        assert_eq!(&blocked[0][..4], &[127, 0, 0, 1]);

        router.stop();
    }

    #[tokio::test]
    async fn test_backend_unreachable_sends_2003() {
        let dead = free_port().await;
        let port = free_port().await;
        let (router, addr, _handle) = start_router(settings("down", port), &[dead]).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 7);
        assert_eq!(buf[4], 0xff);
        assert_eq!(u16::from_le_bytes([buf[5], buf[6]]), CR_CONN_HOST_ERROR);

        wait_for("teardown", || router.active_routes() == 0).await;
        assert_eq!(router.handled_routes(), 0);
        router.stop();
    }

    #[tokio::test]
    async fn test_stop_terminates_acceptor_and_unlinks_socket() {
        let backend = spawn_classic_backend().await;
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("route.sock");

        let mut cfg = settings("local", free_port().await);
        cfg.bind_socket = Some(socket_path.clone());
        let (router, _addr, handle) = start_router(cfg, &[backend]).await;

        // a local-socket client routes like any other
        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 4, "greeting should arrive over the local socket");

        router.stop();
        timeout(Duration::from_secs(3), handle).await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_router_requires_some_bind() {
        let mut cfg = settings("nobind", 1);
        cfg.bind_address = None;
        let result = Router::new(cfg, Arc::new(RoundRobinDestination::new()));
        assert!(result.is_err());
    }
}
