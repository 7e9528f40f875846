/// Protocol adapters for the two supported wire protocols
///
/// Routing never interprets queries; it only frames enough of the protocol to
/// tell the handshake from steady state, to reject clients with a packet the
/// driver understands, and to notice when a connection goes bad. The two
/// variants (classic and X) share the [`RouteProtocol`] surface so routes can
/// hold one tagged adapter.
pub mod classic;
pub mod xproto;

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};

/// "Too many connections" (server-side admission)
pub const ER_CON_COUNT: u16 = 1040;
/// "Too many connection errors" (blocked source host)
pub const ER_HOST_BLOCKED: u16 = 1129;
/// "Can't connect to remote MySQL server"
pub const CR_CONN_HOST_ERROR: u16 = 2003;
/// Sqlstate used for every synthesized packet
pub const SQLSTATE_GENERAL: &str = "HY000";

/// Per-connection copy-loop state shared by both directions.
#[derive(Debug, Default)]
pub struct TransferState {
    /// Last observed classic sequence id (frame counter for X)
    pub pktnr: u8,
    /// Whether the session handshake has completed
    pub handshake_done: bool,
}

/// One side of a routed connection.
///
/// The copy loop waits for readability, drains what is available without
/// blocking, and pushes it to the opposite side. Implemented for plain TCP
/// streams, local stream sockets, and the client-side wrapper around either.
#[async_trait]
pub trait Conduit: Send {
    /// Wait until a read would not block.
    async fn readable(&self) -> io::Result<()>;
    /// Non-blocking read into `buf`; `WouldBlock` means a spurious wakeup.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Write the whole buffer or fail; partial writes and interrupts are
    /// retried internally.
    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Shut down the write direction.
    async fn close_write(&mut self) -> io::Result<()>;
}

#[async_trait]
impl Conduit for TcpStream {
    async fn readable(&self) -> io::Result<()> {
        TcpStream::readable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_all(buf).await
    }

    async fn close_write(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

#[async_trait]
impl Conduit for UnixStream {
    async fn readable(&self) -> io::Result<()> {
        UnixStream::readable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        UnixStream::try_read(self, buf)
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_all(buf).await
    }

    async fn close_write(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

/// Client connection as accepted by a route: TCP or a local stream socket.
#[derive(Debug)]
pub enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ClientStream {
    /// Source IP of the client, when it has one.
    pub fn peer_ip(&self) -> Option<IpAddr> {
        match self {
            ClientStream::Tcp(s) => s.peer_addr().ok().map(|a| a.ip()),
            ClientStream::Unix(_) => None,
        }
    }

    /// Human-readable source description for log lines.
    pub fn describe(&self) -> String {
        match self {
            ClientStream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            ClientStream::Unix(_) => "local socket".to_string(),
        }
    }
}

#[async_trait]
impl Conduit for ClientStream {
    async fn readable(&self) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => Conduit::readable(s).await,
            ClientStream::Unix(s) => Conduit::readable(s).await,
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(s) => Conduit::try_read(s, buf),
            ClientStream::Unix(s) => Conduit::try_read(s, buf),
        }
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.send_all(buf).await,
            ClientStream::Unix(s) => s.send_all(buf).await,
        }
    }

    async fn close_write(&mut self) -> io::Result<()> {
        match self {
            ClientStream::Tcp(s) => s.close_write().await,
            ClientStream::Unix(s) => s.close_write().await,
        }
    }
}

/// Tagged protocol adapter held by each route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteProtocol {
    /// The classic MySQL client/server protocol (server speaks first)
    Classic,
    /// The X protocol (client speaks first, length-type framed messages)
    X,
}

impl RouteProtocol {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "classic" => Some(RouteProtocol::Classic),
            "x" => Some(RouteProtocol::X),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RouteProtocol::Classic => "classic",
            RouteProtocol::X => "x",
        }
    }

    /// Server port used when a destination entry does not name one.
    pub fn default_port(&self) -> u16 {
        match self {
            RouteProtocol::Classic => classic::DEFAULT_PORT,
            RouteProtocol::X => xproto::DEFAULT_PORT,
        }
    }

    /// Copy whatever `src` has ready to `dst`, updating the handshake state.
    ///
    /// Returns the number of bytes forwarded (0 on a spurious wakeup). Any
    /// I/O error, peer close, or framing violation is an error and ends the
    /// connection.
    pub async fn copy_packets<S, D>(
        &self,
        src: &S,
        dst: &mut D,
        buffer: &mut [u8],
        state: &mut TransferState,
        server_to_client: bool,
    ) -> io::Result<usize>
    where
        S: Conduit + ?Sized,
        D: Conduit + ?Sized,
    {
        match self {
            RouteProtocol::Classic => {
                classic::copy_packets(src, dst, buffer, state, server_to_client).await
            }
            RouteProtocol::X => {
                xproto::copy_packets(src, dst, buffer, state, server_to_client).await
            }
        }
    }

    /// Synthesize a protocol-correct error packet so the client sees a
    /// meaningful failure before teardown.
    pub async fn send_error<D>(
        &self,
        dst: &mut D,
        code: u16,
        message: &str,
        sql_state: &str,
        route: &str,
    ) -> io::Result<()>
    where
        D: Conduit + ?Sized,
    {
        log::debug!("[{}] sending error {} to client: {}", route, code, message);
        match self {
            RouteProtocol::Classic => classic::send_error(dst, code, message, sql_state).await,
            RouteProtocol::X => xproto::send_error(dst, code, message, sql_state).await,
        }
    }

    /// Hook invoked when a source host transitions to blocked. The classic
    /// adapter placates the server side so backends do not count the aborted
    /// handshake against the router host.
    pub async fn on_block_client_host<D>(&self, server: &mut D, route: &str) -> io::Result<()>
    where
        D: Conduit + ?Sized,
    {
        match self {
            RouteProtocol::Classic => classic::on_block_client_host(server, route).await,
            RouteProtocol::X => xproto::on_block_client_host(route),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names() {
        assert_eq!(RouteProtocol::from_name("classic"), Some(RouteProtocol::Classic));
        assert_eq!(RouteProtocol::from_name("X"), Some(RouteProtocol::X));
        assert_eq!(RouteProtocol::from_name("http"), None);
        assert_eq!(RouteProtocol::Classic.name(), "classic");
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(RouteProtocol::Classic.default_port(), 3306);
        assert_eq!(RouteProtocol::X.default_port(), 33060);
    }

    #[tokio::test]
    async fn test_client_stream_peer_ip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        connect.await.unwrap();

        let client = ClientStream::Tcp(accepted);
        assert!(client.peer_ip().is_some());
        assert!(client.describe().starts_with("127.0.0.1:"));
    }
}
