/// Destination strategies
///
/// A route owns exactly one destination, an ordered collection of backend
/// addresses plus the policy for picking the next one. Static lists come in
/// three flavors selected by the route's access mode; the fourth variant
/// reads the topology cache on every pick.
pub mod first_available;
pub mod first_ring;
pub mod metadata;
pub mod round_robin;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::RouterError;
use crate::net::Endpoint;

pub use first_available::FirstAvailableDestination;
pub use first_ring::FirstRingDestination;
pub use metadata::MetadataDestination;
pub use round_robin::RoundRobinDestination;

/// Capability surface every destination variant provides.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Register another backend address. Strategies that derive their
    /// addresses elsewhere may ignore this.
    fn add(&self, endpoint: Endpoint);

    /// Number of addresses currently known.
    fn size(&self) -> usize;

    /// The addresses currently known, in pick order.
    fn endpoints(&self) -> Vec<Endpoint>;

    /// Hook for strategies with background state; called once by the route
    /// before accepting.
    async fn start(&self) {}

    /// Pick a backend per the strategy's policy and connect to it within
    /// `connect_timeout`.
    async fn connect(&self, connect_timeout: Duration) -> Result<TcpStream, RouterError>;
}

/// Ordered address list shared by the static strategies.
pub(crate) struct EndpointList {
    entries: Mutex<Vec<Endpoint>>,
}

impl EndpointList {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, endpoint: Endpoint) {
        self.entries
            .lock()
            .expect("endpoint list lock poisoned")
            .push(endpoint);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("endpoint list lock poisoned").len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Endpoint> {
        self.entries
            .lock()
            .expect("endpoint list lock poisoned")
            .clone()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Loopback servers for exercising connect policies.
    use tokio::net::TcpListener;

    /// Bind a throwaway accept-everything server, returning its port.
    pub(crate) async fn spawn_server() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => drop(tokio::spawn(async move {
                        // hold the connection open until the peer goes away
                        let _ = stream.readable().await;
                    })),
                    Err(_) => break,
                }
            }
        });
        (port, handle)
    }

    /// A port that refuses connections: bind, read the port, drop the socket.
    pub(crate) async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }
}
