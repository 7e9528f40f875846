/// First-available over a ring of static destinations
///
/// Behaves like first-available, except that advancing past the end of the
/// list wraps around to the start and keeps trying. The pick fails only when
/// every address in the ring refused a connection.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::net::TcpStream;

use super::{Destination, EndpointList};
use crate::error::RouterError;
use crate::net::{self, Endpoint};

pub struct FirstRingDestination {
    list: EndpointList,
    current: AtomicUsize,
}

impl FirstRingDestination {
    pub fn new() -> Self {
        Self {
            list: EndpointList::new(),
            current: AtomicUsize::new(0),
        }
    }
}

impl Default for FirstRingDestination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Destination for FirstRingDestination {
    fn add(&self, endpoint: Endpoint) {
        self.list.push(endpoint);
    }

    fn size(&self) -> usize {
        self.list.len()
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.list.snapshot()
    }

    async fn connect(&self, connect_timeout: Duration) -> Result<TcpStream, RouterError> {
        let entries = self.list.snapshot();
        if entries.is_empty() {
            return Err(RouterError::no_destinations("empty destination list"));
        }

        let start = self.current.load(Ordering::Relaxed) % entries.len();
        let mut last_err = None;
        for step in 0..entries.len() {
            let index = (start + step) % entries.len();
            let endpoint = &entries[index];
            debug!("Trying server {} (index {})", endpoint, index);
            match net::connect(endpoint, connect_timeout).await {
                Ok(stream) => {
                    self.current.store(index, Ordering::Relaxed);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("Failed connecting to destination {}: {}", endpoint, e);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(RouterError::Destination(e)),
            None => Err(RouterError::no_destinations("empty destination list")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::testing::{dead_port, spawn_server};

    #[tokio::test]
    async fn test_wraps_past_the_end() {
        let (port_a, _srv_a) = spawn_server().await;
        let dead = dead_port().await;

        let dest = FirstRingDestination::new();
        dest.add(Endpoint::new("127.0.0.1", port_a));
        dest.add(Endpoint::new("127.0.0.1", dead));

        // park the cursor on the dead tail entry, as if the head had failed
        dest.current.store(1, Ordering::Relaxed);

        let stream = dest.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port_a);
        assert_eq!(dest.current.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_sticks_to_working_destination() {
        let (port_a, _srv_a) = spawn_server().await;
        let (port_b, _srv_b) = spawn_server().await;

        let dest = FirstRingDestination::new();
        dest.add(Endpoint::new("127.0.0.1", port_a));
        dest.add(Endpoint::new("127.0.0.1", port_b));

        for _ in 0..3 {
            let stream = dest.connect(Duration::from_secs(1)).await.unwrap();
            assert_eq!(stream.peer_addr().unwrap().port(), port_a);
        }
    }

    #[tokio::test]
    async fn test_all_dead_fails_but_ring_recovers() {
        let dead_a = dead_port().await;
        let dead_b = dead_port().await;

        let dest = FirstRingDestination::new();
        dest.add(Endpoint::new("127.0.0.1", dead_a));
        dest.add(Endpoint::new("127.0.0.1", dead_b));
        assert!(dest.connect(Duration::from_secs(1)).await.is_err());

        // a later pick starts trying again rather than staying exhausted
        assert!(dest.connect(Duration::from_secs(1)).await.is_err());
    }
}
