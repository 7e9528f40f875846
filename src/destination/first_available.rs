/// First-available over a static destination list
///
/// The cursor stays on the current address for as long as it keeps accepting
/// connections and advances only on failure. It never moves backwards unless
/// the whole list is exhausted, in which case the next pick starts over from
/// the head.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::net::TcpStream;

use super::{Destination, EndpointList};
use crate::error::RouterError;
use crate::net::{self, Endpoint};

pub struct FirstAvailableDestination {
    list: EndpointList,
    current: AtomicUsize,
}

impl FirstAvailableDestination {
    pub fn new() -> Self {
        Self {
            list: EndpointList::new(),
            current: AtomicUsize::new(0),
        }
    }
}

impl Default for FirstAvailableDestination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Destination for FirstAvailableDestination {
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

        let mut start = self.current.load(Ordering::Relaxed);
        if start >= entries.len() {
            start = 0;
        }

        let mut last_err = None;
        for i in start..entries.len() {
            let endpoint = &entries[i];
            debug!("Trying server {} (index {})", endpoint, i);
            match net::connect(endpoint, connect_timeout).await {
                Ok(stream) => {
                    self.current.store(i, Ordering::Relaxed);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("Failed connecting to destination {}: {}", endpoint, e);
                    last_err = Some(e);
                }
            }
        }

        // Exhausted; start over from the head on the next pick.
        self.current.store(0, Ordering::Relaxed);
        match last_err {
            Some(e) => Err(RouterError::Destination(e)),
            None => Err(RouterError::no_destinations("empty destination list")),
        }
    }
}
