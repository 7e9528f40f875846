/// Round-robin over a static destination list
///
/// Each pick starts one past the previous pick's starting point; a connect
/// failure moves on to the next address and the pick fails only after one
/// full cycle. The cursor lives in process memory: a restart begins again at
/// the head of the configured list.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::net::TcpStream;

use super::{Destination, EndpointList};
use crate::error::RouterError;
use crate::net::{self, Endpoint};

pub struct RoundRobinDestination {
    list: EndpointList,
    next: AtomicUsize,
}

impl RoundRobinDestination {
    pub fn new() -> Self {
        Self {
            list: EndpointList::new(),
            next: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinDestination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Destination for RoundRobinDestination {
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

        let start = self.next.fetch_add(1, Ordering::Relaxed) % entries.len();
        let mut last_err = None;
        for i in 0..entries.len() {
            let endpoint = &entries[(start + i) % entries.len()];
            match net::connect(endpoint, connect_timeout).await {
                Ok(stream) => return Ok(stream),
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
