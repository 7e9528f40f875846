/// Metadata-cache-driven destination
///
/// Every pick reads the current topology snapshot, filters the replica set's
/// members by the role the route asked for, and picks per the route's access
/// mode: read-write routes stick with the first eligible member, read-only
/// routes round-robin in declared order. Connect failures annotate the
/// snapshot so the instance is skipped until the next refresh, and a
/// read-write pick waits briefly for a failover before giving up.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use tokio::net::TcpStream;

use super::Destination;
use crate::error::RouterError;
use crate::metadata::{InstanceReachability, ServerMode, TopologyCache};
use crate::net::{self, Endpoint};
use crate::protocol::RouteProtocol;
use crate::routing::AccessMode;

/// Declared role tag members must carry to be routed to.
const ELIGIBLE_ROLE: &str = "HA";

/// How long a read-write pick waits for a new primary after a failed connect.
const PRIMARY_FAILOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Which members a metadata-cache URL asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleFilter {
    Primary,
    Secondary,
    PrimaryAndSecondary,
}

impl RoleFilter {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PRIMARY" => Some(RoleFilter::Primary),
            "SECONDARY" => Some(RoleFilter::Secondary),
            "PRIMARY_AND_SECONDARY" => Some(RoleFilter::PrimaryAndSecondary),
            _ => None,
        }
    }
}

/// Parsed form of `metadata-cache://<key>/<replicaset>?role=…`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataUri {
    pub key: String,
    pub replicaset: String,
    pub role: RoleFilter,
    pub allow_primary_reads: bool,
}

/// Parse a metadata-cache destination URL. The error is a human-readable
/// reason suitable for configuration messages.
pub fn parse_metadata_uri(uri: &str) -> Result<MetadataUri, String> {
    let rest = uri
        .strip_prefix("metadata-cache://")
        .ok_or_else(|| format!("invalid URI scheme; expecting 'metadata-cache' (was '{}')", uri))?;

    let (authority, tail) = match rest.split_once('/') {
        Some((authority, tail)) => (authority, tail),
        None => (rest, ""),
    };
    let (path, query) = match tail.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => match authority.split_once('?') {
            // no path at all: metadata-cache://key?role=…
            Some((key, query)) => {
                return parse_with_parts(key, "", Some(query));
            }
            None => (tail, None),
        },
    };

    parse_with_parts(authority, path, query)
}

fn parse_with_parts(key: &str, path: &str, query: Option<&str>) -> Result<MetadataUri, String> {
    let replicaset = path.split('/').next().unwrap_or("");
    let replicaset = if replicaset.is_empty() {
        "default"
    } else {
        replicaset
    };

    let mut role = None;
    let mut allow_primary_reads = false;
    if let Some(query) = query {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            match name {
                "role" => {
                    role = Some(RoleFilter::from_name(value).ok_or_else(|| {
                        format!("invalid 'role' in destination specification (was '{}')", value)
                    })?);
                }
                "allow_primary_reads" => {
                    allow_primary_reads = value.eq_ignore_ascii_case("yes");
                }
                other => {
                    return Err(format!(
                        "unsupported query parameter '{}' in destination specification",
                        other
                    ));
                }
            }
        }
    }

    Ok(MetadataUri {
        key: key.to_string(),
        replicaset: replicaset.to_string(),
        role: role.ok_or("missing 'role' in routing destination specification")?,
        allow_primary_reads,
    })
}

pub struct MetadataDestination {
    cache: Arc<TopologyCache>,
    replicaset: String,
    role: RoleFilter,
    allow_primary_reads: bool,
    routing_mode: AccessMode,
    protocol: RouteProtocol,
    position: AtomicUsize,
    failover_wait: Duration,
}

impl MetadataDestination {
    pub fn new(
        cache: Arc<TopologyCache>,
        uri: MetadataUri,
        routing_mode: AccessMode,
        protocol: RouteProtocol,
    ) -> Self {
        let mut allow_primary_reads = uri.allow_primary_reads;
        if allow_primary_reads && routing_mode != AccessMode::ReadOnly {
            warn!("allow_primary_reads only works with read-only mode");
            allow_primary_reads = false;
        }

        Self {
            cache,
            replicaset: uri.replicaset,
            role: uri.role,
            allow_primary_reads,
            routing_mode,
            protocol,
            position: AtomicUsize::new(0),
            failover_wait: PRIMARY_FAILOVER_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_failover_wait(mut self, wait: Duration) -> Self {
        self.failover_wait = wait;
        self
    }

    fn member_eligible(&self, mode: ServerMode) -> bool {
        match self.role {
            RoleFilter::Primary => mode == ServerMode::ReadWrite,
            RoleFilter::Secondary => {
                mode == ServerMode::ReadOnly
                    || (self.allow_primary_reads && mode == ServerMode::ReadWrite)
            }
            RoleFilter::PrimaryAndSecondary => {
                mode == ServerMode::ReadWrite || mode == ServerMode::ReadOnly
            }
        }
    }

    /// Eligible members with their connect addresses, in declared order.
    fn available(&self) -> Vec<(Endpoint, String)> {
        self.cache
            .replicaset_lookup(&self.replicaset)
            .into_iter()
            .filter(|m| m.role == ELIGIBLE_ROLE)
            .filter(|m| self.member_eligible(m.mode))
            .map(|m| {
                let port = match self.protocol {
                    RouteProtocol::Classic => m.port,
                    RouteProtocol::X => m.xport,
                };
                (Endpoint::new(m.host, port), m.server_uuid)
            })
            .collect()
    }
}

#[async_trait]
impl Destination for MetadataDestination {
    fn add(&self, endpoint: Endpoint) {
        // addresses come from the topology cache, never from configuration
        warn!(
            "Ignoring static destination {} on metadata-cache route for '{}'",
            endpoint, self.replicaset
        );
    }

    fn size(&self) -> usize {
        self.available().len()
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.available().into_iter().map(|(e, _)| e).collect()
    }

    async fn connect(&self, connect_timeout: Duration) -> Result<TcpStream, RouterError> {
        loop {
            let available = self.available();
            if available.is_empty() {
                warn!(
                    "No available {} servers found for '{}'",
                    match self.routing_mode {
                        AccessMode::ReadOnly => "RO",
                        _ => "RW",
                    },
                    self.replicaset
                );
                return Err(RouterError::no_destinations(format!(
                    "replicaset '{}'",
                    self.replicaset
                )));
            }

            // read-only routes round-robin in declared order; everything else
            // sticks with the first eligible member
            let index = match self.routing_mode {
                AccessMode::ReadOnly => {
                    self.position.fetch_add(1, Ordering::Relaxed) % available.len()
                }
                _ => 0,
            };
            let (endpoint, server_uuid) = &available[index];

            match net::connect(endpoint, connect_timeout).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!("Failed connecting to instance {} ({}): {}", server_uuid, endpoint, e);
                    self.cache
                        .mark_instance_reachability(server_uuid, InstanceReachability::Unreachable);

                    // a writable member may be about to reappear elsewhere
                    if self.routing_mode == AccessMode::ReadWrite
                        && self
                            .cache
                            .wait_primary_failover(&self.replicaset, self.failover_wait)
                            .await
                    {
                        info!(
                            "Retrying connection for '{}' after possible failover",
                            self.replicaset
                        );
                        continue;
                    }
                    return Err(RouterError::Destination(e));
                }
            }
        }
    }
}
