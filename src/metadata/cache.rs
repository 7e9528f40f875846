/// The refreshing topology cache
///
/// One cache instance runs per configured metadata source, shared by every
/// metadata-backed destination. A background task refreshes the topology
/// `ttl` seconds after the *completion* of the previous refresh and publishes
/// each result as a whole new snapshot through a watch cell: readers always
/// see a consistent version, and waiters are woken on every publish.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};

use super::fetch::ClusterFetcher;
use super::session::SessionFactory;
use super::{
    InstanceReachability, ManagedInstance, MetadataError, ServerMode, TopologySnapshot,
};
use crate::net::Endpoint;

pub struct TopologyCache {
    fetcher: Mutex<ClusterFetcher>,
    snapshot_tx: watch::Sender<Arc<TopologySnapshot>>,
    stop_tx: watch::Sender<bool>,
    ttl: Duration,
    version: AtomicU64,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl TopologyCache {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        bootstrap_servers: Vec<Endpoint>,
        cluster_name: String,
        ttl: Duration,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(Arc::new(TopologySnapshot::default()));
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            fetcher: Mutex::new(ClusterFetcher::new(factory, bootstrap_servers, cluster_name)),
            snapshot_tx,
            stop_tx,
            ttl,
            version: AtomicU64::new(0),
            refresher: Mutex::new(None),
        })
    }

    /// Run the initial refresh and spawn the background refresher.
    ///
    /// The initial refresh is allowed to fail (the cluster may be starting
    /// up); the refresher keeps retrying every `ttl` and the empty initial
    /// snapshot simply routes nothing until then.
    pub async fn start(self: Arc<Self>) {
        if let Err(e) = self.refresh().await {
            warn!("Initial metadata refresh failed: {}", e);
        }

        let cache = Arc::clone(&self);
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = sleep(cache.ttl) => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
                // A failed refresh keeps the previous snapshot live and
                // simply reschedules.
                if let Err(e) = cache.refresh().await {
                    warn!("Metadata refresh failed: {}", e);
                }
            }
            debug!("Metadata refresher stopped");
        });
        *self.refresher.lock().await = Some(handle);
    }

    /// Ask the refresher to stop after its current cycle.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Fetch and publish a new snapshot. Exposed for callers that cannot
    /// wait for the next TTL tick (tests, admin triggers).
    pub async fn refresh(&self) -> Result<(), MetadataError> {
        let replicasets = self.fetcher.lock().await.fetch().await?;
        let snapshot = TopologySnapshot {
            version: self.version.fetch_add(1, Ordering::Relaxed) + 1,
            replicasets,
        };
        info!(
            "Publishing metadata snapshot v{} with {} replicaset(s)",
            snapshot.version,
            snapshot.replicasets.len()
        );
        self.snapshot_tx.send_replace(Arc::new(snapshot));
        Ok(())
    }

    /// Current snapshot; one strong reference per operation.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Declared members of a replica set with their reconciled modes.
    /// Unknown and unavailable replica sets yield an empty list.
    pub fn replicaset_lookup(&self, replicaset: &str) -> Vec<ManagedInstance> {
        self.snapshot()
            .replicasets
            .get(replicaset)
            .map(|rs| rs.members.clone())
            .unwrap_or_default()
    }

    /// Locally annotate an instance's reachability until the next refresh
    /// overrides it. Marking Unreachable takes the member out of rotation
    /// right away; a Reachable hint lets the next refresh speak for itself.
    pub fn mark_instance_reachability(&self, server_uuid: &str, status: InstanceReachability) {
        if status != InstanceReachability::Unreachable {
            return;
        }

        let current = self.snapshot();
        let mut replicasets = current.replicasets.clone();
        let mut changed = false;
        for replicaset in replicasets.values_mut() {
            for member in replicaset.members.iter_mut() {
                if member.server_uuid == server_uuid {
                    warn!(
                        "Marking instance {} ({}:{}) as unreachable",
                        server_uuid, member.host, member.port
                    );
                    member.mode = ServerMode::Unavailable;
                    changed = true;
                }
            }
        }

        if changed {
            let snapshot = TopologySnapshot {
                version: self.version.fetch_add(1, Ordering::Relaxed) + 1,
                replicasets,
            };
            self.snapshot_tx.send_replace(Arc::new(snapshot));
        }
    }

    /// Block until the replica set has a writable member, or `wait_timeout`
    /// elapses. Returns promptly when a primary is already present.
    pub async fn wait_primary_failover(&self, replicaset: &str, wait_timeout: Duration) -> bool {
        let deadline = Instant::now() + wait_timeout;
        let mut rx = self.snapshot_tx.subscribe();

        loop {
            let has_primary = rx
                .borrow_and_update()
                .replicasets
                .get(replicaset)
                .map(|rs| rs.members.iter().any(|m| m.mode == ServerMode::ReadWrite))
                .unwrap_or(false);
            if has_primary {
                return true;
            }

            match timeout_at(deadline, rx.changed()).await {
                // publisher gone or timed out: no primary appeared
                Err(_) => return false,
                Ok(Err(_)) => return false,
                Ok(Ok(())) => {}
            }
        }
    }
}
