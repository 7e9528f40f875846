/// Topology cache for managed replica sets
///
/// The cache observes two views of the backend cluster: the *declared*
/// topology from the metadata schema (what the cluster should contain) and
/// the *live* group state reported by one of its members (what a member
/// currently sees). A background refresher reconciles the two and publishes
/// immutable snapshots that destination strategies read on every pick.
pub mod cache;
pub mod fetch;
pub mod session;

use std::collections::HashMap;

use thiserror::Error;

pub use cache::TopologyCache;
pub use session::{MetadataSession, Row, SessionFactory};

/// Errors raised by the metadata subsystem
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed connecting with any of the bootstrap servers")]
    NoBootstrapServer,

    #[error("metadata query failed: {0}")]
    Query(String),

    #[error("unexpected resultset shape: {0}")]
    BadResultset(String),

    #[error("connection to metadata server lost: {0}")]
    ConnectionLost(String),
}

/// What a member is allowed to serve, derived from its live group state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    ReadWrite,
    ReadOnly,
    Unavailable,
}

/// Health of a whole replica set after reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicasetStatus {
    /// Quorum with an elected primary
    AvailableWritable,
    /// Quorum, but no writable member (typically mid-failover)
    AvailableReadOnly,
    /// No quorum; nothing may be routed here
    Unavailable,
}

/// Local reachability hint for a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceReachability {
    Reachable,
    Unreachable,
}

/// Live state of a group member as reported by the cluster itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Online,
    Recovering,
    Unreachable,
    Offline,
    Other,
}

impl GroupState {
    pub fn from_str(value: &str) -> Self {
        match value {
            "ONLINE" => GroupState::Online,
            "RECOVERING" => GroupState::Recovering,
            "UNREACHABLE" => GroupState::Unreachable,
            "OFFLINE" => GroupState::Offline,
            _ => GroupState::Other,
        }
    }
}

/// Role of a group member within the live group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRole {
    Primary,
    Secondary,
}

/// One row of live group state, keyed by server UUID in [`fetch`].
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub state: GroupState,
    pub role: GroupRole,
    pub host: String,
    pub port: u16,
}

/// A backend as declared in the metadata schema, annotated with the mode
/// derived from its live state during reconciliation.
#[derive(Debug, Clone)]
pub struct ManagedInstance {
    pub replicaset_name: String,
    pub server_uuid: String,
    /// Declared role, e.g. "HA"
    pub role: String,
    pub host: String,
    /// Classic protocol port
    pub port: u16,
    /// X protocol port; defaults to `port * 10` when the metadata omits it
    pub xport: u16,
    pub weight: f32,
    pub version_token: u32,
    pub location: String,
    pub mode: ServerMode,
}

/// A named replica set: declared members plus reconciled status.
#[derive(Debug, Clone)]
pub struct ManagedReplicaSet {
    pub name: String,
    pub members: Vec<ManagedInstance>,
    pub single_primary_mode: bool,
    pub status: ReplicasetStatus,
}

impl ManagedReplicaSet {
    pub fn new(name: String) -> Self {
        Self {
            name,
            members: Vec::new(),
            single_primary_mode: true,
            status: ReplicasetStatus::Unavailable,
        }
    }
}

/// Immutable, versioned view of every replica set.
///
/// Built by the refresher, published whole; never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    pub version: u64,
    pub replicasets: HashMap<String, ManagedReplicaSet>,
}
