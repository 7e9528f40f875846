/// Fetching and reconciling the two topology views
///
/// The declared topology comes from the metadata schema on the bootstrap
/// session; the live group state comes from whichever replica set member
/// answers first. [`check_replicaset_status`] merges them: declared members
/// get their mode from live state, quorum is judged against the live member
/// count, and the declared ordering is preserved so downstream round-robin
/// stays stable across refreshes.
use std::collections::HashMap;

use log::{debug, error, info, warn};

use super::session::{MetadataSession, Row, SessionFactory};
use super::{
    GroupMember, GroupRole, GroupState, ManagedInstance, ManagedReplicaSet, MetadataError,
    ReplicasetStatus, ServerMode,
};
use crate::net::Endpoint;
use std::sync::Arc;

/// Live group state query. The exact text is part of the compatibility
/// surface with the backing servers.
pub const GROUP_MEMBERS_QUERY: &str = "SELECT member_id, member_host, member_port, member_state, \
     @@group_replication_single_primary_mode FROM \
     performance_schema.replication_group_members WHERE channel_name = 'group_replication_applier'";

/// Which member the group currently considers primary.
pub const PRIMARY_MEMBER_QUERY: &str = "show status like 'group_replication_primary_member'";

/// Declared topology for one cluster name.
pub fn declared_topology_query(cluster_name: &str) -> String {
    format!(
        "SELECT R.replicaset_name, I.mysql_server_uuid, I.role, I.weight, I.version_token, \
         H.location, I.addresses->>'$.mysqlClassic', I.addresses->>'$.mysqlX' \
         FROM mysql_innodb_cluster_metadata.clusters AS F \
         JOIN mysql_innodb_cluster_metadata.replicasets AS R ON F.cluster_id = R.cluster_id \
         JOIN mysql_innodb_cluster_metadata.instances AS I ON R.replicaset_id = I.replicaset_id \
         JOIN mysql_innodb_cluster_metadata.hosts AS H ON I.host_id = H.host_id \
         WHERE F.cluster_name = {};",
        quote(cluster_name)
    )
}

/// Quote a string literal for embedding in a query.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\'' => quoted.push_str("''"),
            '\\' => quoted.push_str("\\\\"),
            _ => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

fn column<'a>(row: &'a Row, index: usize) -> Option<&'a str> {
    row.get(index).and_then(|v| v.as_deref())
}

/// Split a `host:port` address column, with a protocol default port.
fn parse_address(value: &str, default_port: u16) -> Option<(String, u16)> {
    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.starts_with('[') => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            port.parse::<u16>().ok().map(|p| (host.to_string(), p))
        }
        _ => Some((value.to_string(), default_port)),
    }
}

/// Deserialize the declared-topology resultset into replica sets keyed by
/// name. Rows with unparsable addresses are skipped with a warning; a row
/// with the wrong number of columns fails the whole refresh.
pub fn parse_declared_rows(
    rows: &[Row],
) -> Result<HashMap<String, ManagedReplicaSet>, MetadataError> {
    let mut replicasets: HashMap<String, ManagedReplicaSet> = HashMap::new();

    for row in rows {
        if row.len() != 8 {
            return Err(MetadataError::BadResultset(format!(
                "expected 8 fields in the declared topology resultset, got {}",
                row.len()
            )));
        }

        let replicaset_name = column(row, 0).unwrap_or("").to_string();
        let server_uuid = column(row, 1).unwrap_or("").to_string();

        let classic = match column(row, 6) {
            Some(value) => value,
            None => {
                warn!(
                    "Missing classic address in metadata for instance {}",
                    server_uuid
                );
                continue;
            }
        };
        let (host, port) = match parse_address(classic, 3306) {
            Some(parsed) => parsed,
            None => {
                warn!(
                    "Error parsing address in metadata for instance {}: '{}'",
                    server_uuid, classic
                );
                continue;
            }
        };

        // X protocol support is not mandatory in the metadata
        let xport = match column(row, 7) {
            Some(value) if !value.is_empty() => match parse_address(value, 33060) {
                Some((_, xport)) => xport,
                None => {
                    warn!(
                        "Error parsing X address in metadata for instance {}: '{}'",
                        server_uuid, value
                    );
                    continue;
                }
            },
            _ => port.saturating_mul(10),
        };

        let instance = ManagedInstance {
            replicaset_name: replicaset_name.clone(),
            server_uuid,
            role: column(row, 2).unwrap_or("").to_string(),
            host,
            port,
            xport,
            weight: column(row, 3).and_then(|v| v.parse().ok()).unwrap_or(0.0),
            version_token: column(row, 4).and_then(|v| v.parse().ok()).unwrap_or(0),
            location: column(row, 5).unwrap_or("").to_string(),
            mode: ServerMode::Unavailable,
        };

        let entry = replicasets
            .entry(replicaset_name.clone())
            .or_insert_with(|| ManagedReplicaSet::new(replicaset_name));
        entry.members.push(instance);
    }

    Ok(replicasets)
}

/// Deserialize live group state: the single-primary flag plus one
/// [`GroupMember`] per UUID, with roles derived from the reported primary.
pub fn parse_group_rows(
    primary_uuid: Option<&str>,
    rows: &[Row],
) -> Result<(bool, HashMap<String, GroupMember>), MetadataError> {
    let mut members = HashMap::new();
    let mut single_primary_mode = true;

    for row in rows {
        if row.len() != 5 {
            return Err(MetadataError::BadResultset(format!(
                "expected 5 fields in the group members resultset, got {}",
                row.len()
            )));
        }

        let uuid = column(row, 0).unwrap_or("").to_string();
        let state = GroupState::from_str(column(row, 3).unwrap_or(""));
        let role = if Some(uuid.as_str()) == primary_uuid {
            GroupRole::Primary
        } else {
            GroupRole::Secondary
        };
        single_primary_mode = matches!(column(row, 4), Some("1") | Some("ON") | None);

        members.insert(
            uuid,
            GroupMember {
                state,
                role,
                host: column(row, 1).unwrap_or("").to_string(),
                port: column(row, 2).and_then(|v| v.parse().ok()).unwrap_or(0),
            },
        );
    }

    Ok((single_primary_mode, members))
}

/// Reconcile declared members against live group state.
///
/// Sets each declared member's mode from its live state, counts the online
/// members, and judges quorum against the *live* member count. Live members
/// missing from the declared set are reported loudly; they can never be
/// routed to.
pub fn check_replicaset_status(
    members: &mut [ManagedInstance],
    live: &HashMap<String, GroupMember>,
) -> ReplicasetStatus {
    for (uuid, status) in live {
        if !members.iter().any(|m| &m.server_uuid == uuid) {
            error!(
                "Member {}:{} ({}) found in replicaset, yet is not defined in metadata!",
                status.host, status.port, uuid
            );
        }
    }

    let mut online_count = 0usize;
    let mut have_primary = false;
    for member in members.iter_mut() {
        match live.get(&member.server_uuid) {
            Some(status) => match status.state {
                GroupState::Online => match status.role {
                    GroupRole::Primary => {
                        have_primary = true;
                        member.mode = ServerMode::ReadWrite;
                        online_count += 1;
                    }
                    GroupRole::Secondary => {
                        member.mode = ServerMode::ReadOnly;
                        online_count += 1;
                    }
                },
                GroupState::Recovering
                | GroupState::Unreachable
                | GroupState::Offline
                | GroupState::Other => {
                    member.mode = ServerMode::Unavailable;
                }
            },
            None => {
                member.mode = ServerMode::Unavailable;
                warn!(
                    "Member {}:{} ({}) defined in metadata not found in actual replicaset",
                    member.host, member.port, member.server_uuid
                );
            }
        }
    }

    let have_quorum = online_count > live.len() / 2;
    if have_quorum {
        if have_primary {
            ReplicasetStatus::AvailableWritable
        } else {
            ReplicasetStatus::AvailableReadOnly
        }
    } else {
        ReplicasetStatus::Unavailable
    }
}

/// Owns the bootstrap session and produces fully reconciled replica sets.
pub struct ClusterFetcher {
    factory: Arc<dyn SessionFactory>,
    bootstrap_servers: Vec<Endpoint>,
    cluster_name: String,
    session: Option<Box<dyn MetadataSession>>,
}

impl ClusterFetcher {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        bootstrap_servers: Vec<Endpoint>,
        cluster_name: String,
    ) -> Self {
        Self {
            factory,
            bootstrap_servers,
            cluster_name,
            session: None,
        }
    }

    /// Connect to the first reachable bootstrap server, reusing an existing
    /// session when one survived the previous refresh.
    async fn ensure_session(&mut self) -> Result<(), MetadataError> {
        if self.session.is_some() {
            return Ok(());
        }

        for server in &self.bootstrap_servers {
            match self.factory.connect(&server.host, server.port).await {
                Ok(session) => {
                    info!(
                        "Connected with metadata server running on {}:{}",
                        server.host, server.port
                    );
                    self.session = Some(session);
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        "Failed connecting with Metadata Server {}:{}: {}",
                        server.host, server.port, e
                    );
                }
            }
        }

        error!("Failed connecting with any of the bootstrap servers");
        Err(MetadataError::NoBootstrapServer)
    }

    /// One full refresh: declared topology, then live status per replica set.
    ///
    /// Query failures drop the bootstrap session so the next refresh
    /// reconnects from the top of the bootstrap list.
    pub async fn fetch(&mut self) -> Result<HashMap<String, ManagedReplicaSet>, MetadataError> {
        self.ensure_session().await?;
        debug!(
            "Updating metadata information for cluster '{}'",
            self.cluster_name
        );

        let query = declared_topology_query(&self.cluster_name);
        let rows = match self
            .session
            .as_mut()
            .ok_or(MetadataError::NoBootstrapServer)?
            .query(&query)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                self.session = None;
                return Err(MetadataError::ConnectionLost(e.to_string()));
            }
        };

        let mut replicasets = parse_declared_rows(&rows)?;
        if replicasets.is_empty() {
            warn!("No replicasets defined for cluster '{}'", self.cluster_name);
        }

        for (name, replicaset) in replicasets.iter_mut() {
            self.update_replicaset_status(name, replicaset).await;
        }

        Ok(replicasets)
    }

    /// Find a member that answers the live-state queries and fold its view
    /// into the declared members. Without a quorum view the replica set is
    /// published empty so routing refuses to dispatch to it.
    async fn update_replicaset_status(&mut self, name: &str, replicaset: &mut ManagedReplicaSet) {
        debug!("Updating replicaset status from live group state for '{}'", name);
        let bootstrap_address = self.session.as_ref().map(|s| s.address().to_string());
        let candidates = replicaset.members.clone();
        let mut found_quorum = false;

        for candidate in &candidates {
            let host = if candidate.host == "localhost" {
                "127.0.0.1"
            } else {
                candidate.host.as_str()
            };
            let candidate_address = format!("{}:{}", host, candidate.port);

            // The bootstrap node may itself belong to this replica set; share
            // its session rather than opening a second one.
            let probed = if Some(&candidate_address) == bootstrap_address.as_ref() {
                match self.session.as_mut() {
                    Some(session) => probe_group(&mut **session).await,
                    None => continue,
                }
            } else {
                match self.factory.connect(host, candidate.port).await {
                    Ok(mut session) => probe_group(&mut *session).await,
                    Err(e) => {
                        error!(
                            "While updating metadata, could not establish a connection to \
                             replicaset '{}' through {}: {}",
                            name, candidate_address, e
                        );
                        continue;
                    }
                }
            };

            let (single_primary_mode, live) = match probed {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        "Unable to fetch live group state from {} for replicaset '{}': {}",
                        candidate_address, name, e
                    );
                    continue;
                }
            };

            debug!(
                "Replicaset '{}' has {} members in metadata, {} in status table",
                name,
                replicaset.members.len(),
                live.len()
            );

            let status = check_replicaset_status(&mut replicaset.members, &live);
            match status {
                ReplicasetStatus::AvailableWritable | ReplicasetStatus::AvailableReadOnly => {
                    replicaset.status = status;
                    replicaset.single_primary_mode = single_primary_mode;
                    found_quorum = true;
                    break;
                }
                ReplicasetStatus::Unavailable => {
                    warn!(
                        "{} is not part of quorum for replicaset '{}'",
                        candidate_address, name
                    );
                    continue;
                }
            }
        }

        if !found_quorum {
            error!(
                "Unable to fetch live group state from any server in replicaset '{}'",
                name
            );
            // Publish nothing for this replica set so routing refuses to
            // dispatch until quorum returns.
            replicaset.status = ReplicasetStatus::Unavailable;
            replicaset.members.clear();
        }
    }
}

/// Run the two live-state queries against one member.
async fn probe_group(
    session: &mut dyn MetadataSession,
) -> Result<(bool, HashMap<String, GroupMember>), MetadataError> {
    let primary_rows = session.query(PRIMARY_MEMBER_QUERY).await?;
    let primary_uuid = primary_rows
        .first()
        .and_then(|row| row.get(1).cloned().flatten());

    let member_rows = session.query(GROUP_MEMBERS_QUERY).await?;
    parse_group_rows(primary_uuid.as_deref(), &member_rows)
}
