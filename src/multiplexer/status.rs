use std::fmt;

use crate::backend::{BridgeCounters, ConnectionPurpose};
use crate::topology::{RoutingSnapshot, SelectableFlags, ServerRole, ServerType};

/// Point-in-time view of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub address: String,
    pub server_type: ServerType,
    pub role: ServerRole,
    pub flags: SelectableFlags,
    pub version: Option<String>,
    pub databases: u32,
    pub selectable: bool,
    pub is_elected_master: bool,
    pub interactive: BridgeCounters,
    pub subscription: BridgeCounters,
}

pub(crate) fn collect(snapshot: &RoutingSnapshot) -> Vec<EndpointStatus> {
    snapshot
        .endpoints
        .iter()
        .map(|endpoint| EndpointStatus {
            address: endpoint.address().to_string(),
            server_type: endpoint.server_type(),
            role: endpoint.role(),
            flags: endpoint.flags(),
            version: endpoint.version(),
            databases: endpoint.databases(),
            selectable: endpoint.is_selectable(ConnectionPurpose::Interactive),
            is_elected_master: snapshot.master.as_deref() == Some(endpoint.address()),
            interactive: endpoint.interactive().counters(),
            subscription: endpoint.subscription().counters(),
        })
        .collect()
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} interactive={} subscription={}",
            self.address,
            self.server_type,
            self.role,
            self.interactive.state,
            self.subscription.state
        )?;
        if let Some(conn) = &self.interactive.connection {
            write!(
                f,
                " ops={} queued={} pending={}",
                conn.operations, conn.queue_depth, conn.pending
            )?;
        }
        if !self.flags.is_empty() {
            write!(f, " flags={:?}", self.flags)?;
        }
        if self.is_elected_master {
            f.write_str(" [master]")?;
        }
        Ok(())
    }
}
