use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::backend::{ConnectionBridge, ConnectionPurpose};
use crate::error::{MuxError, MuxResult};
use crate::protocol::redis::{Message, ReadMode, RolePreference};

use super::endpoint::{EndpointRegistry, RoutingSnapshot, ServerEndpoint};
use super::info::ServerRole;

#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingPolicy {
    pub allow_admin: bool,
    pub allow_replica_writes: bool,
}

/// Picks the bridge a message goes to.
pub struct TopologyRouter {
    registry: Arc<EndpointRegistry>,
    policy: RoutingPolicy,
    cursor: AtomicUsize,
}

impl TopologyRouter {
    pub fn new(registry: Arc<EndpointRegistry>, policy: RoutingPolicy) -> Self {
        Self {
            registry,
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn select(&self, message: &Message) -> MuxResult<Arc<ConnectionBridge>> {
        let command = &message.command;
        if command.is_admin() && !message.is_internal() && !self.policy.allow_admin {
            return Err(MuxError::AdminNotPermitted {
                command: command.to_string(),
            });
        }

        let mut preference = message.role_preference();
        let master_only = command.is_master_only() && !self.policy.allow_replica_writes;
        if master_only {
            if preference == RolePreference::DemandReplica {
                return Err(MuxError::MasterOnly {
                    command: command.to_string(),
                });
            }
            preference = RolePreference::DemandMaster;
        }

        let purpose = if command.is_subscription() {
            ConnectionPurpose::Subscription
        } else {
            ConnectionPurpose::Interactive
        };

        let snapshot = self.registry.snapshot();
        let chosen = if snapshot.is_cluster() {
            let slot = message.slot().map_err(|conflict| MuxError::CrossSlot {
                command: command.to_string(),
                first: conflict.first,
                second: conflict.second,
            })?;
            match slot {
                Some(slot) => self.select_slot_owner(&snapshot, slot, preference, purpose),
                None => self.select_any(&snapshot, preference, purpose),
            }
        } else {
            self.select_any(&snapshot, preference, purpose)
        };

        match chosen {
            Some(endpoint) => {
                trace!(
                    command = %command,
                    endpoint = %endpoint.address(),
                    purpose = %purpose,
                    "routed"
                );
                Ok(endpoint.bridge(purpose).clone())
            }
            None => Err(self.no_route(&snapshot, message, preference, purpose)),
        }
    }

    /// Read mode a message must carry on `bridge`: cluster replicas only
    /// serve reads after `READONLY`.
    pub fn read_mode_for(&self, bridge: &ConnectionBridge) -> Option<ReadMode> {
        let snapshot = self.registry.snapshot();
        if !snapshot.is_cluster() {
            return None;
        }
        match snapshot.endpoint(bridge.endpoint())?.role() {
            ServerRole::Replica => Some(ReadMode::ReadOnly),
            ServerRole::Master => None,
        }
    }

    fn select_slot_owner(
        &self,
        snapshot: &RoutingSnapshot,
        slot: u16,
        preference: RolePreference,
        purpose: ConnectionPurpose,
    ) -> Option<Arc<ServerEndpoint>> {
        let Some(table) = snapshot.slots.as_ref() else {
            return self.select_any(snapshot, preference, purpose);
        };
        let Some(owner) = table.owner(slot) else {
            return self.select_any(snapshot, preference, purpose);
        };
        let selectable = |address: &str| {
            snapshot
                .endpoint(address)
                .filter(|ep| ep.is_selectable(purpose))
                .cloned()
        };
        let master = selectable(&owner.endpoint);
        let replicas: Vec<Arc<ServerEndpoint>> = table
            .replicas_of(owner)
            .filter(|node| !node.failed)
            .filter_map(|node| selectable(&node.endpoint))
            .collect();
        let replica = self.rotate(&replicas);

        let found = match preference {
            RolePreference::DemandMaster => master,
            RolePreference::Any | RolePreference::PreferMaster => master.or(replica),
            RolePreference::PreferReplica => replica.or(master),
            RolePreference::DemandReplica => replica,
        };
        if found.is_some() || preference == RolePreference::DemandReplica {
            return found;
        }
        // Owner unreachable: any master will answer with MOVED if wrong.
        let masters = self.candidates(snapshot, purpose, ServerRole::Master);
        self.rotate(&masters)
    }

    fn select_any(
        &self,
        snapshot: &RoutingSnapshot,
        preference: RolePreference,
        purpose: ConnectionPurpose,
    ) -> Option<Arc<ServerEndpoint>> {
        let masters = self.candidates(snapshot, purpose, ServerRole::Master);
        let replicas = self.candidates(snapshot, purpose, ServerRole::Replica);
        match preference {
            RolePreference::DemandMaster => self.rotate(&masters),
            RolePreference::Any | RolePreference::PreferMaster => {
                self.rotate(&masters).or_else(|| self.rotate(&replicas))
            }
            RolePreference::PreferReplica => {
                self.rotate(&replicas).or_else(|| self.rotate(&masters))
            }
            RolePreference::DemandReplica => self.rotate(&replicas),
        }
    }

    fn candidates(
        &self,
        snapshot: &RoutingSnapshot,
        purpose: ConnectionPurpose,
        role: ServerRole,
    ) -> Vec<Arc<ServerEndpoint>> {
        snapshot
            .endpoints
            .iter()
            .filter(|ep| ep.is_selectable(purpose))
            .filter(|ep| ep.role() == role)
            .cloned()
            .collect()
    }

    fn rotate(&self, endpoints: &[Arc<ServerEndpoint>]) -> Option<Arc<ServerEndpoint>> {
        if endpoints.is_empty() {
            return None;
        }
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed);
        endpoints.get(offset % endpoints.len()).cloned()
    }

    fn no_route(
        &self,
        snapshot: &RoutingSnapshot,
        message: &Message,
        preference: RolePreference,
        purpose: ConnectionPurpose,
    ) -> MuxError {
        let replicas_only = preference == RolePreference::DemandMaster
            && !self
                .candidates(snapshot, purpose, ServerRole::Replica)
                .is_empty();
        if replicas_only {
            return MuxError::MasterOnly {
                command: message.command.to_string(),
            };
        }
        MuxError::NoConnectionAvailable {
            command: message.to_string(),
            status: snapshot.describe(),
        }
    }
}
