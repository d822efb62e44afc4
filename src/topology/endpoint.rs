use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use bitflags::bitflags;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::backend::{
    BridgeEvent, BridgeSettings, ConnectionBridge, ConnectionPurpose, Connector, WriterPool,
};
use crate::protocol::redis::{PushMessage, SlotTable};

use super::info::{ServerRole, ServerType};

const DEFAULT_DATABASES: u32 = 16;

bitflags! {
    /// Reasons an endpoint is excluded from routing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SelectableFlags: u8 {
        /// A master that lost the election.
        const REDUNDANT_MASTER = 0b001;
        /// Did not answer the last topology probe.
        const UNRESPONSIVE = 0b010;
        /// Reports a mode incompatible with the rest of the topology.
        const WRONG_TYPE = 0b100;
    }
}

/// One server and its two bridges.
///
/// Role, type and flags are atomics so probes and failure callbacks update
/// them without touching the routing snapshot.
#[derive(Debug)]
pub struct ServerEndpoint {
    address: Arc<str>,
    interactive: Arc<ConnectionBridge>,
    subscription: Arc<ConnectionBridge>,
    role: AtomicU8,
    server_type: AtomicU8,
    flags: AtomicU8,
    version: ArcSwapOption<String>,
    databases: AtomicU32,
}

impl ServerEndpoint {
    pub fn new(
        address: Arc<str>,
        interactive: Arc<ConnectionBridge>,
        subscription: Arc<ConnectionBridge>,
    ) -> Self {
        Self {
            address,
            interactive,
            subscription,
            role: AtomicU8::new(ServerRole::Master as u8),
            server_type: AtomicU8::new(ServerType::Standalone as u8),
            flags: AtomicU8::new(0),
            version: ArcSwapOption::empty(),
            databases: AtomicU32::new(DEFAULT_DATABASES),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn bridge(&self, purpose: ConnectionPurpose) -> &Arc<ConnectionBridge> {
        match purpose {
            ConnectionPurpose::Interactive => &self.interactive,
            ConnectionPurpose::Subscription => &self.subscription,
        }
    }

    pub fn interactive(&self) -> &Arc<ConnectionBridge> {
        &self.interactive
    }

    pub fn subscription(&self) -> &Arc<ConnectionBridge> {
        &self.subscription
    }

    pub fn role(&self) -> ServerRole {
        match self.role.load(Ordering::Acquire) {
            1 => ServerRole::Replica,
            _ => ServerRole::Master,
        }
    }

    pub fn set_role(&self, role: ServerRole) {
        self.role.store(role as u8, Ordering::Release);
    }

    pub fn server_type(&self) -> ServerType {
        match self.server_type.load(Ordering::Acquire) {
            1 => ServerType::Cluster,
            2 => ServerType::Sentinel,
            3 => ServerType::Proxy,
            _ => ServerType::Standalone,
        }
    }

    pub fn set_server_type(&self, server_type: ServerType) {
        self.server_type
            .store(server_type as u8, Ordering::Release);
    }

    pub fn flags(&self) -> SelectableFlags {
        SelectableFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, flag: SelectableFlags, on: bool) {
        if on {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }

    pub fn version(&self) -> Option<String> {
        self.version.load_full().map(|v| v.as_ref().clone())
    }

    pub fn set_version(&self, version: Option<String>) {
        self.version.store(version.map(Arc::new));
    }

    pub fn databases(&self) -> u32 {
        self.databases.load(Ordering::Acquire)
    }

    pub fn set_databases(&self, databases: u32) {
        self.databases.store(databases.max(1), Ordering::Release);
    }

    /// Eligible for caller traffic on `purpose`.
    pub fn is_selectable(&self, purpose: ConnectionPurpose) -> bool {
        self.flags().is_empty()
            && self.server_type() != ServerType::Sentinel
            && self.bridge(purpose).is_established()
    }

    pub fn heartbeat(&self) {
        self.interactive.heartbeat();
        self.subscription.heartbeat();
    }

    pub fn close(&self) {
        self.interactive.close();
        self.subscription.close();
    }

    /// One-line summary for diagnostics.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "{} ({} {}, interactive={}, subscription={}",
            self.address,
            self.server_type(),
            self.role(),
            self.interactive.state(),
            self.subscription.state()
        );
        let flags = self.flags();
        if !flags.is_empty() {
            let _ = write!(out, ", flags={flags:?}");
        }
        out.push(')');
        out
    }
}

/// Immutable view routing decisions are made against.
#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    pub endpoints: Vec<Arc<ServerEndpoint>>,
    by_address: HashMap<Arc<str>, usize>,
    pub slots: Option<Arc<SlotTable>>,
    pub mode: Option<ServerType>,
    /// Elected master outside cluster mode.
    pub master: Option<Arc<str>>,
}

impl RoutingSnapshot {
    pub fn endpoint(&self, address: &str) -> Option<&Arc<ServerEndpoint>> {
        self.by_address
            .get(address)
            .and_then(|&idx| self.endpoints.get(idx))
    }

    pub fn is_cluster(&self) -> bool {
        self.mode == Some(ServerType::Cluster)
    }

    fn without(&self, removed: &[Arc<ServerEndpoint>]) -> RoutingSnapshot {
        let mut next = self.clone();
        next.endpoints
            .retain(|ep| !removed.iter().any(|gone| Arc::ptr_eq(gone, ep)));
        next.by_address = next
            .endpoints
            .iter()
            .enumerate()
            .map(|(idx, ep)| (ep.address.clone(), idx))
            .collect();
        next
    }

    fn with_endpoint(&self, endpoint: Arc<ServerEndpoint>) -> RoutingSnapshot {
        let mut next = self.clone();
        next.by_address
            .insert(endpoint.address.clone(), next.endpoints.len());
        next.endpoints.push(endpoint);
        next
    }

    /// Every endpoint's summary, for `NoConnectionAvailable` messages.
    pub fn describe(&self) -> String {
        if self.endpoints.is_empty() {
            return "no endpoints are known".to_string();
        }
        let parts: Vec<String> = self.endpoints.iter().map(|ep| ep.describe()).collect();
        format!("endpoints: {}", parts.join("; "))
    }
}

/// Builds bridges that share one writer pool, connector and event stream.
pub struct BridgeFactory {
    pub settings: Arc<BridgeSettings>,
    pub connector: Arc<dyn Connector>,
    pub writers: Arc<WriterPool>,
    pub events: mpsc::UnboundedSender<BridgeEvent>,
    pub pushes: broadcast::Sender<PushMessage>,
}

impl BridgeFactory {
    fn build(&self, address: &Arc<str>, purpose: ConnectionPurpose) -> Arc<ConnectionBridge> {
        ConnectionBridge::new(
            address.clone(),
            purpose,
            self.settings.clone(),
            self.connector.clone(),
            self.writers.clone(),
            self.events.clone(),
            self.pushes.clone(),
        )
    }
}

/// Every endpoint the multiplexer knows, behind a copy-on-write snapshot.
pub struct EndpointRegistry {
    factory: BridgeFactory,
    snapshot: ArcSwap<RoutingSnapshot>,
    create: Mutex<()>,
}

impl EndpointRegistry {
    pub fn new(factory: BridgeFactory) -> Self {
        Self {
            factory,
            snapshot: ArcSwap::from_pointee(RoutingSnapshot::default()),
            create: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.load_full()
    }

    pub fn get(&self, address: &str) -> Option<Arc<ServerEndpoint>> {
        self.snapshot.load().endpoint(address).cloned()
    }

    /// Look up `address`, creating the endpoint (and starting both bridges)
    /// on first sight.
    pub fn get_or_add(&self, address: &str) -> Arc<ServerEndpoint> {
        if let Some(endpoint) = self.get(address) {
            return endpoint;
        }
        let _guard = self.create.lock();
        if let Some(endpoint) = self.get(address) {
            return endpoint;
        }
        let address: Arc<str> = Arc::from(address);
        let endpoint = Arc::new(ServerEndpoint::new(
            address.clone(),
            self.factory.build(&address, ConnectionPurpose::Interactive),
            self.factory.build(&address, ConnectionPurpose::Subscription),
        ));
        self.snapshot
            .rcu(|current| current.with_endpoint(endpoint.clone()));
        info!(endpoint = %address, "endpoint added");
        endpoint.interactive().start_connect(true);
        endpoint.subscription().start_connect(true);
        endpoint
    }

    /// Replace the routing fields of the snapshot; the endpoint list is
    /// carried over.
    pub fn publish(
        &self,
        mode: ServerType,
        slots: Option<Arc<SlotTable>>,
        master: Option<Arc<str>>,
    ) -> Arc<RoutingSnapshot> {
        self.snapshot.rcu(|current| {
            let mut next = RoutingSnapshot::clone(current);
            next.mode = Some(mode);
            next.slots = slots.clone();
            next.master = master.clone();
            next
        });
        self.snapshot()
    }

    /// Patch one slot from a `MOVED` reply, adding the endpoint if needed.
    pub fn note_moved(&self, slot: u16, address: &str) -> Arc<ServerEndpoint> {
        let endpoint = self.get_or_add(address);
        self.snapshot.rcu(|current| {
            let mut next = RoutingSnapshot::clone(current);
            let patched = match &current.slots {
                Some(table) => table.with_slot(slot, address),
                None => SlotTable::from_nodes(Vec::new()).with_slot(slot, address),
            };
            next.slots = Some(Arc::new(patched));
            next
        });
        endpoint
    }

    /// Forget every endpoint `keep` rejects and close its bridges. Returns
    /// the removed endpoints.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) -> Vec<Arc<ServerEndpoint>> {
        let _guard = self.create.lock();
        let removed: Vec<Arc<ServerEndpoint>> = self
            .snapshot
            .load()
            .endpoints
            .iter()
            .filter(|ep| !keep(ep.address()))
            .cloned()
            .collect();
        if removed.is_empty() {
            return removed;
        }
        self.snapshot.rcu(|current| current.without(&removed));
        for endpoint in &removed {
            endpoint.close();
            info!(endpoint = %endpoint.address(), "endpoint removed");
        }
        removed
    }

    pub fn heartbeat(&self) {
        for endpoint in self.snapshot.load().endpoints.iter() {
            endpoint.heartbeat();
        }
    }

    pub fn close_all(&self) {
        for endpoint in self.snapshot.load().endpoints.iter() {
            endpoint.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{BoxTransport, BridgeState};
    use async_trait::async_trait;
    use std::io;

    /// Connector whose attempts never complete; bridges stay `Connecting`.
    pub(crate) struct PendingConnector;

    #[async_trait]
    impl Connector for PendingConnector {
        async fn connect(&self, _endpoint: &str) -> io::Result<BoxTransport> {
            futures::future::pending().await
        }
    }

    pub(crate) fn registry() -> EndpointRegistry {
        let (events, _) = mpsc::unbounded_channel();
        let (pushes, _) = broadcast::channel(4);
        EndpointRegistry::new(BridgeFactory {
            settings: Arc::new(BridgeSettings::default()),
            connector: Arc::new(PendingConnector),
            writers: WriterPool::new(1),
            events,
            pushes,
        })
    }

    #[tokio::test]
    async fn get_or_add_is_idempotent() {
        let registry = registry();
        let first = registry.get_or_add("a:1");
        let again = registry.get_or_add("a:1");
        assert!(Arc::ptr_eq(&first, &again));
        registry.get_or_add("b:2");
        assert_eq!(registry.snapshot().endpoints.len(), 2);
        assert_eq!(
            registry.snapshot().endpoint("b:2").map(|ep| ep.address()),
            Some("b:2")
        );
    }

    #[tokio::test]
    async fn flags_toggle_independently() {
        let registry = registry();
        let ep = registry.get_or_add("a:1");
        ep.set_flag(SelectableFlags::UNRESPONSIVE, true);
        ep.set_flag(SelectableFlags::REDUNDANT_MASTER, true);
        ep.set_flag(SelectableFlags::UNRESPONSIVE, false);
        assert_eq!(ep.flags(), SelectableFlags::REDUNDANT_MASTER);
        assert!(!ep.is_selectable(ConnectionPurpose::Interactive));
        assert!(ep.describe().contains("REDUNDANT_MASTER"));
    }

    #[tokio::test]
    async fn moved_patches_a_copy() {
        let registry = registry();
        let before = registry.snapshot();
        registry.note_moved(3999, "c:3");
        let after = registry.snapshot();
        assert!(before.slots.is_none());
        let table = after.slots.as_ref().expect("slot table");
        assert_eq!(table.owner(3999).map(|n| n.endpoint.as_str()), Some("c:3"));
        assert!(after.endpoint("c:3").is_some());
    }

    #[tokio::test]
    async fn retain_drops_and_closes_the_rest() {
        let registry = registry();
        let kept = registry.get_or_add("a:1");
        let gone = registry.get_or_add("b:2");
        registry.get_or_add("c:3");
        let before = registry.snapshot();

        let removed = registry.retain(|address| address != "b:2");
        assert_eq!(removed.len(), 1);
        assert!(Arc::ptr_eq(&removed[0], &gone));
        assert_eq!(gone.interactive().state(), BridgeState::Disposed);
        assert_eq!(gone.subscription().state(), BridgeState::Disposed);
        assert_ne!(kept.interactive().state(), BridgeState::Disposed);

        let after = registry.snapshot();
        assert_eq!(after.endpoints.len(), 2);
        assert!(after.endpoint("b:2").is_none());
        assert_eq!(after.endpoint("c:3").map(|ep| ep.address()), Some("c:3"));
        assert_eq!(before.endpoints.len(), 3);
        assert!(registry.retain(|_| true).is_empty());

        // A removed address comes back as a fresh endpoint.
        let again = registry.get_or_add("b:2");
        assert!(!Arc::ptr_eq(&again, &gone));
        registry.close_all();
    }

    #[tokio::test]
    async fn publish_keeps_endpoints() {
        let registry = registry();
        registry.get_or_add("a:1");
        let snapshot = registry.publish(ServerType::Standalone, None, Some(Arc::from("a:1")));
        assert_eq!(snapshot.endpoints.len(), 1);
        assert_eq!(snapshot.master.as_deref(), Some("a:1"));
        assert!(!snapshot.is_cluster());
        registry.close_all();
    }
}
