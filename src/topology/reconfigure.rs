use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::MuxConfig;
use crate::error::{MuxError, MuxResult};
use crate::metrics;
use crate::protocol::redis::{parse_cluster_nodes, ClusterNode, Command, Message, RespValue, SlotTable};

use super::endpoint::{EndpointRegistry, SelectableFlags, ServerEndpoint};
use super::info::{InfoFields, ServerRole, ServerType};

/// Extra probe rounds for endpoints discovered during a run.
pub const MAX_DISCOVERY_ROUNDS: usize = 2;

#[derive(Debug, Clone)]
pub struct ReconfigureSettings {
    pub seeds: Vec<String>,
    pub service_name: Option<String>,
    pub tie_breaker: Option<String>,
    pub proxy: bool,
    pub probe_timeout: Duration,
    pub abort_on_connect_fail: bool,
}

impl ReconfigureSettings {
    pub fn from_config(config: &MuxConfig) -> Self {
        Self {
            seeds: config.endpoints.clone(),
            service_name: config.service_name.clone(),
            tie_breaker: config.tie_breaker().map(str::to_string),
            proxy: config.proxy,
            probe_timeout: config.connect_timeout(),
            abort_on_connect_fail: config.abort_on_connect_fail,
        }
    }
}

/// What one endpoint told us during a run.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub address: String,
    pub error: Option<String>,
    pub server_type: Option<ServerType>,
    pub role: Option<ServerRole>,
    pub version: Option<String>,
    /// Value stored under the tie-breaker key: the master this server votes for.
    pub vote: Option<String>,
    pub cluster_nodes: Option<Vec<ClusterNode>>,
    pub sentinel_master: Option<String>,
    pub replicas: Vec<String>,
    pub master: Option<String>,
}

impl ProbeReport {
    fn failed(address: &str, error: impl Into<String>) -> Self {
        Self {
            address: address.to_string(),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }

    /// Addresses this report points at that may not be known yet.
    fn discovered(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(nodes) = &self.cluster_nodes {
            out.extend(
                nodes
                    .iter()
                    .filter(|node| !node.failed)
                    .map(|node| node.endpoint.clone()),
            );
        }
        out.extend(self.replicas.iter().cloned());
        out.extend(self.master.iter().cloned());
        out.extend(self.sentinel_master.iter().cloned());
        out
    }
}

/// Outcome of a master election outside cluster mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Election {
    pub winner: Option<String>,
    /// No majority decided it.
    pub arbitrary: bool,
}

/// Pick one master from `masters` (in probe order) using the tie-breaker
/// `votes`. The most-voted master wins; ties and missing votes fall back
/// to the first candidate seen.
pub fn elect_master(masters: &[String], votes: &[String]) -> Election {
    match masters {
        [] => Election {
            winner: None,
            arbitrary: false,
        },
        [only] => Election {
            winner: Some(only.clone()),
            arbitrary: false,
        },
        _ => {
            let mut tally: HashMap<&str, usize> = HashMap::new();
            for vote in votes {
                if masters.iter().any(|m| m == vote) {
                    *tally.entry(vote.as_str()).or_default() += 1;
                }
            }
            let best = tally.values().copied().max().unwrap_or(0);
            let leaders: Vec<&String> = masters
                .iter()
                .filter(|m| best > 0 && tally.get(m.as_str()).copied() == Some(best))
                .collect();
            match leaders.as_slice() {
                [winner] => Election {
                    winner: Some((*winner).clone()),
                    arbitrary: false,
                },
                [first, ..] => Election {
                    winner: Some((*first).clone()),
                    arbitrary: true,
                },
                [] => Election {
                    winner: Some(masters[0].clone()),
                    arbitrary: true,
                },
            }
        }
    }
}

struct RunClaim<'a>(&'a AtomicBool);

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Discovers the topology and publishes routing snapshots. Runs never
/// overlap.
pub struct ReconfigurationCoordinator {
    registry: Arc<EndpointRegistry>,
    settings: ReconfigureSettings,
    running: AtomicBool,
    last_reason: Mutex<Option<String>>,
    runs: AtomicU64,
}

impl ReconfigurationCoordinator {
    pub fn new(registry: Arc<EndpointRegistry>, settings: ReconfigureSettings) -> Self {
        Self {
            registry,
            settings,
            running: AtomicBool::new(false),
            last_reason: Mutex::new(None),
            runs: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_reason(&self) -> Option<String> {
        self.last_reason.lock().clone()
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Probe every endpoint and publish a new snapshot. Returns `Ok(false)`
    /// when another run already holds the claim.
    pub async fn run(&self, reason: &str) -> MuxResult<bool> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(reason, "reconfiguration already running; coalesced");
            metrics::reconfiguration("coalesced");
            return Ok(false);
        }
        let _claim = RunClaim(&self.running);
        *self.last_reason.lock() = Some(reason.to_string());
        let first_run = self.runs.fetch_add(1, Ordering::AcqRel) == 0;
        info!(reason, "reconfiguring");

        let reports = self.discover().await;
        for report in &reports {
            self.apply_report(report);
        }
        let mode = self.classify(&reports);
        let (slots, master) = match mode {
            ServerType::Cluster => {
                let slots = self.build_slot_table(&reports);
                if let Some(table) = &slots {
                    self.prune(table);
                }
                (slots, None)
            }
            ServerType::Proxy => {
                for endpoint in self.registry.snapshot().endpoints.iter() {
                    endpoint.set_flag(SelectableFlags::REDUNDANT_MASTER, false);
                }
                (None, None)
            }
            _ => (None, self.elect(&reports)),
        };
        let covered = slots.as_ref().map(|table| table.covered_slots());
        let snapshot = self.registry.publish(mode, slots, master.clone());

        let healthy = reports
            .iter()
            .filter(|r| r.is_healthy() && r.server_type != Some(ServerType::Sentinel))
            .count();
        if healthy == 0 && first_run && self.settings.abort_on_connect_fail {
            metrics::reconfiguration("failed");
            return Err(MuxError::NoConnectionAvailable {
                command: "initial connection".to_string(),
                status: snapshot.describe(),
            });
        }
        if healthy == 0 {
            warn!(reason, status = %snapshot.describe(), "no healthy endpoints; continuing degraded");
        }
        metrics::reconfiguration("ok");
        info!(
            reason,
            mode = %mode,
            endpoints = snapshot.endpoints.len(),
            healthy,
            master = master.as_deref().unwrap_or("-"),
            covered_slots = covered.unwrap_or(0),
            "topology published"
        );
        Ok(true)
    }

    async fn discover(&self) -> Vec<ProbeReport> {
        let mut pending: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let known = self.registry.snapshot();
        let candidates = self
            .settings
            .seeds
            .iter()
            .cloned()
            .chain(known.endpoints.iter().map(|ep| ep.address().to_string()));
        for address in candidates {
            if seen.insert(address.clone()) {
                pending.push(address);
            }
        }

        let mut reports = Vec::new();
        for round in 0..=MAX_DISCOVERY_ROUNDS {
            if pending.is_empty() {
                break;
            }
            let endpoints: Vec<Arc<ServerEndpoint>> = pending
                .drain(..)
                .map(|address| self.registry.get_or_add(&address))
                .collect();
            let deadline = Instant::now() + self.settings.probe_timeout;
            let batch = join_all(endpoints.into_iter().map(|ep| self.probe(ep, deadline))).await;
            for report in &batch {
                for address in report.discovered() {
                    if seen.insert(address.clone()) {
                        pending.push(address);
                    }
                }
            }
            reports.extend(batch);
            debug!(round, discovered = pending.len(), "probe round finished");
        }
        for address in pending {
            // Known but unprobed; the next run looks at it.
            self.registry.get_or_add(&address);
        }
        reports
    }

    async fn probe(&self, endpoint: Arc<ServerEndpoint>, deadline: Instant) -> ProbeReport {
        let address = endpoint.address().to_string();
        match timeout_at(deadline, self.probe_endpoint(&endpoint)).await {
            Ok(Ok(report)) => report,
            Ok(Err(err)) => {
                warn!(endpoint = %address, error = %err, "probe failed");
                ProbeReport::failed(&address, err.to_string())
            }
            Err(_) => {
                warn!(endpoint = %address, "probe timed out");
                ProbeReport::failed(&address, "probe timed out")
            }
        }
    }

    async fn probe_endpoint(&self, endpoint: &ServerEndpoint) -> MuxResult<ProbeReport> {
        let bridge = endpoint.interactive();
        if !bridge.wait_established().await {
            return Err(MuxError::Disposed);
        }
        let mut report = ProbeReport {
            address: endpoint.address().to_string(),
            ..ProbeReport::default()
        };
        if self.settings.proxy {
            report.server_type = Some(ServerType::Proxy);
            report.role = Some(ServerRole::Master);
            return Ok(report);
        }

        let server = bridge
            .send_internal(Message::internal(Command::Info).value("server").build())
            .await?;
        let mut info = InfoFields::parse(&reply_text(server, "INFO server")?);
        let server_type = info.server_type().unwrap_or(ServerType::Standalone);
        report.server_type = Some(server_type);
        report.version = info.version().map(str::to_string);

        if server_type == ServerType::Sentinel {
            if let Some(service) = &self.settings.service_name {
                let reply = bridge
                    .send_internal(
                        Message::internal(Command::Sentinel)
                            .value("get-master-addr-by-name")
                            .value(service.clone())
                            .build(),
                    )
                    .await?;
                report.sentinel_master = sentinel_master(&reply);
            }
            return Ok(report);
        }

        let replication = bridge
            .send_internal(Message::internal(Command::Info).value("replication").build())
            .await?;
        info.extend(InfoFields::parse(&reply_text(replication, "INFO replication")?));
        report.role = info.role();
        report.replicas = info.replica_endpoints();
        report.master = info.master_endpoint();

        if server_type == ServerType::Cluster {
            let nodes = bridge
                .send_internal(Message::internal(Command::Cluster).value("NODES").build())
                .await?;
            let text = reply_text(nodes, "CLUSTER NODES")?;
            let parsed = parse_cluster_nodes(&text, endpoint.address())
                .map_err(|err| MuxError::protocol(format!("{err:#}")))?;
            report.cluster_nodes = Some(parsed);
        } else if let Some(key) = &self.settings.tie_breaker {
            let reply = bridge
                .send_internal(Message::internal(Command::Get).key(key.clone()).build())
                .await?;
            if let RespValue::BulkString(vote) = reply {
                report.vote = Some(String::from_utf8_lossy(&vote).into_owned());
            }
        }
        Ok(report)
    }

    fn apply_report(&self, report: &ProbeReport) {
        let Some(endpoint) = self.registry.get(&report.address) else {
            return;
        };
        endpoint.set_flag(SelectableFlags::UNRESPONSIVE, !report.is_healthy());
        if !report.is_healthy() {
            return;
        }
        if let Some(server_type) = report.server_type {
            endpoint.set_server_type(server_type);
        }
        if let Some(role) = report.role {
            endpoint.set_role(role);
        }
        if server_type_is(report, ServerType::Cluster) {
            endpoint.set_databases(1);
        }
        endpoint.set_version(report.version.clone());
    }

    fn classify(&self, reports: &[ProbeReport]) -> ServerType {
        let healthy = || reports.iter().filter(|r| r.is_healthy());
        let mode = if self.settings.proxy {
            ServerType::Proxy
        } else if healthy().any(|r| server_type_is(r, ServerType::Cluster)) {
            ServerType::Cluster
        } else {
            ServerType::Standalone
        };
        for report in healthy() {
            let Some(endpoint) = self.registry.get(&report.address) else {
                continue;
            };
            let wrong = mode == ServerType::Cluster
                && !server_type_is(report, ServerType::Cluster)
                && !server_type_is(report, ServerType::Sentinel);
            if wrong {
                warn!(endpoint = %report.address, "non-cluster server in a cluster topology");
            }
            endpoint.set_flag(SelectableFlags::WRONG_TYPE, wrong);
        }
        mode
    }

    fn build_slot_table(&self, reports: &[ProbeReport]) -> Option<Arc<SlotTable>> {
        let table = reports
            .iter()
            .filter(|r| r.is_healthy())
            .filter_map(|r| r.cluster_nodes.clone())
            .map(SlotTable::from_nodes)
            .max_by_key(|table| table.covered_slots())?;
        for node in table.nodes() {
            let endpoint = self.registry.get_or_add(&node.endpoint);
            endpoint.set_server_type(ServerType::Cluster);
            endpoint.set_role(if node.is_replica() {
                ServerRole::Replica
            } else {
                ServerRole::Master
            });
            endpoint.set_databases(1);
            endpoint.set_flag(SelectableFlags::REDUNDANT_MASTER, false);
        }
        if table.covered_slots() < crate::utils::SLOT_COUNT as usize {
            warn!(
                covered = table.covered_slots(),
                "cluster does not cover every hash slot"
            );
        }
        Some(Arc::new(table))
    }

    /// Forget endpoints the cluster no longer lists. Seeds always stay.
    fn prune(&self, table: &SlotTable) -> usize {
        let listed: HashSet<&str> = table
            .nodes()
            .iter()
            .map(|node| node.endpoint.as_str())
            .chain(self.settings.seeds.iter().map(String::as_str))
            .collect();
        let removed = self.registry.retain(|address| listed.contains(address));
        if !removed.is_empty() {
            info!(removed = removed.len(), "pruned endpoints that left the cluster");
        }
        removed.len()
    }

    fn elect(&self, reports: &[ProbeReport]) -> Option<Arc<str>> {
        let data: Vec<&ProbeReport> = reports
            .iter()
            .filter(|r| r.is_healthy() && !server_type_is(r, ServerType::Sentinel))
            .collect();
        let masters: Vec<String> = data
            .iter()
            .filter(|r| r.role == Some(ServerRole::Master))
            .map(|r| r.address.clone())
            .collect();

        let sentinel_choice = reports
            .iter()
            .filter_map(|r| r.sentinel_master.as_ref())
            .find(|addr| masters.contains(addr))
            .cloned();
        let election = match sentinel_choice {
            Some(winner) => Election {
                winner: Some(winner),
                arbitrary: false,
            },
            None => {
                let votes: Vec<String> = data.iter().filter_map(|r| r.vote.clone()).collect();
                elect_master(&masters, &votes)
            }
        };
        if election.arbitrary {
            warn!(
                masters = ?masters,
                chosen = ?election.winner,
                "multiple masters without a deciding vote; choice is arbitrary"
            );
        }

        for master in &masters {
            if let Some(endpoint) = self.registry.get(master) {
                let redundant = election.winner.as_deref() != Some(master.as_str());
                endpoint.set_flag(SelectableFlags::REDUNDANT_MASTER, redundant);
            }
        }
        for report in data.iter().filter(|r| r.role != Some(ServerRole::Master)) {
            if let Some(endpoint) = self.registry.get(&report.address) {
                endpoint.set_flag(SelectableFlags::REDUNDANT_MASTER, false);
            }
        }
        election.winner.map(Arc::from)
    }
}

fn server_type_is(report: &ProbeReport, server_type: ServerType) -> bool {
    report.server_type == Some(server_type)
}

fn reply_text(reply: RespValue, what: &str) -> MuxResult<String> {
    match reply {
        RespValue::BulkString(data) | RespValue::SimpleString(data) => {
            Ok(String::from_utf8_lossy(&data).into_owned())
        }
        RespValue::Error(reason) => Err(MuxError::CommandRejected(format!(
            "{what}: {}",
            String::from_utf8_lossy(&reason)
        ))),
        other => Err(MuxError::protocol(format!(
            "unexpected {what} reply: {other:?}"
        ))),
    }
}

fn sentinel_master(reply: &RespValue) -> Option<String> {
    let items = reply.as_array()?;
    let host = std::str::from_utf8(items.first()?.as_bytes()?).ok()?;
    let port = items.get(1)?.as_integer()?;
    Some(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::endpoint::tests::registry;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn majority_vote_wins() {
        let masters = addrs(&["a:1", "b:2"]);
        let votes = addrs(&["b:2", "b:2", "a:1", "b:2"]);
        assert_eq!(
            elect_master(&masters, &votes),
            Election {
                winner: Some("b:2".into()),
                arbitrary: false,
            }
        );
    }

    #[test]
    fn ties_go_to_the_first_seen_master() {
        let masters = addrs(&["a:1", "b:2"]);
        let votes = addrs(&["b:2", "a:1"]);
        let election = elect_master(&masters, &votes);
        assert_eq!(election.winner.as_deref(), Some("a:1"));
        assert!(election.arbitrary);
    }

    #[test]
    fn votes_for_non_masters_are_ignored() {
        let masters = addrs(&["a:1", "b:2"]);
        let election = elect_master(&masters, &addrs(&["c:3", "c:3"]));
        assert_eq!(election.winner.as_deref(), Some("a:1"));
        assert!(election.arbitrary);
        assert_eq!(elect_master(&[], &[]).winner, None);
        assert!(!elect_master(&addrs(&["a:1"]), &[]).arbitrary);
    }

    #[test]
    fn sentinel_reply_parses() {
        let reply = RespValue::array(vec![RespValue::bulk("10.0.0.9"), RespValue::bulk("6380")]);
        assert_eq!(sentinel_master(&reply).as_deref(), Some("10.0.0.9:6380"));
        assert_eq!(sentinel_master(&RespValue::NullArray), None);
    }

    #[test]
    fn error_replies_become_rejections() {
        let err = reply_text(RespValue::error("ERR unknown command"), "INFO server").unwrap_err();
        assert!(err.to_string().contains("INFO server"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_endpoints_are_marked_and_abort_first_run() {
        let registry = Arc::new(registry());
        let coordinator = ReconfigurationCoordinator::new(
            registry.clone(),
            ReconfigureSettings {
                seeds: addrs(&["a:1"]),
                service_name: None,
                tie_breaker: None,
                proxy: false,
                probe_timeout: Duration::from_millis(50),
                abort_on_connect_fail: true,
            },
        );
        let err = coordinator.run("startup").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::NoConnectionAvailable);
        let ep = registry.get("a:1").expect("seed registered");
        assert!(ep.flags().contains(SelectableFlags::UNRESPONSIVE));
        assert!(!coordinator.is_running());

        // Later runs proceed degraded.
        assert!(coordinator.run("retry").await.unwrap());
        assert_eq!(coordinator.runs(), 2);
        assert_eq!(coordinator.last_reason().as_deref(), Some("retry"));
    }

    #[tokio::test]
    async fn concurrent_runs_coalesce() {
        let registry = Arc::new(registry());
        let coordinator = ReconfigurationCoordinator::new(
            registry,
            ReconfigureSettings {
                seeds: Vec::new(),
                service_name: None,
                tie_breaker: None,
                proxy: false,
                probe_timeout: Duration::from_millis(10),
                abort_on_connect_fail: false,
            },
        );
        coordinator.running.store(true, Ordering::Release);
        assert!(!coordinator.run("second").await.unwrap());
        coordinator.running.store(false, Ordering::Release);
        assert!(coordinator.run("third").await.unwrap());
    }

    #[tokio::test]
    async fn nodes_that_left_the_cluster_are_pruned() {
        let registry = Arc::new(registry());
        let coordinator = ReconfigurationCoordinator::new(
            registry.clone(),
            ReconfigureSettings {
                seeds: addrs(&["10.0.0.1:7000"]),
                service_name: None,
                tie_breaker: None,
                proxy: false,
                probe_timeout: Duration::from_millis(10),
                abort_on_connect_fail: false,
            },
        );
        for address in ["10.0.0.1:7000", "10.0.0.2:7000", "10.0.0.3:7000"] {
            registry.get_or_add(address);
        }
        let departed = registry.get("10.0.0.3:7000").expect("registered");
        let nodes = parse_cluster_nodes(
            "bbbb 10.0.0.2:7000@17000 master - 0 0 2 connected 0-16383\n",
            "10.0.0.1:7000",
        )
        .unwrap();

        assert_eq!(coordinator.prune(&SlotTable::from_nodes(nodes)), 1);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.endpoints.len(), 2);
        assert!(snapshot.endpoint("10.0.0.1:7000").is_some());
        assert!(snapshot.endpoint("10.0.0.2:7000").is_some());
        assert!(snapshot.endpoint("10.0.0.3:7000").is_none());
        assert_eq!(departed.interactive().state(), crate::backend::BridgeState::Disposed);
        registry.close_all();
    }
}
