use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use crate::utils::SLOT_COUNT;

const NO_OWNER: u16 = u16::MAX;

/// One line of `CLUSTER NODES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: String,
    pub endpoint: String,
    pub primary_id: Option<String>,
    pub slots: Vec<(u16, u16)>,
    pub myself: bool,
    pub failed: bool,
}

impl ClusterNode {
    pub fn is_replica(&self) -> bool {
        self.primary_id.is_some()
    }
}

/// Parse a `CLUSTER NODES` reply. `origin` fills in the host for entries
/// that report an empty address (a node that does not know its own IP).
pub fn parse_cluster_nodes(text: &str, origin: &str) -> Result<Vec<ClusterNode>> {
    let origin_host = origin.rsplit_once(':').map(|(host, _)| host).unwrap_or(origin);
    let mut nodes = Vec::new();
    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            bail!("malformed CLUSTER NODES line '{line}'");
        }
        let address = fields[1].split('@').next().unwrap_or_default();
        let address = address.split(',').next().unwrap_or_default();
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("node address '{address}' has no port"))?;
        port.parse::<u16>()
            .with_context(|| format!("invalid port in '{address}'"))?;
        if port == "0" {
            // Nodes still in handshake or without an address.
            continue;
        }
        let host = if host.is_empty() { origin_host } else { host };

        let flags: Vec<&str> = fields[2].split(',').collect();
        let primary_id = match fields[3] {
            "-" => None,
            id if flags.contains(&"slave") || flags.contains(&"replica") => Some(id.to_string()),
            _ => None,
        };

        let mut slots = Vec::new();
        for range in &fields[8..] {
            if range.starts_with('[') {
                // Importing/migrating markers.
                continue;
            }
            let (start, end) = match range.split_once('-') {
                Some((start, end)) => (start, end),
                None => (*range, *range),
            };
            let start: u16 = start.parse().with_context(|| format!("slot '{range}'"))?;
            let end: u16 = end.parse().with_context(|| format!("slot '{range}'"))?;
            if start > end || end >= SLOT_COUNT {
                bail!("slot range {start}-{end} out of bounds");
            }
            slots.push((start, end));
        }

        nodes.push(ClusterNode {
            id: fields[0].to_string(),
            endpoint: format!("{host}:{port}"),
            primary_id,
            slots,
            myself: flags.contains(&"myself"),
            failed: flags.iter().any(|flag| *flag == "fail" || *flag == "noaddr"),
        });
    }
    Ok(nodes)
}

/// Slot to node assignments. Cheap to share; updates build a new table.
#[derive(Debug, Clone)]
pub struct SlotTable {
    nodes: Vec<ClusterNode>,
    owners: Arc<[u16]>,
}

impl SlotTable {
    pub fn from_nodes(nodes: Vec<ClusterNode>) -> Self {
        let mut owners = vec![NO_OWNER; SLOT_COUNT as usize];
        for (idx, node) in nodes.iter().enumerate() {
            if node.is_replica() {
                continue;
            }
            for &(start, end) in &node.slots {
                for slot in start..=end {
                    owners[slot as usize] = idx as u16;
                }
            }
        }
        Self {
            nodes,
            owners: owners.into(),
        }
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    pub fn owner(&self, slot: u16) -> Option<&ClusterNode> {
        match self.owners.get(slot as usize) {
            Some(&idx) if idx != NO_OWNER => self.nodes.get(idx as usize),
            _ => None,
        }
    }

    pub fn replicas_of<'a>(&'a self, primary: &'a ClusterNode) -> impl Iterator<Item = &'a ClusterNode> {
        self.nodes
            .iter()
            .filter(move |node| node.primary_id.as_deref() == Some(primary.id.as_str()))
    }

    pub fn covered_slots(&self) -> usize {
        self.owners.iter().filter(|&&idx| idx != NO_OWNER).count()
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut out: Vec<String> = self.nodes.iter().map(|node| node.endpoint.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Copy of this table with `slot` reassigned to `endpoint`, as learned
    /// from a `MOVED` reply.
    pub fn with_slot(&self, slot: u16, endpoint: &str) -> SlotTable {
        let mut nodes = self.nodes.clone();
        let idx = match nodes
            .iter()
            .position(|node| node.endpoint == endpoint && !node.is_replica())
        {
            Some(idx) => idx,
            None => {
                nodes.push(ClusterNode {
                    id: format!("moved:{endpoint}"),
                    endpoint: endpoint.to_string(),
                    primary_id: None,
                    slots: Vec::new(),
                    myself: false,
                    failed: false,
                });
                nodes.len() - 1
            }
        };
        let mut owners = self.owners.to_vec();
        if let Some(owner) = owners.get_mut(slot as usize) {
            *owner = idx as u16;
        }
        SlotTable {
            nodes,
            owners: owners.into(),
        }
    }
}
