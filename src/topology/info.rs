use std::fmt;

use hashbrown::HashMap;

/// Role a server reports for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerRole {
    Master = 0,
    Replica = 1,
}

impl ServerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerRole::Master => "master",
            ServerRole::Replica => "replica",
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment mode a server reports, or `Proxy` when configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerType {
    Standalone = 0,
    Cluster = 1,
    Sentinel = 2,
    Proxy = 3,
}

impl ServerType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerType::Standalone => "standalone",
            ServerType::Cluster => "cluster",
            ServerType::Sentinel => "sentinel",
            ServerType::Proxy => "proxy",
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `INFO` output split into `field -> value`; section headers and blank
/// lines are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoFields {
    fields: HashMap<String, String>,
}

impl InfoFields {
    pub fn parse(text: &str) -> Self {
        let fields = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Merge fields from another section; later values win.
    pub fn extend(&mut self, other: InfoFields) {
        self.fields.extend(other.fields);
    }

    pub fn version(&self) -> Option<&str> {
        self.get("redis_version")
    }

    pub fn server_type(&self) -> Option<ServerType> {
        match self.get("redis_mode")? {
            mode if mode.eq_ignore_ascii_case("cluster") => Some(ServerType::Cluster),
            mode if mode.eq_ignore_ascii_case("sentinel") => Some(ServerType::Sentinel),
            mode if mode.eq_ignore_ascii_case("standalone") => Some(ServerType::Standalone),
            _ => None,
        }
    }

    pub fn role(&self) -> Option<ServerRole> {
        match self.get("role")? {
            "master" => Some(ServerRole::Master),
            "slave" | "replica" => Some(ServerRole::Replica),
            _ => None,
        }
    }

    /// `host:port` of the master a replica follows.
    pub fn master_endpoint(&self) -> Option<String> {
        let host = self.get("master_host")?;
        let port = self.get("master_port")?.parse::<u16>().ok()?;
        Some(format!("{host}:{port}"))
    }

    /// Replicas a master reports under `slaveN:ip=..,port=..`.
    pub fn replica_endpoints(&self) -> Vec<String> {
        let mut found: Vec<(usize, String)> = self
            .fields
            .iter()
            .filter_map(|(key, value)| {
                let index = key.strip_prefix("slave")?.parse::<usize>().ok()?;
                let mut ip = None;
                let mut port = None;
                for part in value.split(',') {
                    match part.split_once('=') {
                        Some(("ip", v)) => ip = Some(v),
                        Some(("port", v)) => port = v.parse::<u16>().ok(),
                        _ => {}
                    }
                }
                Some((index, format!("{}:{}", ip?, port?)))
            })
            .collect();
        found.sort();
        found.into_iter().map(|(_, endpoint)| endpoint).collect()
    }

    /// Highest `dbN` in the keyspace section plus one, if any.
    pub fn keyspace_databases(&self) -> Option<u32> {
        self.fields
            .keys()
            .filter_map(|key| key.strip_prefix("db")?.parse::<u32>().ok())
            .max()
            .map(|db| db + 1)
    }
}
