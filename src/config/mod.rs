use std::collections::{HashMap, HashSet};
use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::protocol::redis::CommandMap;

/// Environment variable overriding the writer pool size when the
/// configuration omits `writer_workers`.
pub const ENV_WRITER_WORKERS: &str = "REDMUX_WRITER_WORKERS";

/// Key historically used by multiplexing clients to record the elected
/// master; keeping it lets mixed deployments agree on the vote.
pub const DEFAULT_TIE_BREAKER: &str = "__Booksleeve_TieBreak";

fn default_tie_breaker() -> String {
    DEFAULT_TIE_BREAKER.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_sync_timeout_ms() -> u64 {
    5_000
}

fn default_response_timeout_ms() -> u64 {
    5_000
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_abort_on_connect_fail() -> bool {
    true
}

fn default_max_work_per_flush() -> usize {
    128
}

fn default_reconnect_base_ms() -> u64 {
    100
}

fn default_reconnect_max_ms() -> u64 {
    10_000
}

fn default_config_check_secs() -> u64 {
    60
}

/// Credentials sent with `AUTH` during the handshake; a bare string is a
/// legacy password, a table carries an ACL user.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Credentials {
    Password(String),
    User { username: String, password: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MuxConfig {
    /// Seed endpoints as `host:port`.
    pub endpoints: Vec<String>,
    /// Sentinel service to resolve the master through.
    #[serde(default)]
    pub service_name: Option<String>,
    /// Name announced with `CLIENT SETNAME`, resolved by the embedding
    /// application.
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub default_database: Option<u32>,
    /// Empty disables tie-breaking.
    #[serde(default = "default_tie_breaker")]
    pub tie_breaker: String,
    /// Endpoints are proxies (twemproxy-style); role probes are skipped.
    #[serde(default)]
    pub proxy: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_abort_on_connect_fail")]
    pub abort_on_connect_fail: bool,
    #[serde(default)]
    pub allow_admin: bool,
    #[serde(default)]
    pub allow_replica_writes: bool,
    #[serde(default)]
    pub writer_workers: Option<usize>,
    #[serde(default = "default_max_work_per_flush")]
    pub max_work_per_flush: usize,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Periodic topology refresh; zero disables it.
    #[serde(default = "default_config_check_secs")]
    pub config_check_secs: u64,
    #[serde(default)]
    pub disabled_commands: Vec<String>,
    #[serde(default)]
    pub renamed_commands: HashMap<String, String>,
}

impl MuxConfig {
    /// Configuration with defaults for every optional field.
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            service_name: None,
            client_name: None,
            credentials: None,
            default_database: None,
            tie_breaker: default_tie_breaker(),
            proxy: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            keep_alive_secs: default_keep_alive_secs(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            abort_on_connect_fail: default_abort_on_connect_fail(),
            allow_admin: false,
            allow_replica_writes: false,
            writer_workers: None,
            max_work_per_flush: default_max_work_per_flush(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            config_check_secs: default_config_check_secs(),
            disabled_commands: Vec::new(),
            renamed_commands: HashMap::new(),
        }
    }

    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut cfg: MuxConfig = toml::from_str(raw).context("failed to parse config")?;
        cfg.apply_defaults();
        cfg.ensure_valid()?;
        Ok(cfg)
    }

    /// Ensure configuration correctness.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            bail!("configuration must declare at least one endpoint");
        }
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            parse_port(endpoint)
                .with_context(|| format!("endpoint {endpoint} is not a valid address"))?;
            if !seen.insert(endpoint.to_lowercase()) {
                bail!("duplicate endpoint detected: {endpoint}");
            }
        }
        if self.connect_timeout_ms == 0 {
            bail!("connect_timeout_ms must be > 0");
        }
        if self.sync_timeout_ms == 0 {
            bail!("sync_timeout_ms must be > 0");
        }
        if self.response_timeout_ms == 0 {
            bail!("response_timeout_ms must be > 0");
        }
        if self.heartbeat_interval_ms == 0 {
            bail!("heartbeat_interval_ms must be > 0");
        }
        if self.writer_workers == Some(0) {
            bail!("writer_workers must be > 0");
        }
        if self.max_work_per_flush == 0 {
            bail!("max_work_per_flush must be > 0");
        }
        if self.reconnect_base_ms == 0 || self.reconnect_base_ms > self.reconnect_max_ms {
            bail!(
                "reconnect backoff must satisfy 0 < reconnect_base_ms ({}) <= reconnect_max_ms ({})",
                self.reconnect_base_ms,
                self.reconnect_max_ms
            );
        }
        if self.tie_breaker.chars().any(char::is_whitespace) {
            bail!("tie_breaker key must not contain whitespace");
        }
        if let Some(name) = &self.client_name {
            if name.is_empty() || name.chars().any(|c| c.is_whitespace()) {
                bail!("client_name must be a non-empty word");
            }
        }
        if let Some(service) = &self.service_name {
            if service.trim().is_empty() {
                bail!("service_name cannot be empty");
            }
        }
        for name in &self.disabled_commands {
            if name.trim().is_empty() {
                bail!("disabled_commands cannot contain an empty name");
            }
            if self
                .renamed_commands
                .keys()
                .any(|renamed| renamed.eq_ignore_ascii_case(name))
            {
                bail!("command {name} is both disabled and renamed");
            }
        }
        Ok(())
    }

    fn apply_defaults(&mut self) {
        if self.writer_workers.is_none() {
            self.writer_workers = Some(default_writer_workers());
        }
    }

    pub fn writer_workers(&self) -> usize {
        self.writer_workers.unwrap_or_else(default_writer_workers)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn config_check_interval(&self) -> Option<Duration> {
        (self.config_check_secs > 0).then(|| Duration::from_secs(self.config_check_secs))
    }

    pub fn tie_breaker(&self) -> Option<&str> {
        (!self.tie_breaker.is_empty()).then_some(self.tie_breaker.as_str())
    }

    pub fn command_map(&self) -> CommandMap {
        CommandMap::new(
            self.disabled_commands.iter().cloned(),
            self.renamed_commands
                .iter()
                .map(|(from, to)| (from.clone(), to.clone())),
        )
    }
}

fn parse_port(addr: &str) -> Result<u16> {
    if let Ok(socket) = addr.parse::<std::net::SocketAddr>() {
        return Ok(socket.port());
    }

    if let Some((host, port_str)) = addr.rsplit_once(':') {
        if host.trim().is_empty() {
            bail!("missing host in {addr}");
        }
        let port = port_str
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid port component {port_str}"))?;
        return Ok(port);
    }

    bail!("unable to extract port from address {addr}")
}

fn default_writer_workers() -> usize {
    if let Ok(val) = env::var(ENV_WRITER_WORKERS) {
        if let Ok(parsed) = val.parse::<usize>() {
            if parsed > 0 {
                return parsed;
            }
        }
    }
    2
}
