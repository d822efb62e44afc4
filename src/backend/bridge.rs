use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::connector::Connector;
use crate::backend::physical::{
    ConnectionCounters, ConnectionObserver, ConnectionOptions, ConnectionPurpose,
    PhysicalConnection, Staleness,
};
use crate::backend::sink::ResultSink;
use crate::backend::writer::WriterPool;
use crate::config::{Credentials, MuxConfig};
use crate::error::{ConnectionContext, MuxError, MuxResult};
use crate::metrics;
use crate::protocol::redis::{Command, Message, PushMessage, RespValue};
use crate::utils::monotonic_millis;

/// Lifecycle of a bridge. Only moves forward through
/// `Connecting -> ConnectedEstablishing -> Established`; any failure drops
/// back to `Disconnected`. `Disposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    Disconnected = 0,
    Connecting = 1,
    ConnectedEstablishing = 2,
    Established = 3,
    Disposed = 4,
}

impl BridgeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BridgeState::Connecting,
            2 => BridgeState::ConnectedEstablishing,
            3 => BridgeState::Established,
            4 => BridgeState::Disposed,
            _ => BridgeState::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BridgeState::Disconnected => "disconnected",
            BridgeState::Connecting => "connecting",
            BridgeState::ConnectedEstablishing => "establishing",
            BridgeState::Established => "established",
            BridgeState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection changes the multiplexer reacts to.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Established {
        endpoint: Arc<str>,
        purpose: ConnectionPurpose,
    },
    Failed {
        endpoint: Arc<str>,
        purpose: ConnectionPurpose,
        was_established: bool,
        error: MuxError,
    },
}

/// Per-bridge knobs, resolved once from [`MuxConfig`].
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub keep_alive: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub credentials: Option<Credentials>,
    pub client_name: Option<String>,
    pub connection: ConnectionOptions,
}

impl BridgeSettings {
    pub fn from_config(config: &MuxConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
            keep_alive: config.keep_alive(),
            reconnect_base: Duration::from_millis(config.reconnect_base_ms),
            reconnect_max: Duration::from_millis(config.reconnect_max_ms),
            credentials: config.credentials.clone(),
            client_name: config.client_name.clone(),
            connection: ConnectionOptions {
                max_work: config.max_work_per_flush.max(1),
                command_map: Arc::new(config.command_map()),
            },
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(60),
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(10),
            credentials: None,
            client_name: None,
            connection: ConnectionOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCounters {
    pub endpoint: String,
    pub purpose: ConnectionPurpose,
    pub state: BridgeState,
    pub consecutive_failures: u32,
    pub connects: u64,
    pub connection: Option<ConnectionCounters>,
}

/// Owns the current physical connection to one endpoint for one purpose
/// and replaces it when it dies.
pub struct ConnectionBridge {
    endpoint: Arc<str>,
    purpose: ConnectionPurpose,
    settings: Arc<BridgeSettings>,
    connector: Arc<dyn Connector>,
    writers: Arc<WriterPool>,
    state: AtomicU8,
    state_since_ms: AtomicU64,
    state_changed: Notify,
    physical: ArcSwapOption<PhysicalConnection>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
    consecutive_failures: AtomicU32,
    next_attempt_ms: AtomicU64,
    connects: AtomicU64,
    events: mpsc::UnboundedSender<BridgeEvent>,
    pushes: broadcast::Sender<PushMessage>,
    me: Weak<ConnectionBridge>,
}

impl fmt::Debug for ConnectionBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBridge")
            .field("endpoint", &self.endpoint)
            .field("purpose", &self.purpose)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionBridge {
    pub fn new(
        endpoint: Arc<str>,
        purpose: ConnectionPurpose,
        settings: Arc<BridgeSettings>,
        connector: Arc<dyn Connector>,
        writers: Arc<WriterPool>,
        events: mpsc::UnboundedSender<BridgeEvent>,
        pushes: broadcast::Sender<PushMessage>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            endpoint,
            purpose,
            settings,
            connector,
            writers,
            state: AtomicU8::new(BridgeState::Disconnected as u8),
            state_since_ms: AtomicU64::new(monotonic_millis()),
            state_changed: Notify::new(),
            physical: ArcSwapOption::empty(),
            connect_task: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            next_attempt_ms: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            events,
            pushes,
            me: me.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn purpose(&self) -> ConnectionPurpose {
        self.purpose
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_established(&self) -> bool {
        self.state() == BridgeState::Established
    }

    fn transition(&self, from: BridgeState, to: BridgeState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            self.state_since_ms
                .store(monotonic_millis(), Ordering::Release);
            self.state_changed.notify_waiters();
            debug!(
                endpoint = %self.endpoint,
                purpose = %self.purpose,
                from = %from,
                to = %to,
                "bridge state changed"
            );
        }
        moved
    }

    /// Resolves once the bridge is established (true) or disposed (false).
    pub async fn wait_established(&self) -> bool {
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.state() {
                BridgeState::Established => return true,
                BridgeState::Disposed => return false,
                _ => {}
            }
            notified.await;
        }
    }

    /// Hand `message` to the current connection, or give it back if the
    /// bridge cannot take it right now.
    pub fn try_enqueue(&self, message: Message) -> Result<(), Message> {
        match self.state() {
            BridgeState::Established => {}
            BridgeState::ConnectedEstablishing if message.is_internal() => {}
            BridgeState::Disconnected => {
                self.start_connect(false);
                return Err(message);
            }
            _ => return Err(message),
        }
        let Some(physical) = self.physical.load_full() else {
            return Err(message);
        };
        let was_empty = physical.enqueue(message)?;
        if was_empty {
            self.writers.schedule(&physical);
        }
        Ok(())
    }

    /// Send an internal message and wait for its reply. Error replies come
    /// back as `Ok(RespValue::Error)`.
    pub async fn send_internal(&self, mut message: Message) -> MuxResult<RespValue> {
        message.exec.internal = true;
        let (sink, rx) = ResultSink::channel();
        message.bind_sink(sink);
        if let Err(message) = self.try_enqueue(message) {
            return Err(MuxError::NoConnectionAvailable {
                command: message.to_string(),
                status: format!("{} {} is {}", self.endpoint, self.purpose, self.state()),
            });
        }
        rx.await.unwrap_or(Err(MuxError::Disposed))
    }

    /// Kick off a connection attempt unless one is running or the backoff
    /// window is still open.
    pub fn start_connect(&self, ignore_backoff: bool) {
        if !ignore_backoff
            && monotonic_millis() < self.next_attempt_ms.load(Ordering::Acquire)
        {
            return;
        }
        if !self.transition(BridgeState::Disconnected, BridgeState::Connecting) {
            return;
        }
        let Some(bridge) = self.me.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move { bridge.connect().await });
        if let Some(previous) = self.connect_task.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn connect(self: Arc<Self>) {
        let attempt = timeout(self.settings.connect_timeout, self.open_and_handshake()).await;
        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(MuxError::socket(
                format!(
                    "connect timed out after {}ms",
                    self.settings.connect_timeout.as_millis()
                ),
                ConnectionContext::for_endpoint(self.endpoint.to_string()),
            )),
        };
        match result {
            Ok(physical) => {
                if self.transition(BridgeState::ConnectedEstablishing, BridgeState::Established) {
                    self.consecutive_failures.store(0, Ordering::Release);
                    self.next_attempt_ms.store(0, Ordering::Release);
                    self.connects.fetch_add(1, Ordering::Relaxed);
                    metrics::connect_attempt(&self.endpoint, true);
                    metrics::bridge_connected(&self.endpoint, self.purpose.as_str());
                    info!(
                        endpoint = %self.endpoint,
                        purpose = %self.purpose,
                        connection = physical.id(),
                        "bridge established"
                    );
                    let _ = self.events.send(BridgeEvent::Established {
                        endpoint: self.endpoint.clone(),
                        purpose: self.purpose,
                    });
                    // The reader may have died between the handshake reply
                    // and the transition, while the observer still ignored it.
                    if physical.is_failed() {
                        self.connection_lost(&physical);
                    }
                } else {
                    physical.close();
                }
            }
            Err(err) => self.connect_failed(err),
        }
    }

    async fn open_and_handshake(&self) -> MuxResult<Arc<PhysicalConnection>> {
        let transport = self.connector.connect(&self.endpoint).await.map_err(|err| {
            MuxError::socket(
                format!("connect failed: {err}"),
                ConnectionContext::for_endpoint(self.endpoint.to_string()),
            )
        })?;
        let observer: Weak<dyn ConnectionObserver> = self.me.clone();
        let physical = PhysicalConnection::start(
            self.endpoint.clone(),
            self.purpose,
            transport,
            self.settings.connection.clone(),
            observer,
            self.pushes.clone(),
        );
        self.physical.store(Some(physical.clone()));
        if !self.transition(BridgeState::Connecting, BridgeState::ConnectedEstablishing) {
            return Err(MuxError::Disposed);
        }
        self.handshake(&physical).await?;
        Ok(physical)
    }

    async fn handshake(&self, physical: &Arc<PhysicalConnection>) -> MuxResult<()> {
        if let Some(credentials) = &self.settings.credentials {
            let auth = match credentials {
                Credentials::Password(password) => {
                    Message::internal(Command::Auth).value(password.clone())
                }
                Credentials::User { username, password } => Message::internal(Command::Auth)
                    .value(username.clone())
                    .value(password.clone()),
            };
            if let RespValue::Error(reason) = self.send_on(physical, auth.build()).await? {
                return Err(MuxError::AuthenticationFailure {
                    endpoint: self.endpoint.to_string(),
                    message: String::from_utf8_lossy(&reason).into_owned(),
                });
            }
        }

        if let Some(name) = &self.settings.client_name {
            let setname = Message::internal(Command::Client)
                .value("SETNAME")
                .value(name.clone())
                .build();
            if let RespValue::Error(reason) = self.send_on(physical, setname).await? {
                warn!(
                    endpoint = %self.endpoint,
                    reason = %String::from_utf8_lossy(&reason),
                    "server refused CLIENT SETNAME"
                );
            }
        }

        match self.purpose {
            ConnectionPurpose::Interactive => {
                let tracer = format!("redmux-{}", physical.id());
                let echo = Message::internal(Command::Echo)
                    .value(tracer.clone())
                    .build();
                let reply = self.send_on(physical, echo).await?;
                if reply.as_bytes() != Some(tracer.as_bytes()) || reply.is_error() {
                    return Err(MuxError::protocol(format!(
                        "handshake tracer mismatch on {}: {reply:?}",
                        self.endpoint
                    )));
                }
            }
            ConnectionPurpose::Subscription => {
                let reply = self
                    .send_on(physical, Message::internal(Command::Ping).build())
                    .await?;
                if let RespValue::Error(reason) = reply {
                    return Err(MuxError::protocol(format!(
                        "handshake PING rejected on {}: {}",
                        self.endpoint,
                        String::from_utf8_lossy(&reason)
                    )));
                }
            }
        }
        Ok(())
    }

    async fn send_on(
        &self,
        physical: &Arc<PhysicalConnection>,
        mut message: Message,
    ) -> MuxResult<RespValue> {
        let (sink, rx) = ResultSink::channel();
        message.bind_sink(sink);
        match physical.enqueue(message) {
            Ok(true) => self.writers.schedule(physical),
            Ok(false) => {}
            Err(_) => {
                return Err(MuxError::socket(
                    "connection failed during handshake",
                    ConnectionContext::for_endpoint(self.endpoint.to_string()),
                ))
            }
        }
        rx.await.unwrap_or(Err(MuxError::Disposed))
    }

    fn connect_failed(&self, error: MuxError) {
        if let Some(physical) = self.physical.swap(None) {
            physical.fail(error.clone());
        }
        let state = self.state();
        if state == BridgeState::Disposed
            || !self.transition(state, BridgeState::Disconnected)
        {
            return;
        }
        metrics::connect_attempt(&self.endpoint, false);
        let delay = self.note_failure();
        warn!(
            endpoint = %self.endpoint,
            purpose = %self.purpose,
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "connection attempt failed"
        );
        let _ = self.events.send(BridgeEvent::Failed {
            endpoint: self.endpoint.clone(),
            purpose: self.purpose,
            was_established: false,
            error,
        });
    }

    /// Count a failure and open the backoff window: exponential in the
    /// number of consecutive failures, capped, with up to 25% jitter.
    fn note_failure(&self) -> Duration {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let delay = backoff_delay(
            self.settings.reconnect_base,
            self.settings.reconnect_max,
            failures,
        );
        let jitter_ms = (delay.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        let delay = delay + Duration::from_millis(jitter);
        self.next_attempt_ms.store(
            monotonic_millis() + delay.as_millis() as u64,
            Ordering::Release,
        );
        delay
    }

    /// Periodic upkeep: connect timeouts, stale detection, keepalive and
    /// reconnects.
    pub fn heartbeat(&self) {
        match self.state() {
            state @ (BridgeState::Connecting | BridgeState::ConnectedEstablishing) => {
                let since = self.state_since_ms.load(Ordering::Acquire);
                let connect_ms = self.settings.connect_timeout.as_millis() as u64;
                if monotonic_millis().saturating_sub(since) > connect_ms {
                    self.abort_connect(state);
                }
            }
            BridgeState::Established => {
                let Some(physical) = self.physical.load_full() else {
                    self.lost(MuxError::socket(
                        "established without a connection",
                        ConnectionContext::for_endpoint(self.endpoint.to_string()),
                    ));
                    return;
                };
                if physical.is_failed() {
                    self.connection_lost(&physical);
                    return;
                }
                let timeout_ms = self.settings.response_timeout.as_millis() as u64;
                match physical.check_staleness(timeout_ms) {
                    Staleness::Fresh => {}
                    Staleness::Flagged => warn!(
                        endpoint = %self.endpoint,
                        purpose = %self.purpose,
                        timeout_ms,
                        "no response from server; connection marked stale"
                    ),
                    Staleness::Expired => {
                        physical.fail(MuxError::socket(
                            format!("response timeout after {timeout_ms}ms"),
                            ConnectionContext::default(),
                        ));
                        return;
                    }
                }
                let keep_alive = self.settings.keep_alive.as_millis() as u64;
                if keep_alive > 0 && physical.idle_ms() >= keep_alive {
                    self.send_keepalive(&physical);
                }
            }
            BridgeState::Disconnected => self.start_connect(false),
            BridgeState::Disposed => {}
        }
    }

    fn abort_connect(&self, observed: BridgeState) {
        if !self.transition(observed, BridgeState::Disconnected) {
            return;
        }
        if let Some(task) = self.connect_task.lock().take() {
            task.abort();
        }
        let error = MuxError::socket(
            format!(
                "connect timed out after {}ms",
                self.settings.connect_timeout.as_millis()
            ),
            ConnectionContext::for_endpoint(self.endpoint.to_string()),
        );
        if let Some(physical) = self.physical.swap(None) {
            physical.fail(error.clone());
        }
        metrics::connect_attempt(&self.endpoint, false);
        self.note_failure();
        warn!(
            endpoint = %self.endpoint,
            purpose = %self.purpose,
            "connection attempt stalled; retrying"
        );
        let _ = self.events.send(BridgeEvent::Failed {
            endpoint: self.endpoint.clone(),
            purpose: self.purpose,
            was_established: false,
            error,
        });
        self.start_connect(true);
    }

    fn send_keepalive(&self, physical: &Arc<PhysicalConnection>) {
        let ping = Message::internal(Command::Ping).build();
        match physical.enqueue(ping) {
            Ok(true) => self.writers.schedule(physical),
            Ok(false) => {}
            Err(_) => return,
        }
        debug!(endpoint = %self.endpoint, purpose = %self.purpose, "keepalive ping");
    }

    /// Tear down for good; everything outstanding fails with `Disposed`.
    pub fn close(&self) {
        let previous = BridgeState::from_u8(
            self.state
                .swap(BridgeState::Disposed as u8, Ordering::AcqRel),
        );
        if previous == BridgeState::Disposed {
            return;
        }
        self.state_changed.notify_waiters();
        if let Some(task) = self.connect_task.lock().take() {
            task.abort();
        }
        if let Some(physical) = self.physical.swap(None) {
            physical.close();
        }
        if previous == BridgeState::Established {
            metrics::bridge_disconnected(&self.endpoint, self.purpose.as_str());
        }
    }

    pub fn counters(&self) -> BridgeCounters {
        BridgeCounters {
            endpoint: self.endpoint.to_string(),
            purpose: self.purpose,
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            connects: self.connects.load(Ordering::Relaxed),
            connection: self.physical.load_full().map(|p| p.counters()),
        }
    }

    fn connection_lost(&self, physical: &PhysicalConnection) {
        let error = physical.failure().unwrap_or_else(|| {
            MuxError::socket(
                "connection failed",
                ConnectionContext::for_endpoint(self.endpoint.to_string()),
            )
        });
        self.lost(error);
    }

    /// Established -> Disconnected, once per connection.
    fn lost(&self, error: MuxError) {
        if !self.transition(BridgeState::Established, BridgeState::Disconnected) {
            return;
        }
        self.physical.store(None);
        metrics::bridge_disconnected(&self.endpoint, self.purpose.as_str());
        let delay = self.note_failure();
        warn!(
            endpoint = %self.endpoint,
            purpose = %self.purpose,
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "established connection lost"
        );
        let _ = self.events.send(BridgeEvent::Failed {
            endpoint: self.endpoint.clone(),
            purpose: self.purpose,
            was_established: true,
            error,
        });
    }
}

impl ConnectionObserver for ConnectionBridge {
    fn on_connection_failed(&self, connection_id: u64, error: &MuxError) {
        if self.physical.load_full().map(|p| p.id()) != Some(connection_id) {
            return;
        }
        // Failures during the handshake surface through the connect task.
        self.lost(error.clone());
    }
}

impl Drop for ConnectionBridge {
    fn drop(&mut self) {
        if let Some(task) = self.connect_task.get_mut().take() {
            task.abort();
        }
    }
}

fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::connector::BoxTransport;
    use crate::error::FailureKind;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use std::io;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Decoder;

    use crate::protocol::redis::RespCodec;

    /// Hands out in-memory transports and parks the server halves.
    #[derive(Default)]
    struct DuplexConnector {
        servers: Mutex<Vec<DuplexStream>>,
        refuse: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self, _endpoint: &str) -> io::Result<BoxTransport> {
            if self.refuse.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (client, server) = duplex(64 * 1024);
            self.servers.lock().push(server);
            Ok(Box::new(client))
        }
    }

    impl DuplexConnector {
        async fn take_server(&self) -> DuplexStream {
            loop {
                if let Some(server) = self.servers.lock().pop() {
                    return server;
                }
                tokio::task::yield_now().await;
            }
        }
    }

    fn reply_to(frame: &RespValue, password: Option<&'static str>) -> (Vec<u8>, bool) {
        let parts = frame.as_array().unwrap_or(&[]).to_vec();
        let verb = parts
            .first()
            .and_then(|v| v.as_bytes())
            .map(|v| v.to_ascii_uppercase())
            .unwrap_or_default();
        let reply = match verb.as_slice() {
            b"ECHO" => {
                let arg = parts[1].as_bytes().unwrap_or_default();
                let mut out = format!("${}\r\n", arg.len()).into_bytes();
                out.extend_from_slice(arg);
                out.extend_from_slice(b"\r\n");
                out
            }
            b"AUTH" => {
                let given = parts.last().and_then(|v| v.as_bytes()).unwrap_or_default();
                if Some(given) == password.map(str::as_bytes) {
                    b"+OK\r\n".to_vec()
                } else {
                    b"-WRONGPASS invalid password\r\n".to_vec()
                }
            }
            b"PING" => b"+PONG\r\n".to_vec(),
            _ => b"+OK\r\n".to_vec(),
        };
        (reply, verb == b"ECHO")
    }

    /// Minimal responder: echoes ECHO, answers AUTH per `password`, +OK
    /// otherwise. With `hang_up`, closes right after the handshake tracer.
    async fn respond(mut server: DuplexStream, password: Option<&'static str>, hang_up: bool) {
        let mut buf = BytesMut::new();
        let mut codec = RespCodec::new();
        loop {
            match server.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            while let Ok(Some(frame)) = codec.decode(&mut buf) {
                let (reply, tracer) = reply_to(&frame, password);
                if server.write_all(&reply).await.is_err() {
                    return;
                }
                if hang_up && tracer {
                    return;
                }
            }
        }
    }

    async fn serve(server: DuplexStream, password: Option<&'static str>) {
        respond(server, password, false).await
    }

    struct Quiet;

    impl ConnectionObserver for Quiet {
        fn on_connection_failed(&self, _connection_id: u64, _error: &MuxError) {}
    }

    struct Fixture {
        bridge: Arc<ConnectionBridge>,
        connector: Arc<DuplexConnector>,
        events: mpsc::UnboundedReceiver<BridgeEvent>,
    }

    fn fixture(settings: BridgeSettings) -> Fixture {
        let connector = Arc::new(DuplexConnector::default());
        let (events_tx, events) = mpsc::unbounded_channel();
        let (pushes, _) = broadcast::channel(8);
        let bridge = ConnectionBridge::new(
            Arc::from("fake:6379"),
            ConnectionPurpose::Interactive,
            Arc::new(settings),
            connector.clone(),
            WriterPool::new(1),
            events_tx,
            pushes,
        );
        Fixture {
            bridge,
            connector,
            events,
        }
    }

    #[tokio::test]
    async fn connects_after_handshake_and_serves_commands() {
        let mut fx = fixture(BridgeSettings {
            credentials: Some(Credentials::Password("secret".into())),
            client_name: Some("app".into()),
            ..BridgeSettings::default()
        });
        fx.bridge.start_connect(false);
        tokio::spawn(serve(fx.connector.take_server().await, Some("secret")));

        assert!(
            tokio::time::timeout(Duration::from_secs(5), fx.bridge.wait_established())
                .await
                .unwrap()
        );
        assert!(matches!(
            fx.events.recv().await,
            Some(BridgeEvent::Established { .. })
        ));
        let reply = fx
            .bridge
            .send_internal(Message::builder(Command::Set).key("k").value("v").build())
            .await
            .unwrap();
        assert_eq!(reply, RespValue::simple("OK"));
        assert_eq!(fx.bridge.counters().connects, 1);
    }

    #[tokio::test]
    async fn rejected_auth_fails_the_attempt() {
        let mut fx = fixture(BridgeSettings {
            credentials: Some(Credentials::Password("wrong".into())),
            ..BridgeSettings::default()
        });
        fx.bridge.start_connect(false);
        tokio::spawn(serve(fx.connector.take_server().await, Some("secret")));

        match fx.events.recv().await {
            Some(BridgeEvent::Failed {
                error,
                was_established,
                ..
            }) => {
                assert!(!was_established);
                assert_eq!(error.kind(), FailureKind::AuthenticationFailure);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(fx.bridge.state(), BridgeState::Disconnected);
        assert_eq!(fx.bridge.counters().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn caller_messages_wait_for_establishment() {
        let fx = fixture(BridgeSettings::default());
        let msg = Message::builder(Command::Get).key("k").build();
        let rejected = fx.bridge.try_enqueue(msg).unwrap_err();
        assert_eq!(rejected.to_string(), "GET k");
        assert_eq!(fx.bridge.state(), BridgeState::Connecting);
    }

    #[tokio::test]
    async fn dropped_connection_reports_and_reconnects() {
        let mut fx = fixture(BridgeSettings {
            reconnect_base: Duration::from_millis(1),
            reconnect_max: Duration::from_millis(1),
            ..BridgeSettings::default()
        });
        fx.bridge.start_connect(false);
        let first = tokio::spawn(serve(fx.connector.take_server().await, None));
        fx.bridge.wait_established().await;
        fx.events.recv().await;

        first.abort();
        match fx.events.recv().await {
            Some(BridgeEvent::Failed {
                was_established, ..
            }) => assert!(was_established),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(fx.bridge.state(), BridgeState::Disconnected);

        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.bridge.heartbeat();
        tokio::spawn(serve(fx.connector.take_server().await, None));
        assert!(
            tokio::time::timeout(Duration::from_secs(5), fx.bridge.wait_established())
                .await
                .unwrap()
        );
        assert_eq!(fx.bridge.counters().connects, 2);
    }

    #[tokio::test]
    async fn hang_up_right_after_the_handshake_is_noticed() {
        let mut fx = fixture(BridgeSettings {
            reconnect_base: Duration::from_secs(60),
            reconnect_max: Duration::from_secs(60),
            ..BridgeSettings::default()
        });
        fx.bridge.start_connect(false);
        tokio::spawn(respond(fx.connector.take_server().await, None, true));

        let lost = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match fx.events.recv().await {
                    Some(BridgeEvent::Failed {
                        was_established, ..
                    }) => return was_established,
                    Some(BridgeEvent::Established { .. }) => continue,
                    None => panic!("bridge dropped its events"),
                }
            }
        })
        .await
        .expect("the dead connection is reported");
        assert!(lost);
        assert_eq!(fx.bridge.state(), BridgeState::Disconnected);
        assert!(fx.bridge.counters().connection.is_none());
        fx.bridge.heartbeat();
        assert_eq!(fx.bridge.state(), BridgeState::Disconnected);
    }

    #[tokio::test]
    async fn heartbeat_recovers_from_an_unreported_failure() {
        let mut fx = fixture(BridgeSettings {
            reconnect_base: Duration::from_secs(60),
            reconnect_max: Duration::from_secs(60),
            ..BridgeSettings::default()
        });
        fx.bridge.start_connect(false);
        tokio::spawn(serve(fx.connector.take_server().await, None));
        fx.bridge.wait_established().await;
        fx.events.recv().await;

        // A connection whose failure never reached this bridge.
        let quiet = Arc::new(Quiet);
        let observer: Weak<dyn ConnectionObserver> = Arc::downgrade(&quiet) as Weak<dyn ConnectionObserver>;
        let (client, _server) = duplex(1024);
        let (pushes, _) = broadcast::channel(1);
        let dead = PhysicalConnection::start(
            Arc::from("fake:6379"),
            ConnectionPurpose::Interactive,
            Box::new(client),
            ConnectionOptions::default(),
            observer,
            pushes,
        );
        dead.fail(MuxError::socket("reset by peer", ConnectionContext::default()));
        fx.bridge.physical.store(Some(dead));
        assert_eq!(fx.bridge.state(), BridgeState::Established);

        fx.bridge.heartbeat();
        assert_eq!(fx.bridge.state(), BridgeState::Disconnected);
        match fx.events.recv().await {
            Some(BridgeEvent::Failed {
                was_established,
                error,
                ..
            }) => {
                assert!(was_established);
                assert!(error.to_string().contains("reset by peer"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(fx.bridge.counters().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn refused_connection_backs_off() {
        let mut fx = fixture(BridgeSettings {
            reconnect_base: Duration::from_secs(60),
            reconnect_max: Duration::from_secs(60),
            ..BridgeSettings::default()
        });
        fx.connector.refuse.store(true, Ordering::Release);
        fx.bridge.start_connect(false);
        assert!(matches!(
            fx.events.recv().await,
            Some(BridgeEvent::Failed { .. })
        ));
        fx.bridge.heartbeat();
        assert_eq!(fx.bridge.state(), BridgeState::Disconnected);
        fx.bridge.start_connect(true);
        assert_ne!(fx.bridge.state(), BridgeState::Disconnected);
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let fx = fixture(BridgeSettings::default());
        fx.bridge.close();
        assert_eq!(fx.bridge.state(), BridgeState::Disposed);
        assert!(!fx.bridge.wait_established().await);
        let err = fx
            .bridge
            .send_internal(Message::builder(Command::Ping).build())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::NoConnectionAvailable);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, max, 10), max);
    }
}
