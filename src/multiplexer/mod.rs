mod redirect;
mod status;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    BridgeEvent, BridgeSettings, ConnectionBridge, ConnectionPurpose, Connector, ResultReceiver,
    ResultSink, TcpConnector, WriterPool,
};
use crate::config::MuxConfig;
use crate::error::{MuxError, MuxResult};
use crate::metrics;
use crate::protocol::redis::{
    CommandFlags, Message, MessagePayload, PushMessage, RespValue, ResultDecoder,
};
use crate::topology::{
    BridgeFactory, EndpointRegistry, ReconfigurationCoordinator, ReconfigureSettings,
    RoutingPolicy, RoutingSnapshot, ServerRole, TopologyRouter,
};

pub use redirect::{Redirect, RedirectKind, MAX_REDIRECTS};
pub use status::EndpointStatus;

const PUSH_CHANNEL_CAPACITY: usize = 1024;

/// A reply on its way; resolves to the decoded value or the failure.
pub struct ResponseFuture<T> {
    inner: BoxFuture<'static, MuxResult<T>>,
}

impl<T> ResponseFuture<T> {
    fn new(inner: BoxFuture<'static, MuxResult<T>>) -> Self {
        Self { inner }
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = MuxResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseFuture")
    }
}

/// A submitted message: where it went and how its reply comes back.
struct InFlight {
    payload: MessagePayload,
    purpose: ConnectionPurpose,
    reply: Option<ResultReceiver>,
}

struct Inner {
    config: MuxConfig,
    registry: Arc<EndpointRegistry>,
    router: TopologyRouter,
    coordinator: ReconfigurationCoordinator,
    writers: Arc<WriterPool>,
    pushes: broadcast::Sender<PushMessage>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    runtime: Handle,
}

/// Shares a handful of connections among any number of callers.
///
/// Cheap to clone; the last clone dropped (or [`Multiplexer::close`])
/// tears every connection down.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("endpoints", &self.inner.config.endpoints)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Multiplexer {
    /// Connect over plain TCP.
    pub async fn connect(config: MuxConfig) -> MuxResult<Multiplexer> {
        let connector = Arc::new(TcpConnector::new(Some(config.keep_alive())));
        Self::connect_with(config, connector).await
    }

    /// Connect through a caller-supplied transport factory.
    pub async fn connect_with(
        config: MuxConfig,
        connector: Arc<dyn Connector>,
    ) -> MuxResult<Multiplexer> {
        config
            .ensure_valid()
            .map_err(|err| MuxError::Configuration(format!("{err:#}")))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (pushes, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        let writers = WriterPool::new(config.writer_workers());
        let registry = Arc::new(EndpointRegistry::new(BridgeFactory {
            settings: Arc::new(BridgeSettings::from_config(&config)),
            connector,
            writers: writers.clone(),
            events: events_tx,
            pushes: pushes.clone(),
        }));
        for endpoint in &config.endpoints {
            registry.get_or_add(endpoint);
        }
        let router = TopologyRouter::new(
            registry.clone(),
            RoutingPolicy {
                allow_admin: config.allow_admin,
                allow_replica_writes: config.allow_replica_writes,
            },
        );
        let coordinator =
            ReconfigurationCoordinator::new(registry.clone(), ReconfigureSettings::from_config(&config));

        let inner = Arc::new(Inner {
            config,
            registry,
            router,
            coordinator,
            writers,
            pushes,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            runtime: Handle::current(),
        });

        if let Err(err) = inner.coordinator.run("initial connect").await {
            inner.close();
            return Err(err);
        }

        let weak = Arc::downgrade(&inner);
        let mut tasks = vec![
            tokio::spawn(run_heartbeat(weak.clone(), inner.shutdown.clone())),
            tokio::spawn(run_bridge_events(
                weak.clone(),
                events_rx,
                inner.shutdown.clone(),
            )),
        ];
        if inner.config.config_check_interval().is_some() {
            tasks.push(tokio::spawn(run_config_check(weak, inner.shutdown.clone())));
        }
        *inner.tasks.lock() = tasks;
        info!(
            endpoints = inner.registry.snapshot().endpoints.len(),
            "multiplexer connected"
        );
        Ok(Multiplexer { inner })
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    /// Run `message` and wait at most `sync_timeout_ms` for the reply. On
    /// timeout the message stays pending and its late reply is dropped.
    pub async fn execute<D: ResultDecoder>(&self, message: Message, decoder: D) -> MuxResult<D::Output> {
        let command = message.to_string();
        let tracker = metrics::command_tracker(&message.command.name());
        let limit = self.inner.config.sync_timeout();
        match timeout(limit, self.submit(message, decoder)).await {
            Ok(result) => {
                record_result(&result);
                drop(tracker);
                result
            }
            Err(_) => {
                let elapsed_ms = tracker.elapsed().as_millis() as u64;
                tracker.discard();
                metrics::command_result("timeout");
                Err(MuxError::Timeout {
                    command,
                    elapsed_ms,
                })
            }
        }
    }

    /// Route and queue `message` now; the returned future has no timeout.
    pub fn execute_async<D: ResultDecoder>(&self, message: Message, decoder: D) -> ResponseFuture<D::Output> {
        let tracker = metrics::command_tracker(&message.command.name());
        let pending = self.submit(message, decoder);
        ResponseFuture::new(
            async move {
                let result = pending.await;
                record_result(&result);
                drop(tracker);
                result
            }
            .boxed(),
        )
    }

    /// [`Multiplexer::execute`] for threads outside the runtime.
    pub fn execute_blocking<D: ResultDecoder>(&self, message: Message, decoder: D) -> MuxResult<D::Output> {
        if Handle::try_current().is_ok() {
            return Err(MuxError::CommandRejected(
                "execute_blocking cannot be called from inside the async runtime".to_string(),
            ));
        }
        self.inner.runtime.block_on(self.execute(message, decoder))
    }

    /// Send without waiting. Server replies, errors included, are
    /// discarded; only local routing failures are reported.
    pub fn fire_and_forget(&self, mut message: Message) -> MuxResult<()> {
        message.flags |= CommandFlags::FIRE_AND_FORGET;
        let command = message.to_string();
        self.inner.start(message).map(|_| ()).map_err(|err| {
            debug!(command = %command, error = %err, "fire-and-forget not sent");
            err
        })
    }

    /// Rediscover the topology now. Returns false if a run was already in
    /// progress or failed.
    pub async fn reconfigure(&self, reason: &str) -> bool {
        match self.inner.coordinator.run(reason).await {
            Ok(ran) => ran,
            Err(err) => {
                warn!(reason, error = %err, "reconfiguration failed");
                false
            }
        }
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        status::collect(&self.inner.registry.snapshot())
    }

    /// Pub/sub deliveries from every subscription connection.
    pub fn notifications(&self) -> broadcast::Receiver<PushMessage> {
        self.inner.pushes.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Fail everything outstanding with `Disposed` and stop all tasks.
    pub fn close(&self) {
        self.inner.close();
    }

    fn submit<D: ResultDecoder>(&self, message: Message, decoder: D) -> ResponseFuture<D::Output> {
        let started = self.inner.start(message);
        let inner = self.inner.clone();
        ResponseFuture::new(
            async move {
                match inner.finish(started?).await? {
                    Some(value) => decoder.decode(value),
                    None => decoder.unanswered(),
                }
            }
            .boxed(),
        )
    }
}

impl Inner {
    /// Validate, route and queue. Runs synchronously so call order is
    /// write order for messages to the same connection.
    fn start(&self, message: Message) -> MuxResult<InFlight> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::Disposed);
        }
        let mut message = self.prepare(message)?;
        let payload = message.payload();
        let purpose = purpose_of(&message);
        let reply = if message.is_fire_and_forget() {
            None
        } else {
            let (sink, rx) = ResultSink::channel();
            message.bind_sink(sink);
            Some(rx)
        };
        let bridge = self.router.select(&message)?;
        self.enqueue(&bridge, message)?;
        Ok(InFlight {
            payload,
            purpose,
            reply,
        })
    }

    fn prepare(&self, mut message: Message) -> MuxResult<Message> {
        if message.command.is_subscription() && message.channels().count() != 1 {
            return Err(MuxError::CommandRejected(format!(
                "{} takes exactly one channel per message",
                message.command
            )));
        }
        let cluster = self.registry.snapshot().is_cluster();
        if message.database.is_none() && message.keys().next().is_some() {
            message.database = self.config.default_database;
        }
        if cluster {
            match message.database {
                Some(db) if db > 0 => {
                    return Err(MuxError::CommandRejected(format!(
                        "database {db} is not available in cluster mode"
                    )))
                }
                _ => message.database = None,
            }
        }
        if message.command.is_subscription() {
            message.database = None;
        }
        Ok(message)
    }

    fn enqueue(&self, bridge: &Arc<ConnectionBridge>, mut message: Message) -> MuxResult<()> {
        if message.exec.read_mode.is_none() {
            message.exec.read_mode = self.router.read_mode_for(bridge);
        }
        bridge
            .try_enqueue(message)
            .map_err(|message| not_accepted(bridge, &message, &self.registry.snapshot()))
    }

    /// Await the reply, following cluster redirects. `None` for
    /// fire-and-forget messages.
    async fn finish(self: Arc<Self>, flight: InFlight) -> MuxResult<Option<RespValue>> {
        let InFlight {
            payload,
            purpose,
            reply,
        } = flight;
        let Some(mut reply) = reply else {
            return Ok(None);
        };
        let mut redirects = 0;
        loop {
            let value = reply.await.unwrap_or(Err(MuxError::Disposed))?;
            let RespValue::Error(text) = value else {
                return Ok(Some(value));
            };
            let follow = !payload.flags.contains(CommandFlags::NO_REDIRECT)
                && redirects < MAX_REDIRECTS;
            match Redirect::parse(&text) {
                Some(redirect) if follow => {
                    redirects += 1;
                    reply = self.follow(&redirect, &payload, purpose).await?;
                }
                _ => {
                    return Err(MuxError::CommandRejected(
                        String::from_utf8_lossy(&text).into_owned(),
                    ))
                }
            }
        }
    }

    async fn follow(
        self: &Arc<Self>,
        redirect: &Redirect,
        payload: &MessagePayload,
        purpose: ConnectionPurpose,
    ) -> MuxResult<ResultReceiver> {
        metrics::redirect(redirect.kind.as_str());
        debug!(redirect = %redirect, command = %payload.command, "following redirect");
        let mut message = payload.clone().into_message();
        let endpoint = match redirect.kind {
            RedirectKind::Moved => {
                let endpoint = self.registry.note_moved(redirect.slot, &redirect.endpoint);
                spawn_reconfigure(Arc::downgrade(self), "MOVED");
                endpoint
            }
            RedirectKind::Ask => {
                message.exec.asking = true;
                self.registry.get_or_add(&redirect.endpoint)
            }
        };
        let bridge = endpoint.bridge(purpose).clone();
        if !bridge.is_established() {
            let ready = timeout(self.config.connect_timeout(), bridge.wait_established())
                .await
                .unwrap_or(false);
            if !ready {
                return Err(MuxError::NoConnectionAvailable {
                    command: message.to_string(),
                    status: format!("redirect target {} is {}", redirect.endpoint, bridge.state()),
                });
            }
        }
        let (sink, rx) = ResultSink::channel();
        message.bind_sink(sink);
        message.exec.read_mode = None;
        self.enqueue(&bridge, message)?;
        Ok(rx)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.registry.close_all();
        self.writers.shutdown();
        info!("multiplexer closed");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

fn purpose_of(message: &Message) -> ConnectionPurpose {
    if message.command.is_subscription() {
        ConnectionPurpose::Subscription
    } else {
        ConnectionPurpose::Interactive
    }
}

fn record_result<T>(result: &MuxResult<T>) {
    match result {
        Ok(_) => metrics::command_result("ok"),
        Err(err) => metrics::command_result(err.kind().as_str()),
    }
}

fn spawn_reconfigure(inner: Weak<Inner>, reason: &'static str) {
    tokio::spawn(async move {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(err) = inner.coordinator.run(reason).await {
            warn!(reason, error = %err, "reconfiguration failed");
        }
    });
}

async fn run_heartbeat(inner: Weak<Inner>, shutdown: CancellationToken) {
    let period = match inner.upgrade() {
        Some(inner) => inner.config.heartbeat_interval(),
        None => return,
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.registry.heartbeat();
    }
    debug!("heartbeat stopped");
}

async fn run_config_check(inner: Weak<Inner>, shutdown: CancellationToken) {
    let period = match inner.upgrade().and_then(|inner| inner.config.config_check_interval()) {
        Some(period) => period,
        None => return,
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the initial run already happened.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(err) = inner.coordinator.run("periodic check").await {
            warn!(error = %err, "periodic reconfiguration failed");
        }
    }
}

async fn run_bridge_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<BridgeEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(strong) = inner.upgrade() else {
            break;
        };
        match event {
            BridgeEvent::Failed {
                endpoint,
                purpose: ConnectionPurpose::Interactive,
                was_established: true,
                error,
            } => {
                let snapshot = strong.registry.snapshot();
                let lost_master = snapshot.master.as_deref() == Some(&*endpoint)
                    || (snapshot.is_cluster()
                        && snapshot
                            .endpoint(&endpoint)
                            .map_or(false, |ep| ep.role() == ServerRole::Master));
                if lost_master {
                    warn!(endpoint = %endpoint, error = %error, "lost connection to a master");
                    spawn_reconfigure(inner.clone(), "master connection lost");
                }
            }
            BridgeEvent::Established {
                endpoint,
                purpose: ConnectionPurpose::Interactive,
            } => {
                let unresponsive = strong
                    .registry
                    .get(&endpoint)
                    .map_or(false, |ep| !ep.flags().is_empty());
                if unresponsive {
                    info!(endpoint = %endpoint, "endpoint reconnected");
                    spawn_reconfigure(inner.clone(), "endpoint reconnected");
                }
            }
            _ => {}
        }
    }
}

/// `bridge` turned `message` away; report it with the whole topology.
fn not_accepted(
    bridge: &ConnectionBridge,
    message: &Message,
    snapshot: &RoutingSnapshot,
) -> MuxError {
    MuxError::NoConnectionAvailable {
        command: message.to_string(),
        status: format!(
            "{} {} connection is {}; {}",
            bridge.endpoint(),
            bridge.purpose(),
            bridge.state(),
            snapshot.describe()
        ),
    }
}
