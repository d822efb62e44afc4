use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::backend::connector::BoxTransport;
use crate::backend::ledger::PendingLedger;
use crate::backend::queue::OutboundQueue;
use crate::error::{ConnectionContext, MuxError, MuxResult};
use crate::metrics;
use crate::protocol::redis::{
    encode_request, Command, CommandMap, Message, PushMessage, ReadMode, RespCodec, RespValue,
};
use crate::utils::monotonic_millis;

const READ_BUFFER_CAPACITY: usize = 16 * 1024;
const FLUSH_THRESHOLD: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What a bridge uses its connection for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPurpose {
    Interactive,
    Subscription,
}

impl ConnectionPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionPurpose::Interactive => "interactive",
            ConnectionPurpose::Subscription => "subscription",
        }
    }
}

impl fmt::Display for ConnectionPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Told once when a connection dies.
pub trait ConnectionObserver: Send + Sync + 'static {
    fn on_connection_failed(&self, connection_id: u64, error: &MuxError);
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Messages written per writer pass before yielding.
    pub max_work: usize,
    pub command_map: Arc<CommandMap>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_work: 128,
            command_map: Arc::new(CommandMap::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Nothing was queued.
    Idle,
    /// Wrote this many messages and drained the queue.
    Flushed(usize),
    /// Hit the per-pass cap with messages left.
    MoreWork(usize),
    /// Another writer holds the connection.
    Busy,
    Failed,
}

/// Result of a heartbeat's look at the oldest unanswered write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    /// First heartbeat past the response timeout.
    Flagged,
    /// Still stale one heartbeat later.
    Expired,
}

/// Read-only snapshot of a connection's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionCounters {
    pub connection_id: u64,
    pub operations: u64,
    pub queue_depth: usize,
    pub pending: usize,
    pub since_read_ms: Option<u64>,
    pub since_write_ms: Option<u64>,
    pub stale: bool,
}

struct WriterState {
    sink: Option<WriteHalf<BoxTransport>>,
    buf: BytesMut,
    selected_db: Option<u32>,
    read_mode: Option<ReadMode>,
}

/// One socket: codec, outbound queue, pending ledger, reader task.
pub struct PhysicalConnection {
    id: u64,
    endpoint: Arc<str>,
    purpose: ConnectionPurpose,
    options: ConnectionOptions,
    queue: OutboundQueue,
    ledger: PendingLedger,
    writer: AsyncMutex<WriterState>,
    scheduled: AtomicBool,
    failed: AtomicBool,
    failure: Mutex<Option<MuxError>>,
    subscribed: AtomicBool,
    stale: AtomicBool,
    operations: AtomicU64,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    oldest_unanswered_ms: AtomicU64,
    observer: Weak<dyn ConnectionObserver>,
    pushes: broadcast::Sender<PushMessage>,
    shutdown: CancellationToken,
}

impl fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("purpose", &self.purpose)
            .field("failed", &self.is_failed())
            .finish()
    }
}

impl PhysicalConnection {
    /// Take ownership of `transport` and spawn the reader task.
    pub fn start(
        endpoint: Arc<str>,
        purpose: ConnectionPurpose,
        transport: BoxTransport,
        options: ConnectionOptions,
        observer: Weak<dyn ConnectionObserver>,
        pushes: broadcast::Sender<PushMessage>,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(transport);
        let now = monotonic_millis();
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            purpose,
            options,
            queue: OutboundQueue::new(),
            ledger: PendingLedger::new(),
            writer: AsyncMutex::new(WriterState {
                sink: Some(writer),
                buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
                selected_db: None,
                read_mode: None,
            }),
            scheduled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            stale: AtomicBool::new(false),
            operations: AtomicU64::new(0),
            last_read_ms: AtomicU64::new(now),
            last_write_ms: AtomicU64::new(now),
            oldest_unanswered_ms: AtomicU64::new(0),
            observer,
            pushes,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(conn.clone().read_loop(reader));
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn purpose(&self) -> ConnectionPurpose {
        self.purpose
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// The error this connection failed with, once it has failed.
    pub fn failure(&self) -> Option<MuxError> {
        self.failure.lock().clone()
    }

    /// Queue `message` for the writer. Returns whether the queue was empty,
    /// or the message itself if the connection already failed.
    pub fn enqueue(&self, message: Message) -> Result<bool, Message> {
        let front = message.is_high_priority();
        self.queue
            .push_unless(message, front, || self.failed.load(Ordering::Acquire))
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Claim the single writer-pool slot for this connection.
    pub fn try_schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    pub fn clear_scheduled(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    /// Drain up to `max_work` queued messages onto the socket.
    pub async fn write_pending(&self) -> WriteOutcome {
        let mut state = match self.writer.try_lock() {
            Ok(state) => state,
            Err(_) => return WriteOutcome::Busy,
        };
        if self.is_failed() {
            drop(state);
            self.reap();
            return WriteOutcome::Failed;
        }

        let mut written = 0usize;
        let mut io_error = None;
        while written < self.options.max_work {
            let Some(message) = self.queue.pop() else {
                break;
            };
            self.stage(&mut state, message);
            written += 1;
            if state.buf.len() >= FLUSH_THRESHOLD {
                if let Err(err) = self.flush(&mut state).await {
                    io_error = Some(err);
                    break;
                }
            }
        }
        if io_error.is_none() {
            if let Err(err) = self.flush(&mut state).await {
                io_error = Some(err);
            }
        }
        drop(state);

        if let Some(err) = io_error {
            self.fail(MuxError::socket(
                format!("write failed: {err}"),
                ConnectionContext::default(),
            ));
        }
        if self.is_failed() {
            self.reap();
            return WriteOutcome::Failed;
        }
        if written == 0 {
            return WriteOutcome::Idle;
        }
        metrics::operations_written(&self.endpoint, written as u64);
        if self.queue.is_empty() {
            WriteOutcome::Flushed(written)
        } else {
            WriteOutcome::MoreWork(written)
        }
    }

    fn stage(&self, state: &mut WriterState, message: Message) {
        let verb = match self.options.command_map.resolve(&message.command) {
            Ok(verb) => verb,
            Err(err) => {
                message.fail(err);
                return;
            }
        };

        // A caller must never run against a database or read mode the
        // connection could not switch to.
        if let Some(db) = message.database {
            if state.selected_db != Some(db) {
                let select = Message::internal(Command::Select).int(db as i64).build();
                if let Err(err) = self.inject(state, select) {
                    message.fail(err);
                    return;
                }
                state.selected_db = Some(db);
            }
        }
        if let Some(mode) = message.exec.read_mode {
            if state.read_mode != Some(mode) {
                if let Err(err) = self.inject(state, Message::internal(mode.command()).build()) {
                    message.fail(err);
                    return;
                }
                state.read_mode = Some(mode);
            }
        }
        if message.exec.asking {
            if let Err(err) = self.inject(state, Message::internal(Command::Asking).build()) {
                message.fail(err);
                return;
            }
        }

        match encode_request(verb, &message.args, message.exec.permit_null, &mut state.buf) {
            Ok(()) => self.record_written(message),
            Err(err) => message.fail(err),
        }
    }

    /// Write a connection-state command ahead of a caller's message. Its
    /// reply is consumed from the ledger like any other.
    fn inject(&self, state: &mut WriterState, message: Message) -> MuxResult<()> {
        let encoded = self
            .options
            .command_map
            .resolve(&message.command)
            .and_then(|verb| encode_request(verb, &message.args, false, &mut state.buf));
        match encoded {
            Ok(()) => {
                self.record_written(message);
                Ok(())
            }
            Err(err) => {
                warn!(
                    endpoint = %self.endpoint,
                    command = %message.command,
                    error = %err,
                    "cannot send connection-state command"
                );
                Err(MuxError::CommandRejected(format!(
                    "cannot send {} ahead of the command: {err}",
                    message.command
                )))
            }
        }
    }

    fn record_written(&self, message: Message) {
        self.ledger.push(message);
        let _ = self.oldest_unanswered_ms.compare_exchange(
            0,
            monotonic_millis(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    async fn flush(&self, state: &mut WriterState) -> io::Result<()> {
        if state.buf.is_empty() {
            return Ok(());
        }
        let WriterState { sink, buf, .. } = state;
        let writer = sink
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        // A peer that stops reading must not hold the worker past fail().
        let written = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            result = async {
                writer.write_all(&buf[..]).await?;
                writer.flush().await
            } => Some(result),
        };
        match written {
            Some(result) => result?,
            None => {
                *sink = None;
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection failed during write",
                ));
            }
        }
        buf.clear();
        self.last_write_ms.store(monotonic_millis(), Ordering::Release);
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<BoxTransport>) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
        let mut codec = RespCodec::new();
        loop {
            if buf.capacity() - buf.len() < READ_BUFFER_CAPACITY / 4 {
                buf.reserve(READ_BUFFER_CAPACITY);
            }
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                read = reader.read_buf(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    self.fail(MuxError::socket(
                        "connection closed by server",
                        ConnectionContext::default(),
                    ));
                    return;
                }
                Ok(n) => trace!(endpoint = %self.endpoint, bytes = n, "read"),
                Err(err) => {
                    self.fail(MuxError::socket(
                        format!("read failed: {err}"),
                        ConnectionContext::default(),
                    ));
                    return;
                }
            }
            self.last_read_ms
                .store(monotonic_millis(), Ordering::Release);

            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(value)) => {
                        if let Err(err) = self.on_reply(value) {
                            self.fail(err);
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        self.fail(err);
                        return;
                    }
                }
            }
            self.reset_unanswered();
        }
    }

    fn diverts_pushes(&self) -> bool {
        self.purpose == ConnectionPurpose::Subscription || self.subscribed.load(Ordering::Acquire)
    }

    fn on_reply(&self, value: RespValue) -> MuxResult<()> {
        if self.diverts_pushes() && value.is_push_message() {
            if let Some(push) = PushMessage::from_resp(&self.endpoint, value) {
                // No receivers is fine.
                let _ = self.pushes.send(push);
            }
            return Ok(());
        }
        let message = self.ledger.pop().ok_or_else(|| {
            MuxError::protocol(format!(
                "received {} with no pending message",
                describe(&value)
            ))
        })?;
        if message.command.is_subscription() && !value.is_error() {
            self.subscribed.store(true, Ordering::Release);
        }
        if value.is_error() && !message.has_sink() {
            debug!(
                endpoint = %self.endpoint,
                command = %message.command,
                reply = ?value,
                "error reply to a message nobody waits for"
            );
        }
        message.complete(Ok(value));
        Ok(())
    }

    fn reset_unanswered(&self) {
        if self.ledger.is_empty() {
            self.oldest_unanswered_ms.store(0, Ordering::Release);
            if !self.ledger.is_empty() {
                let _ = self.oldest_unanswered_ms.compare_exchange(
                    0,
                    monotonic_millis(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        } else {
            self.oldest_unanswered_ms
                .store(monotonic_millis(), Ordering::Release);
        }
        self.stale.store(false, Ordering::Release);
    }

    /// Compare the oldest unanswered write against `timeout_ms`.
    pub fn check_staleness(&self, timeout_ms: u64) -> Staleness {
        let oldest = self.oldest_unanswered_ms.load(Ordering::Acquire);
        if oldest == 0 || monotonic_millis().saturating_sub(oldest) <= timeout_ms {
            return Staleness::Fresh;
        }
        if self.stale.swap(true, Ordering::AcqRel) {
            Staleness::Expired
        } else {
            Staleness::Flagged
        }
    }

    /// Milliseconds since bytes last left for the server.
    pub fn idle_ms(&self) -> u64 {
        monotonic_millis().saturating_sub(self.last_write_ms.load(Ordering::Acquire))
    }

    pub fn counters(&self) -> ConnectionCounters {
        let now = monotonic_millis();
        ConnectionCounters {
            connection_id: self.id,
            operations: self.operations.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
            pending: self.ledger.len(),
            since_read_ms: Some(now.saturating_sub(self.last_read_ms.load(Ordering::Acquire))),
            since_write_ms: Some(now.saturating_sub(self.last_write_ms.load(Ordering::Acquire))),
            stale: self.stale.load(Ordering::Acquire),
        }
    }

    fn context(&self) -> ConnectionContext {
        let counters = self.counters();
        ConnectionContext {
            endpoint: self.endpoint.to_string(),
            queue_depth: counters.queue_depth,
            pending: counters.pending,
            since_read_ms: counters.since_read_ms,
            since_write_ms: counters.since_write_ms,
            oldest_pending_ms: self
                .ledger
                .oldest_age()
                .map(|age| age.as_millis() as u64),
        }
    }

    /// Tear the connection down: every queued and pending message fails
    /// with `error` and the observer is told once.
    pub fn fail(&self, error: MuxError) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        let error = error.with_context(self.context());
        *self.failure.lock() = Some(error.clone());
        self.shutdown.cancel();
        if let Ok(mut state) = self.writer.try_lock() {
            state.sink = None;
        }
        metrics::connection_failure(&self.endpoint, error.kind());
        warn!(
            endpoint = %self.endpoint,
            connection = self.id,
            purpose = %self.purpose,
            error = %error,
            "connection failed"
        );
        self.reap();
        if let Some(observer) = self.observer.upgrade() {
            observer.on_connection_failed(self.id, &error);
        }
    }

    pub fn close(&self) {
        self.fail(MuxError::Disposed);
    }

    /// Fail anything left in the queue or ledger after a failure, including
    /// messages a writer staged concurrently with `fail`.
    fn reap(&self) {
        let error = match self.failure.lock().clone() {
            Some(error) => error,
            None => return,
        };
        let pending = self.ledger.drain();
        let queued = self.queue.drain();
        if !pending.is_empty() || !queued.is_empty() {
            debug!(
                endpoint = %self.endpoint,
                pending = pending.len(),
                queued = queued.len(),
                "failing outstanding messages"
            );
        }
        for message in pending.into_iter().chain(queued) {
            message.fail(error.clone());
        }
    }
}

fn describe(value: &RespValue) -> &'static str {
    match value {
        RespValue::SimpleString(_) => "simple string",
        RespValue::Error(_) => "error",
        RespValue::Integer(_) => "integer",
        RespValue::BulkString(_) | RespValue::NullBulk => "bulk string",
        RespValue::Array(_) | RespValue::NullArray => "array",
    }
}
