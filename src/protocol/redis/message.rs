use std::fmt;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use bytes::Bytes;
use smallvec::SmallVec;

use crate::backend::sink::ResultSink;
use crate::error::MuxError;
use crate::utils::{combine_slot, hash_slot, SlotConflict};

use super::command::Command;
use super::types::RespValue;

bitflags! {
    /// Caller-visible execution options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommandFlags: u16 {
        /// Complete immediately; the reply is read and discarded.
        const FIRE_AND_FORGET = 1 << 0;
        /// Jump ahead of already queued messages.
        const HIGH_PRIORITY = 1 << 1;
        const DEMAND_MASTER = 1 << 2;
        const PREFER_MASTER = 1 << 3;
        const DEMAND_REPLICA = 1 << 4;
        const PREFER_REPLICA = 1 << 5;
        /// Surface MOVED/ASK replies instead of following them.
        const NO_REDIRECT = 1 << 6;
    }
}

/// Which server role a message wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolePreference {
    Any,
    PreferMaster,
    DemandMaster,
    PreferReplica,
    DemandReplica,
}

impl RolePreference {
    pub fn from_flags(flags: CommandFlags) -> Self {
        if flags.contains(CommandFlags::DEMAND_MASTER) {
            RolePreference::DemandMaster
        } else if flags.contains(CommandFlags::DEMAND_REPLICA) {
            RolePreference::DemandReplica
        } else if flags.contains(CommandFlags::PREFER_REPLICA) {
            RolePreference::PreferReplica
        } else if flags.contains(CommandFlags::PREFER_MASTER) {
            RolePreference::PreferMaster
        } else {
            RolePreference::Any
        }
    }

    pub fn wants_replica(self) -> bool {
        matches!(
            self,
            RolePreference::PreferReplica | RolePreference::DemandReplica
        )
    }
}

/// Cluster connection read mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    ReadOnly,
    ReadWrite,
}

impl ReadMode {
    pub fn command(self) -> Command {
        match self {
            ReadMode::ReadOnly => Command::ReadOnly,
            ReadMode::ReadWrite => Command::ReadWrite,
        }
    }
}

/// Execution details that only the multiplexer itself sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecContext {
    /// Handshake or topology probe; may queue before the bridge is
    /// established and bypasses the admin check.
    pub internal: bool,
    /// Prefix the write with `ASKING`.
    pub asking: bool,
    /// Read mode the connection must be in before this message.
    pub read_mode: Option<ReadMode>,
    /// The call site allows `$-1` argument blobs.
    pub permit_null: bool,
}

/// One argument blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Key(Bytes),
    Value(Bytes),
    Channel(Bytes),
    Int(i64),
    Null,
}

pub type Args = SmallVec<[Arg; 4]>;

/// A command on its way to a server.
///
/// Built once, then owned by the outbound queue, the pending ledger and
/// finally consumed by completion.
#[derive(Debug)]
pub struct Message {
    pub database: Option<u32>,
    pub flags: CommandFlags,
    pub command: Command,
    pub args: Args,
    pub exec: ExecContext,
    sink: Option<ResultSink>,
    created_at: Instant,
}

/// Everything but the sink, for re-issuing a message after a redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePayload {
    pub database: Option<u32>,
    pub flags: CommandFlags,
    pub command: Command,
    pub args: Args,
    pub exec: ExecContext,
}

impl MessagePayload {
    pub fn into_message(self) -> Message {
        Message {
            database: self.database,
            flags: self.flags,
            command: self.command,
            args: self.args,
            exec: self.exec,
            sink: None,
            created_at: Instant::now(),
        }
    }
}

impl Message {
    pub fn new(command: Command) -> Self {
        Self {
            database: None,
            flags: CommandFlags::empty(),
            command,
            args: SmallVec::new(),
            exec: ExecContext::default(),
            sink: None,
            created_at: Instant::now(),
        }
    }

    pub fn builder(command: Command) -> MessageBuilder {
        MessageBuilder {
            inner: Message::new(command),
        }
    }

    /// Internal message used by handshakes and probes.
    pub fn internal(command: Command) -> MessageBuilder {
        Message::builder(command).internal()
    }

    pub fn is_fire_and_forget(&self) -> bool {
        self.flags.contains(CommandFlags::FIRE_AND_FORGET)
    }

    pub fn is_high_priority(&self) -> bool {
        self.flags.contains(CommandFlags::HIGH_PRIORITY)
    }

    pub fn is_internal(&self) -> bool {
        self.exec.internal
    }

    pub fn role_preference(&self) -> RolePreference {
        RolePreference::from_flags(self.flags)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.args.iter().filter_map(|arg| match arg {
            Arg::Key(key) => Some(key),
            _ => None,
        })
    }

    pub fn channels(&self) -> impl Iterator<Item = &Bytes> {
        self.args.iter().filter_map(|arg| match arg {
            Arg::Channel(channel) => Some(channel),
            _ => None,
        })
    }

    /// Hash slot every key (and routed channel) agrees on, if any.
    pub fn slot(&self) -> Result<Option<u16>, SlotConflict> {
        let mut slot = None;
        for key in self.keys() {
            slot = combine_slot(slot, hash_slot(key))?;
        }
        if self.command.routes_by_channel() {
            for channel in self.channels() {
                slot = combine_slot(slot, hash_slot(channel))?;
            }
        }
        Ok(slot)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn bind_sink(&mut self, sink: ResultSink) {
        self.sink = Some(sink);
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn payload(&self) -> MessagePayload {
        MessagePayload {
            database: self.database,
            flags: self.flags,
            command: self.command.clone(),
            args: self.args.clone(),
            exec: self.exec,
        }
    }

    /// Deliver a reply. A message without a sink swallows it.
    pub fn complete(self, result: Result<RespValue, MuxError>) {
        if let Some(sink) = self.sink {
            sink.complete(result);
        }
    }

    pub fn fail(self, err: MuxError) {
        self.complete(Err(err));
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        if let Some(key) = self.keys().next() {
            write!(f, " {}", String::from_utf8_lossy(key))?;
        }
        Ok(())
    }
}

pub struct MessageBuilder {
    inner: Message,
}

impl MessageBuilder {
    pub fn database(mut self, database: u32) -> Self {
        self.inner.database = Some(database);
        self
    }

    pub fn flags(mut self, flags: CommandFlags) -> Self {
        self.inner.flags |= flags;
        self
    }

    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        self.inner.args.push(Arg::Key(key.into()));
        self
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.inner.args.push(Arg::Value(value.into()));
        self
    }

    pub fn channel(mut self, channel: impl Into<Bytes>) -> Self {
        self.inner.args.push(Arg::Channel(channel.into()));
        self
    }

    pub fn int(mut self, value: i64) -> Self {
        self.inner.args.push(Arg::Int(value));
        self
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.inner.args.push(arg);
        self
    }

    pub fn internal(mut self) -> Self {
        self.inner.exec.internal = true;
        self
    }

    pub fn permit_null(mut self) -> Self {
        self.inner.exec.permit_null = true;
        self
    }

    pub fn build(self) -> Message {
        self.inner
    }
}
