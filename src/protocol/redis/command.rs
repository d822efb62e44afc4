use std::fmt;

use bitflags::bitflags;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};

use crate::error::{MuxError, MuxResult};

bitflags! {
    /// Static properties of a command verb.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandTraits: u8 {
        /// Requires `allow_admin`.
        const ADMIN = 0b0001;
        /// Mutates data; can only run on a master.
        const WRITE = 0b0010;
        /// Routed to the subscription connection.
        const SUBSCRIPTION = 0b0100;
        /// Channel arguments participate in cluster slot routing.
        const SHARDED_CHANNEL = 0b1000;
    }
}

const NONE: CommandTraits = CommandTraits::empty();
const ADMIN: CommandTraits = CommandTraits::ADMIN;
const WRITE: CommandTraits = CommandTraits::WRITE;
const ADMIN_WRITE: CommandTraits = CommandTraits::ADMIN.union(CommandTraits::WRITE);
const SUB: CommandTraits = CommandTraits::SUBSCRIPTION;

macro_rules! commands {
    ($($variant:ident => $verb:literal, $traits:expr;)*) => {
        /// Command verb carried by a [`Message`](super::Message).
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum Command {
            $($variant,)*
            /// Any verb without a dedicated variant.
            Other(Bytes),
        }

        impl Command {
            /// Wire spelling of the verb.
            pub fn verb(&self) -> &[u8] {
                match self {
                    $(Command::$variant => $verb,)*
                    Command::Other(verb) => verb.as_ref(),
                }
            }

            pub fn traits(&self) -> CommandTraits {
                match self {
                    $(Command::$variant => $traits,)*
                    Command::Other(_) => NONE,
                }
            }

            /// Case-insensitive lookup of a verb.
            pub fn from_verb(verb: &[u8]) -> Command {
                let upper = verb.to_ascii_uppercase();
                $(
                    if upper.as_slice() == &$verb[..] {
                        return Command::$variant;
                    }
                )*
                Command::Other(Bytes::from(upper))
            }
        }
    };
}

commands! {
    Append => b"APPEND", WRITE;
    Asking => b"ASKING", NONE;
    Auth => b"AUTH", NONE;
    BgRewriteAof => b"BGREWRITEAOF", ADMIN;
    BgSave => b"BGSAVE", ADMIN;
    Client => b"CLIENT", ADMIN;
    Cluster => b"CLUSTER", ADMIN;
    Config => b"CONFIG", ADMIN;
    DbSize => b"DBSIZE", NONE;
    Debug => b"DEBUG", ADMIN;
    Decr => b"DECR", WRITE;
    DecrBy => b"DECRBY", WRITE;
    Del => b"DEL", WRITE;
    Discard => b"DISCARD", NONE;
    Echo => b"ECHO", NONE;
    Eval => b"EVAL", WRITE;
    EvalSha => b"EVALSHA", WRITE;
    Exec => b"EXEC", NONE;
    Exists => b"EXISTS", NONE;
    Expire => b"EXPIRE", WRITE;
    FlushAll => b"FLUSHALL", ADMIN_WRITE;
    FlushDb => b"FLUSHDB", ADMIN_WRITE;
    Get => b"GET", NONE;
    GetSet => b"GETSET", WRITE;
    HDel => b"HDEL", WRITE;
    HGet => b"HGET", NONE;
    HGetAll => b"HGETALL", NONE;
    HSet => b"HSET", WRITE;
    Incr => b"INCR", WRITE;
    IncrBy => b"INCRBY", WRITE;
    Info => b"INFO", ADMIN;
    Keys => b"KEYS", ADMIN;
    LastSave => b"LASTSAVE", ADMIN;
    LLen => b"LLEN", NONE;
    LPop => b"LPOP", WRITE;
    LPush => b"LPUSH", WRITE;
    LRange => b"LRANGE", NONE;
    MGet => b"MGET", NONE;
    Monitor => b"MONITOR", ADMIN;
    MSet => b"MSET", WRITE;
    Multi => b"MULTI", NONE;
    Persist => b"PERSIST", WRITE;
    PExpire => b"PEXPIRE", WRITE;
    Ping => b"PING", NONE;
    PSubscribe => b"PSUBSCRIBE", SUB;
    Publish => b"PUBLISH", CommandTraits::SHARDED_CHANNEL;
    PUnsubscribe => b"PUNSUBSCRIBE", SUB;
    Quit => b"QUIT", NONE;
    RandomKey => b"RANDOMKEY", NONE;
    ReadOnly => b"READONLY", NONE;
    ReadWrite => b"READWRITE", NONE;
    Rename => b"RENAME", WRITE;
    ReplicaOf => b"REPLICAOF", ADMIN;
    Role => b"ROLE", NONE;
    RPop => b"RPOP", WRITE;
    RPush => b"RPUSH", WRITE;
    SAdd => b"SADD", WRITE;
    Save => b"SAVE", ADMIN;
    Scan => b"SCAN", NONE;
    Script => b"SCRIPT", NONE;
    Select => b"SELECT", NONE;
    Sentinel => b"SENTINEL", NONE;
    Set => b"SET", WRITE;
    SetNx => b"SETNX", WRITE;
    Shutdown => b"SHUTDOWN", ADMIN;
    SlaveOf => b"SLAVEOF", ADMIN;
    SMembers => b"SMEMBERS", NONE;
    SRem => b"SREM", WRITE;
    SSubscribe => b"SSUBSCRIBE", SUB.union(CommandTraits::SHARDED_CHANNEL);
    Subscribe => b"SUBSCRIBE", SUB;
    SUnsubscribe => b"SUNSUBSCRIBE", SUB.union(CommandTraits::SHARDED_CHANNEL);
    Time => b"TIME", NONE;
    Ttl => b"TTL", NONE;
    Type => b"TYPE", NONE;
    Unlink => b"UNLINK", WRITE;
    Unsubscribe => b"UNSUBSCRIBE", SUB;
    Unwatch => b"UNWATCH", NONE;
    Watch => b"WATCH", NONE;
    ZAdd => b"ZADD", WRITE;
    ZRange => b"ZRANGE", NONE;
    ZRem => b"ZREM", WRITE;
    ZScore => b"ZSCORE", NONE;
}

impl Command {
    pub fn is_admin(&self) -> bool {
        self.traits().contains(CommandTraits::ADMIN)
    }

    pub fn is_master_only(&self) -> bool {
        self.traits().contains(CommandTraits::WRITE)
    }

    pub fn is_subscription(&self) -> bool {
        self.traits().contains(CommandTraits::SUBSCRIPTION)
    }

    pub fn routes_by_channel(&self) -> bool {
        self.traits().contains(CommandTraits::SHARDED_CHANNEL)
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.verb()).into_owned()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.verb()))
    }
}

/// Server-side command renames and locally disabled commands.
#[derive(Debug, Clone, Default)]
pub struct CommandMap {
    disabled: HashSet<Vec<u8>>,
    renamed: HashMap<Vec<u8>, Bytes>,
}

impl CommandMap {
    pub fn new<D, R>(disabled: D, renamed: R) -> Self
    where
        D: IntoIterator<Item = String>,
        R: IntoIterator<Item = (String, String)>,
    {
        let mut map = CommandMap::default();
        for name in disabled {
            map.disabled.insert(name.to_ascii_uppercase().into_bytes());
        }
        for (from, to) in renamed {
            let from = from.to_ascii_uppercase().into_bytes();
            if to.is_empty() {
                // `rename-command X ""` on the server removes X.
                map.disabled.insert(from);
            } else {
                map.renamed.insert(from, Bytes::from(to));
            }
        }
        map
    }

    pub fn is_disabled(&self, command: &Command) -> bool {
        self.disabled.contains(command.verb())
    }

    /// Verb to put on the wire for `command`.
    pub fn resolve<'a>(&'a self, command: &'a Command) -> MuxResult<&'a [u8]> {
        if self.is_disabled(command) {
            return Err(MuxError::CommandRejected(format!(
                "command {command} is disabled"
            )));
        }
        Ok(self
            .renamed
            .get(command.verb())
            .map(|verb| verb.as_ref())
            .unwrap_or_else(|| command.verb()))
    }
}
