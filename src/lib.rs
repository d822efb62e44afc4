//! Shares a small set of pipelined RESP connections among many callers,
//! routing each command by role and hash slot across standalone, replicated
//! and cluster deployments.

pub mod backend;
pub mod config;
pub mod error;
pub mod metrics;
pub mod multiplexer;
pub mod protocol;
pub mod topology;
pub mod utils;

pub use config::{Credentials, MuxConfig};
pub use error::{FailureKind, MuxError, MuxResult};
pub use multiplexer::{EndpointStatus, Multiplexer, ResponseFuture};
pub use protocol::redis::{
    Command, CommandFlags, Message, PushMessage, RespValue, ResultDecoder,
};
