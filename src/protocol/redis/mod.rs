mod codec;
mod command;
mod decode;
mod message;
mod slots;
mod types;

pub use codec::{encode_request, RespCodec, MAX_BULK_LEN, MAX_DEPTH};
pub use command::{Command, CommandMap, CommandTraits};
pub use decode::{
    decode_with, BulkArrayDecoder, BulkDecoder, FnDecoder, IntegerDecoder, OkDecoder, RawDecoder,
    ResultDecoder, StringDecoder,
};
pub use message::{
    Arg, Args, CommandFlags, ExecContext, Message, MessageBuilder, MessagePayload, ReadMode,
    RolePreference,
};
pub use slots::{parse_cluster_nodes, ClusterNode, SlotTable};
pub use types::{PushMessage, RespValue, PUSH_MARKERS};
