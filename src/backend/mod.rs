pub mod bridge;
pub mod connector;
pub mod ledger;
pub mod physical;
pub mod queue;
pub mod sink;
pub mod writer;

pub use bridge::{BridgeCounters, BridgeEvent, BridgeSettings, BridgeState, ConnectionBridge};
pub use connector::{BoxTransport, Connector, TcpConnector, Transport};
pub use physical::{
    ConnectionCounters, ConnectionObserver, ConnectionOptions, ConnectionPurpose,
    PhysicalConnection, Staleness, WriteOutcome,
};
pub use sink::{ResultReceiver, ResultSink};
pub use writer::WriterPool;
