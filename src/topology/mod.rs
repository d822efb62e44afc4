pub mod endpoint;
pub mod info;
pub mod reconfigure;
pub mod router;

pub use endpoint::{
    BridgeFactory, EndpointRegistry, RoutingSnapshot, SelectableFlags, ServerEndpoint,
};
pub use info::{InfoFields, ServerRole, ServerType};
pub use reconfigure::{
    elect_master, Election, ProbeReport, ReconfigurationCoordinator, ReconfigureSettings,
    MAX_DISCOVERY_ROUNDS,
};
pub use router::{RoutingPolicy, TopologyRouter};
