//! peercast reference node: configuration, peer and session tables, the
//! host-driven protocol state machine, and the async driver around it.

pub mod config;
pub mod discovery;
pub mod node;
pub mod peers;

pub use config::Config;
pub use discovery::{DiscoveryOptions, Event, SharedNode};
pub use node::{Node, NodeError, NodeSettings, OutboundAction};
