//! peercast multicast transport: one packet-connection interface over IPv4 and IPv6
//! multicast sockets, interface discovery, and group-membership maintenance.

pub mod conn;
mod control;
pub mod error;
pub mod interface;
pub mod maintain;

#[cfg(any(test, feature = "fault-injection"))]
pub mod faulty;

pub use conn::{open, Ipv4Conn, Ipv6Conn, MulticastConn, PacketConn, HOP_LIMIT};
pub use error::NetError;
pub use interface::{
    default_interface, discover_prefixed_address, interface_by_name, interfaces, Interface,
    InterfaceAddr, InterfaceFlags,
};
pub use maintain::{maintain_join, spawn_maintain_join};
