//! Transport errors.

use std::io;
use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("interface enumeration failed: {0}")]
    Interfaces(String),
    #[error("no net interfaces found")]
    NoInterfaces,
    #[error("interface {0} not found")]
    UnknownInterface(String),
    #[error("no routable ipv6 multicast interface found")]
    NoRoutableInterface,
    #[error("{0} is not a multicast address")]
    NotMulticast(IpAddr),
    #[error("read deadline exceeded")]
    Timeout,
    #[error("connection closed")]
    Closed,
}
