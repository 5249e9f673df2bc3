//! Multicast address allocation: random transient groups and unicast-prefix-based IPv6 groups.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::identity::fill_random;

/// Longest unicast prefix that fits into a prefix-based multicast address.
pub const MAX_EMBEDDED_PREFIX_LEN: u8 = 64;

/// Address family selector for transient allocation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Family {
    V4,
    V6,
}

/// Random transient multicast address for `family`.
pub fn transient(family: Family) -> Result<IpAddr, AddrError> {
    Ok(match family {
        Family::V4 => IpAddr::V4(transient_v4()?),
        Family::V6 => IpAddr::V6(transient_v6()?),
    })
}

/// Random IPv4 multicast address: 224.x.y.z with the top three bits of y set.
pub fn transient_v4() -> Result<Ipv4Addr, AddrError> {
    let mut ip = [0u8; 4];
    fill_random(&mut ip).map_err(|_| AddrError::Random)?;
    ip[0] = 0xe0;
    ip[2] |= 0xe0;
    Ok(Ipv4Addr::from(ip))
}

/// Random global-scope transient IPv6 multicast address (ff1e::/16).
pub fn transient_v6() -> Result<Ipv6Addr, AddrError> {
    let mut ip = [0u8; 16];
    fill_random(&mut ip).map_err(|_| AddrError::Random)?;
    ip[0] = 0xff;
    ip[1] = 0x1e;
    Ok(Ipv6Addr::from(ip))
}

/// A unicast network prefix: address plus prefix length in bits.
/// The stored address is masked to the prefix length.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Prefix {
    addr: IpAddr,
    len: u8,
}

impl Prefix {
    /// Build a prefix, masking host bits. Fails if `len` exceeds the family width.
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, AddrError> {
        let addr = match addr {
            IpAddr::V4(v4) => {
                if len > 32 {
                    return Err(AddrError::InvalidPrefixLen(len));
                }
                let mask = u32::MAX.checked_shl(32 - len as u32).unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                if len > 128 {
                    return Err(AddrError::InvalidPrefixLen(len));
                }
                let mask = u128::MAX.checked_shl(128 - len as u32).unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        };
        Ok(Self { addr, len })
    }

    /// Build a prefix from an interface address and its netmask.
    /// Non-contiguous masks and mixed families are rejected.
    pub fn from_netmask(addr: IpAddr, netmask: IpAddr) -> Result<Self, AddrError> {
        let (ones, zeros) = match (addr, netmask) {
            (IpAddr::V4(_), IpAddr::V4(m)) => {
                let m = u32::from(m);
                (m.leading_ones(), m.trailing_zeros())
            }
            (IpAddr::V6(_), IpAddr::V6(m)) => {
                let m = u128::from(m);
                (m.leading_ones(), m.trailing_zeros())
            }
            _ => return Err(AddrError::InvalidNetmask),
        };
        let width = if addr.is_ipv4() { 32 } else { 128 };
        if ones + zeros != width {
            return Err(AddrError::InvalidNetmask);
        }
        Self::new(addr, ones as u8)
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }
}

/// Unicast-prefix-based IPv6 multicast address (ff3e::/16, RFC 3306 layout):
/// `ff3e:00 plen` followed by the first 64 prefix bits and 32 random group bits.
pub fn prefixed_v6(prefix: &Prefix) -> Result<Ipv6Addr, AddrError> {
    let net = match prefix.addr {
        IpAddr::V4(_) => return Err(AddrError::Ipv4Prefix),
        IpAddr::V6(v6) => v6,
    };
    if net.to_ipv4_mapped().is_some() {
        return Err(AddrError::Ipv4Prefix);
    }
    if !is_global_unicast(&net) {
        return Err(AddrError::NotGlobalUnicast(net));
    }
    if prefix.len > MAX_EMBEDDED_PREFIX_LEN {
        return Err(AddrError::PrefixTooLong(prefix.len));
    }

    let mut ip = [0u8; 16];
    fill_random(&mut ip).map_err(|_| AddrError::Random)?;
    ip[..4].copy_from_slice(&[0xff, 0x3e, 0x00, prefix.len]);
    ip[4..12].copy_from_slice(&net.octets()[..8]);
    Ok(Ipv6Addr::from(ip))
}

/// Unicast, not unspecified, loopback, link-local or multicast.
/// Unique-local and documentation ranges count as global unicast.
pub fn is_global_unicast(ip: &Ipv6Addr) -> bool {
    let seg0 = ip.segments()[0];
    !(ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() || (seg0 & 0xffc0) == 0xfe80)
}

/// Whether `ip` carries the forced bits of an IPv4 transient address.
pub fn is_transient_v4(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 0xe0 && o[2] & 0xe0 == 0xe0
}

/// Whether `ip` carries the forced bits of an IPv6 transient address.
pub fn is_transient_v6(ip: &Ipv6Addr) -> bool {
    let o = ip.octets();
    o[0] == 0xff && o[1] == 0x1e
}

#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("randomness source failed")]
    Random,
    #[error("prefix length {0} out of range")]
    InvalidPrefixLen(u8),
    #[error("netmask is not a contiguous prefix")]
    InvalidNetmask,
    #[error("ipv4 prefixes cannot be embedded in an ipv6 multicast address")]
    Ipv4Prefix,
    #[error("prefix {0} is not global unicast")]
    NotGlobalUnicast(Ipv6Addr),
    #[error("prefix length {0} exceeds /64")]
    PrefixTooLong(u8),
}
