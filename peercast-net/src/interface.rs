//! Network interface enumeration and prefix-based group discovery.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use peercast_core::addr::{prefixed_v6, Prefix};
use tracing::debug;

use crate::error::NetError;

/// A network interface and the addresses assigned to it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub addrs: Vec<InterfaceAddr>,
    pub flags: InterfaceFlags,
}

/// Link state bits that decide whether an interface can carry group traffic.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct InterfaceFlags {
    pub up: bool,
    pub multicast: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct InterfaceAddr {
    pub ip: IpAddr,
    pub netmask: Option<IpAddr>,
}

impl InterfaceAddr {
    /// Network prefix of this address, when the netmask is known and contiguous.
    pub fn prefix(&self) -> Option<Prefix> {
        Prefix::from_netmask(self.ip, self.netmask?).ok()
    }
}

impl Interface {
    /// All addresses are loopback addresses.
    pub fn is_loopback(&self) -> bool {
        !self.addrs.is_empty() && self.addrs.iter().all(|a| a.ip.is_loopback())
    }

    /// Usable for discovery: up, multicast-capable, addressed and not loopback.
    pub fn is_active(&self) -> bool {
        self.flags.up && self.flags.multicast && !self.addrs.is_empty() && !self.is_loopback()
    }

    /// First IPv4 address, used to pin the outbound IPv4 multicast interface.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.addrs.iter().find_map(|a| match a.ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
    }
}

/// Enumerate interfaces, merging per-address entries that share an index.
pub fn interfaces() -> Result<Vec<Interface>, NetError> {
    let raw = NetworkInterface::show().map_err(|e| NetError::Interfaces(e.to_string()))?;
    let flags = link_flags();
    let mut out: Vec<Interface> = Vec::new();
    for ni in raw {
        let addrs = ni.addr.iter().map(|a| match a {
            Addr::V4(v4) => InterfaceAddr {
                ip: IpAddr::V4(v4.ip),
                netmask: v4.netmask.map(IpAddr::V4),
            },
            Addr::V6(v6) => InterfaceAddr {
                ip: IpAddr::V6(v6.ip),
                netmask: v6.netmask.map(IpAddr::V6),
            },
        });
        match out.iter_mut().find(|i| i.index == ni.index) {
            Some(existing) => {
                for a in addrs {
                    if !existing.addrs.contains(&a) {
                        existing.addrs.push(a);
                    }
                }
            }
            None => out.push(Interface {
                flags: flags.get(&ni.name).copied().unwrap_or_default(),
                name: ni.name,
                index: ni.index,
                addrs: addrs.collect(),
            }),
        }
    }
    Ok(out)
}

/// `IFF_UP` / `IFF_MULTICAST` per interface name, from `getifaddrs`.
#[cfg(unix)]
fn link_flags() -> HashMap<String, InterfaceFlags> {
    let mut out = HashMap::new();
    // SAFETY: the list returned by getifaddrs is walked read-only and freed once.
    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            debug!("getifaddrs failed: {}", std::io::Error::last_os_error());
            return out;
        }
        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            current = ifa.ifa_next;
            let Ok(name) = std::ffi::CStr::from_ptr(ifa.ifa_name).to_str() else {
                continue;
            };
            let bits = ifa.ifa_flags as libc::c_int;
            out.insert(
                name.to_string(),
                InterfaceFlags {
                    up: bits & libc::IFF_UP != 0,
                    multicast: bits & libc::IFF_MULTICAST != 0,
                },
            );
        }
        libc::freeifaddrs(ifaddrs);
    }
    out
}

// No link flags here; every reported interface counts as up and multicast-capable.
#[cfg(not(unix))]
fn link_flags() -> HashMap<String, InterfaceFlags> {
    NetworkInterface::show()
        .map(|all| {
            all.into_iter()
                .map(|ni| {
                    let flags = InterfaceFlags {
                        up: true,
                        multicast: true,
                    };
                    (ni.name, flags)
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn interface_by_name(name: &str) -> Result<Interface, NetError> {
    interfaces()?
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| NetError::UnknownInterface(name.to_string()))
}

/// The first interface the OS reports.
pub fn default_interface() -> Result<Interface, NetError> {
    interfaces()?.into_iter().next().ok_or(NetError::NoInterfaces)
}

/// Allocate a unicast-prefix-based IPv6 group from the first active interface
/// address whose prefix qualifies. Returns the group and its interface.
pub fn discover_prefixed_address() -> Result<(Ipv6Addr, Interface), NetError> {
    prefixed_address_from(interfaces()?).ok_or(NetError::NoRoutableInterface)
}

fn prefixed_address_from(ifaces: Vec<Interface>) -> Option<(Ipv6Addr, Interface)> {
    for ifi in ifaces.into_iter().filter(Interface::is_active) {
        let found = ifi.addrs.iter().find_map(|a| {
            let prefix = a.prefix()?;
            match prefixed_v6(&prefix) {
                Ok(group) => Some(group),
                Err(e) => {
                    debug!(interface = %ifi.name, ip = %a.ip, "prefix not usable: {}", e);
                    None
                }
            }
        });
        if let Some(group) = found {
            return Some((group, ifi));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str, mask: &str) -> InterfaceAddr {
        InterfaceAddr {
            ip: ip.parse().unwrap(),
            netmask: Some(mask.parse().unwrap()),
        }
    }

    fn iface(name: &str, index: u32, addrs: Vec<InterfaceAddr>) -> Interface {
        Interface {
            name: name.to_string(),
            index,
            addrs,
            flags: InterfaceFlags {
                up: true,
                multicast: true,
            },
        }
    }

    #[test]
    fn loopback_and_empty_are_inactive() {
        let lo = iface("lo", 1, vec![addr("127.0.0.1", "255.0.0.0"), addr("::1", "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff")]);
        assert!(lo.is_loopback());
        assert!(!lo.is_active());
        assert!(!iface("dummy0", 7, vec![]).is_active());
        assert!(iface("eth0", 2, vec![addr("10.0.0.2", "255.255.255.0")]).is_active());
    }

    #[test]
    fn picks_first_global_prefix() {
        let ifaces = vec![
            iface("lo", 1, vec![addr("::1", "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff")]),
            iface(
                "eth0",
                2,
                vec![
                    addr("192.168.1.10", "255.255.255.0"),
                    addr("fe80::1", "ffff:ffff:ffff:ffff::"),
                    addr("2001:db8:1:2::10", "ffff:ffff:ffff:ffff::"),
                ],
            ),
            iface("eth1", 3, vec![addr("2001:db8:9:9::1", "ffff:ffff:ffff:ffff::")]),
        ];
        let (group, ifi) = prefixed_address_from(ifaces).unwrap();
        assert_eq!(ifi.name, "eth0");
        let o = group.octets();
        assert_eq!(&o[..4], &[0xffu8, 0x3e, 0x00, 64]);
        assert_eq!(&o[4..12], &[0x20u8, 0x01, 0x0d, 0xb8, 0, 1, 0, 2]);
    }

    #[test]
    fn down_or_non_multicast_interfaces_are_skipped() {
        let global = || vec![addr("2001:db8:1:2::10", "ffff:ffff:ffff:ffff::")];
        let mut down = iface("eth0", 2, global());
        down.flags.up = false;
        let mut no_mcast = iface("tun0", 3, global());
        no_mcast.flags.multicast = false;
        assert!(!down.is_active());
        assert!(!no_mcast.is_active());
        assert!(prefixed_address_from(vec![down.clone(), no_mcast.clone()]).is_none());

        let usable = iface("eth1", 4, vec![addr("2001:db8:7:7::1", "ffff:ffff:ffff:ffff::")]);
        let (_, ifi) = prefixed_address_from(vec![down, no_mcast, usable]).unwrap();
        assert_eq!(ifi.name, "eth1");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn loopback_reports_up() {
        let flags = link_flags();
        assert!(flags.get("lo").is_some_and(|f| f.up));
    }

    #[test]
    fn no_routable_prefix() {
        let ifaces = vec![
            iface("eth0", 2, vec![addr("fe80::1", "ffff:ffff:ffff:ffff::")]),
            iface("eth1", 3, vec![addr("2001:db8::1", "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff")]),
            iface(
                "eth2",
                4,
                vec![InterfaceAddr {
                    ip: "2001:db8::2".parse().unwrap(),
                    netmask: None,
                }],
            ),
        ];
        assert!(prefixed_address_from(ifaces).is_none());
    }

    #[test]
    fn ipv4_address_lookup() {
        let ifi = iface(
            "eth0",
            2,
            vec![addr("fe80::1", "ffff:ffff:ffff:ffff::"), addr("10.1.2.3", "255.0.0.0")],
        );
        assert_eq!(ifi.ipv4(), Some(Ipv4Addr::new(10, 1, 2, 3)));
    }
}
