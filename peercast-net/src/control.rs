//! Per-datagram control-message templates (ancillary data for `sendmsg`).
//!
//! Built once per connection. Only Linux and Android get real templates;
//! elsewhere the template is empty and the sticky socket options set at
//! open time carry the same settings.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use std::mem;
    use std::ptr;

    /// Append-only buffer of `cmsghdr` records laid out per `CMSG_*`.
    struct ControlBuf(Vec<u8>);

    impl ControlBuf {
        fn new() -> Self {
            ControlBuf(Vec::new())
        }

        fn push<T: Copy>(&mut self, level: libc::c_int, ty: libc::c_int, value: T) {
            let data_len = mem::size_of::<T>() as libc::c_uint;
            // SAFETY: CMSG_SPACE/CMSG_LEN are pure size computations.
            let (space, len, offset) = unsafe {
                (
                    libc::CMSG_SPACE(data_len) as usize,
                    libc::CMSG_LEN(data_len) as usize,
                    libc::CMSG_LEN(0) as usize,
                )
            };
            let start = self.0.len();
            self.0.resize(start + space, 0);
            let record = &mut self.0[start..];

            // SAFETY: `record` holds `space` zeroed bytes, enough for the header
            // and the payload at CMSG_LEN(0). Writes are unaligned-safe.
            unsafe {
                let mut hdr: libc::cmsghdr = mem::zeroed();
                hdr.cmsg_len = len as _;
                hdr.cmsg_level = level;
                hdr.cmsg_type = ty;
                ptr::write_unaligned(record.as_mut_ptr() as *mut libc::cmsghdr, hdr);
                ptr::write_unaligned(record.as_mut_ptr().add(offset) as *mut T, value);
            }
        }
    }

    /// IPv4: outbound interface index and TTL.
    pub(crate) fn ipv4_template(ifindex: u32, ttl: u8) -> Vec<u8> {
        let mut buf = ControlBuf::new();
        // SAFETY: in_pktinfo is plain old data; all-zero is a valid value.
        let mut info: libc::in_pktinfo = unsafe { mem::zeroed() };
        info.ipi_ifindex = ifindex as _;
        buf.push(libc::IPPROTO_IP, libc::IP_PKTINFO, info);
        buf.push(libc::IPPROTO_IP, libc::IP_TTL, ttl as libc::c_int);
        buf.0
    }

    /// IPv6: outbound interface index, hop limit and traffic class.
    pub(crate) fn ipv6_template(ifindex: u32, hop_limit: u8, traffic_class: u8) -> Vec<u8> {
        let mut buf = ControlBuf::new();
        // SAFETY: in6_pktinfo is plain old data; all-zero is a valid value.
        let mut info: libc::in6_pktinfo = unsafe { mem::zeroed() };
        info.ipi6_ifindex = ifindex as _;
        buf.push(libc::IPPROTO_IPV6, libc::IPV6_PKTINFO, info);
        buf.push(libc::IPPROTO_IPV6, libc::IPV6_HOPLIMIT, hop_limit as libc::c_int);
        buf.push(libc::IPPROTO_IPV6, libc::IPV6_TCLASS, traffic_class as libc::c_int);
        buf.0
    }

}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod imp {
    pub(crate) fn ipv4_template(_ifindex: u32, _ttl: u8) -> Vec<u8> {
        Vec::new()
    }

    pub(crate) fn ipv6_template(_ifindex: u32, _hop_limit: u8, _traffic_class: u8) -> Vec<u8> {
        Vec::new()
    }
}

pub(crate) use imp::{ipv4_template, ipv6_template};
