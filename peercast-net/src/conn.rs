//! Multicast packet connection: one interface over IPv4 and IPv6 group sockets.
//!
//! `open` picks the family from the group address. Both families share
//! [`MulticastConn`]; the per-family socket calls live behind [`IpFamily`].

use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::control;
use crate::error::NetError;
use crate::interface::{default_interface, Interface};

/// TTL / hop limit on every datagram. Receivers can treat anything lower as off-link.
pub const HOP_LIMIT: u8 = 255;

/// IPv6 traffic class on every datagram.
pub const IPV6_TRAFFIC_CLASS: u8 = 0xe0;

/// Datagram connection bound to one multicast group on one interface.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Send one datagram. No retry.
    async fn write_to(&self, buf: &[u8], dst: SocketAddr) -> Result<usize, NetError>;

    /// Receive one datagram into `buf`. Longer datagrams are truncated.
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NetError>;

    /// Join the group again. Already being a member is success.
    fn join(&self) -> Result<(), NetError>;

    /// Leave the group and release the socket. Pending reads fail with `Closed`.
    fn close(&self) -> Result<(), NetError>;

    /// Group address and port this connection is bound to.
    fn group(&self) -> SocketAddr;

    fn interface(&self) -> &Interface;

    /// Deadline for pending and future reads; `None` blocks indefinitely.
    fn set_read_deadline(&self, deadline: Option<Instant>);
}

/// Open a connection on `group`:`port`, on `ifi` or the first reported interface.
/// Must be called from within a Tokio runtime.
pub async fn open(
    ifi: Option<Interface>,
    group: IpAddr,
    port: u16,
) -> Result<Arc<dyn PacketConn>, NetError> {
    if !group.is_multicast() {
        return Err(NetError::NotMulticast(group));
    }
    let ifi = match ifi {
        Some(ifi) => ifi,
        None => default_interface()?,
    };
    Ok(match group {
        IpAddr::V4(g) => Arc::new(Ipv4Conn::open(ifi, g, port)?),
        IpAddr::V6(g) => Arc::new(Ipv6Conn::open(ifi, g, port)?),
    })
}

/// Read deadline and close signal shared by every read on one connection.
pub(crate) struct ReadControl {
    deadline: watch::Sender<Option<Instant>>,
    closed: CancellationToken,
}

impl ReadControl {
    pub(crate) fn new() -> Self {
        Self {
            deadline: watch::Sender::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn set_deadline(&self, deadline: Option<Instant>) {
        self.deadline.send_replace(deadline);
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Drive `read` until it completes, the connection closes or the current
    /// deadline passes. A deadline set while waiting replaces the old one.
    pub(crate) async fn guard<T>(
        &self,
        read: impl Future<Output = Result<T, NetError>>,
    ) -> Result<T, NetError> {
        tokio::pin!(read);
        let mut deadline = self.deadline.subscribe();
        loop {
            let at = *deadline.borrow_and_update();
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(NetError::Closed),
                res = &mut read => return res,
                _ = expire(at) => return Err(NetError::Timeout),
                Ok(()) = deadline.changed() => {}
            }
        }
    }
}

async fn expire(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Family-specific socket calls.
pub trait IpFamily: Send + Sync + 'static {
    type Ip: Copy + Into<IpAddr> + Send + Sync + 'static;

    const DOMAIN: Domain;

    fn bind_addr(port: u16) -> SocketAddr;
    fn group_addr(group: Self::Ip, port: u16) -> SocketAddr;
    /// Options that must be set before binding.
    fn prepare(socket: &Socket) -> io::Result<()>;
    /// Hop limits and outbound interface.
    fn configure(socket: &Socket, ifi: &Interface) -> io::Result<()>;
    fn join(socket: SockRef<'_>, group: &Self::Ip, ifi: &Interface) -> io::Result<()>;
    fn leave(socket: SockRef<'_>, group: &Self::Ip, ifi: &Interface) -> io::Result<()>;
    fn control(ifi: &Interface) -> Vec<u8>;
}

pub struct V4;
pub struct V6;

pub type Ipv4Conn = MulticastConn<V4>;
pub type Ipv6Conn = MulticastConn<V6>;

impl IpFamily for V4 {
    type Ip = Ipv4Addr;

    const DOMAIN: Domain = Domain::IPV4;

    fn bind_addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
    }

    fn group_addr(group: Ipv4Addr, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(group, port))
    }

    fn prepare(_socket: &Socket) -> io::Result<()> {
        Ok(())
    }

    fn configure(socket: &Socket, ifi: &Interface) -> io::Result<()> {
        socket.set_ttl(HOP_LIMIT as u32)?;
        socket.set_multicast_ttl_v4(HOP_LIMIT as u32)?;
        if let Some(local) = ifi.ipv4() {
            socket.set_multicast_if_v4(&local)?;
        }
        Ok(())
    }

    fn join(socket: SockRef<'_>, group: &Ipv4Addr, ifi: &Interface) -> io::Result<()> {
        socket.join_multicast_v4_n(group, &v4_membership(ifi))
    }

    fn leave(socket: SockRef<'_>, group: &Ipv4Addr, ifi: &Interface) -> io::Result<()> {
        socket.leave_multicast_v4_n(group, &v4_membership(ifi))
    }

    fn control(ifi: &Interface) -> Vec<u8> {
        control::ipv4_template(ifi.index, HOP_LIMIT)
    }
}

fn v4_membership(ifi: &Interface) -> socket2::InterfaceIndexOrAddress {
    socket2::InterfaceIndexOrAddress::Index(ifi.index)
}

impl IpFamily for V6 {
    type Ip = Ipv6Addr;

    const DOMAIN: Domain = Domain::IPV6;

    fn bind_addr(port: u16) -> SocketAddr {
        SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0))
    }

    fn group_addr(group: Ipv6Addr, port: u16) -> SocketAddr {
        SocketAddr::V6(SocketAddrV6::new(group, port, 0, 0))
    }

    fn prepare(socket: &Socket) -> io::Result<()> {
        socket.set_only_v6(true)
    }

    fn configure(socket: &Socket, ifi: &Interface) -> io::Result<()> {
        socket.set_unicast_hops_v6(HOP_LIMIT as u32)?;
        socket.set_multicast_hops_v6(HOP_LIMIT as u32)?;
        socket.set_multicast_if_v6(ifi.index)
    }

    fn join(socket: SockRef<'_>, group: &Ipv6Addr, ifi: &Interface) -> io::Result<()> {
        socket.join_multicast_v6(group, ifi.index)
    }

    fn leave(socket: SockRef<'_>, group: &Ipv6Addr, ifi: &Interface) -> io::Result<()> {
        socket.leave_multicast_v6(group, ifi.index)
    }

    fn control(ifi: &Interface) -> Vec<u8> {
        control::ipv6_template(ifi.index, HOP_LIMIT, IPV6_TRAFFIC_CLASS)
    }
}

/// Multicast connection for one address family.
pub struct MulticastConn<F: IpFamily> {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    ifi: Interface,
    group: F::Ip,
    port: u16,
    control: Vec<u8>,
    reads: ReadControl,
    _family: PhantomData<F>,
}

impl<F: IpFamily> MulticastConn<F> {
    /// Bind a wildcard socket on `port`, join `group` on `ifi` and pin the
    /// outbound interface. Any failure drops the socket.
    pub fn open(ifi: Interface, group: F::Ip, port: u16) -> Result<Self, NetError> {
        let socket = Socket::new(F::DOMAIN, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        F::prepare(&socket)?;
        socket.bind(&F::bind_addr(port).into())?;
        already_member_ok(F::join(SockRef::from(&socket), &group, &ifi))?;
        F::configure(&socket, &ifi)?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;

        let group_ip: IpAddr = group.into();
        info!(
            group = %group_ip,
            port,
            interface = %ifi.name,
            "joined multicast group"
        );
        Ok(Self {
            socket: RwLock::new(Some(Arc::new(socket))),
            control: F::control(&ifi),
            ifi,
            group,
            port,
            reads: ReadControl::new(),
            _family: PhantomData,
        })
    }

    fn group_ip(&self) -> IpAddr {
        self.group.into()
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, NetError> {
        self.socket.read().clone().ok_or(NetError::Closed)
    }
}

#[async_trait]
impl<F: IpFamily> PacketConn for MulticastConn<F> {
    async fn write_to(&self, buf: &[u8], dst: SocketAddr) -> Result<usize, NetError> {
        let socket = self.socket()?;
        Ok(send(&socket, buf, dst, &self.control).await?)
    }

    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NetError> {
        let socket = self.socket()?;
        self.reads
            .guard(async { socket.recv_from(buf).await.map_err(NetError::from) })
            .await
    }

    fn join(&self) -> Result<(), NetError> {
        let socket = self.socket()?;
        already_member_ok(F::join(SockRef::from(&*socket), &self.group, &self.ifi))?;
        debug!(group = %self.group_ip(), interface = %self.ifi.name, "re-joined");
        Ok(())
    }

    fn close(&self) -> Result<(), NetError> {
        let Some(socket) = self.socket.write().take() else {
            return Ok(());
        };
        let left = F::leave(SockRef::from(&*socket), &self.group, &self.ifi);
        // Wakes pending reads so they drop their handles and the descriptor is released.
        self.reads.close();
        drop(socket);
        info!(group = %self.group_ip(), "connection closed");
        Ok(left?)
    }

    fn group(&self) -> SocketAddr {
        F::group_addr(self.group, self.port)
    }

    fn interface(&self) -> &Interface {
        &self.ifi
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.reads.set_deadline(deadline);
    }
}

fn already_member_ok(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(()),
        other => other,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
async fn send(socket: &UdpSocket, buf: &[u8], dst: SocketAddr, control: &[u8]) -> io::Result<usize> {
    use socket2::{MsgHdr, SockAddr};
    use std::io::IoSlice;
    use tokio::io::Interest;

    let addr = SockAddr::from(dst);
    socket
        .async_io(Interest::WRITABLE, || {
            let bufs = [IoSlice::new(buf)];
            let msg = MsgHdr::new()
                .with_addr(&addr)
                .with_buffers(&bufs)
                .with_control(control);
            SockRef::from(socket).sendmsg(&msg, 0)
        })
        .await
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
async fn send(socket: &UdpSocket, buf: &[u8], dst: SocketAddr, _control: &[u8]) -> io::Result<usize> {
    socket.send_to(buf, dst).await
}
