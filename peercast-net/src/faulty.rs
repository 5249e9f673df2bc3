//! Test transports: an in-memory connection pair and a fault-injecting decorator.
//!
//! Compiled for this crate's tests and for dependents that enable the
//! `fault-injection` feature.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::conn::{PacketConn, ReadControl};
use crate::error::NetError;
use crate::interface::{Interface, InterfaceFlags};

type Datagram = (Vec<u8>, SocketAddr);

/// One end of an in-memory datagram link. Every write is delivered to the
/// other end regardless of destination address.
pub struct MemoryConn {
    local: SocketAddr,
    ifi: Interface,
    tx: mpsc::UnboundedSender<Datagram>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    reads: ReadControl,
    joins: AtomicUsize,
    fail_joins: AtomicBool,
}

impl MemoryConn {
    /// Two connected ends with local addresses `a` and `b`.
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        (Self::new(a, tx_a, rx_a), Self::new(b, tx_b, rx_b))
    }

    fn new(
        local: SocketAddr,
        tx: mpsc::UnboundedSender<Datagram>,
        rx: mpsc::UnboundedReceiver<Datagram>,
    ) -> Self {
        Self {
            local,
            ifi: Interface {
                name: "mem0".to_string(),
                index: 0,
                addrs: Vec::new(),
                flags: InterfaceFlags {
                    up: true,
                    multicast: true,
                },
            },
            tx,
            rx: tokio::sync::Mutex::new(rx),
            reads: ReadControl::new(),
            joins: AtomicUsize::new(0),
            fail_joins: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Number of `join` calls so far, failed ones included.
    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    /// Make subsequent joins fail with an I/O error.
    pub fn fail_joins(&self, fail: bool) {
        self.fail_joins.store(fail, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<(), NetError> {
        if self.reads.is_closed() {
            return Err(NetError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PacketConn for MemoryConn {
    async fn write_to(&self, buf: &[u8], _dst: SocketAddr) -> Result<usize, NetError> {
        self.check_open()?;
        // A vanished peer looks like loss, not an error.
        let _ = self.tx.send((buf.to_vec(), self.local));
        Ok(buf.len())
    }

    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NetError> {
        self.check_open()?;
        let (data, from) = self
            .reads
            .guard(async {
                let mut rx = self.rx.lock().await;
                rx.recv().await.ok_or(NetError::Closed)
            })
            .await?;
        Ok((copy_truncated(&data, buf), from))
    }

    fn join(&self) -> Result<(), NetError> {
        self.check_open()?;
        self.joins.fetch_add(1, Ordering::SeqCst);
        if self.fail_joins.load(Ordering::SeqCst) {
            return Err(NetError::Io(std::io::Error::from(
                std::io::ErrorKind::AddrNotAvailable,
            )));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), NetError> {
        self.reads.close();
        Ok(())
    }

    fn group(&self) -> SocketAddr {
        self.local
    }

    fn interface(&self) -> &Interface {
        &self.ifi
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.reads.set_deadline(deadline);
    }
}

/// Predicate over a datagram's bytes.
pub type Fault = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Decorator that drops or duplicates datagrams matching its predicates.
///
/// A duplicated read is held in a single-slot buffer and returned by the next
/// `read_from`; while the slot is full further duplicates are not stored.
pub struct FaultyConn<C> {
    inner: C,
    lose_write: Option<Fault>,
    lose_read: Option<Fault>,
    double_write: Option<Fault>,
    double_read: Option<Fault>,
    pending: Mutex<Option<Datagram>>,
}

impl<C: PacketConn> FaultyConn<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            lose_write: None,
            lose_read: None,
            double_write: None,
            double_read: None,
            pending: Mutex::new(None),
        }
    }

    /// Silently drop writes matching `f`.
    pub fn lose_write(mut self, f: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.lose_write = Some(Box::new(f));
        self
    }

    /// Discard reads matching `f` and wait for the next datagram.
    pub fn lose_read(mut self, f: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.lose_read = Some(Box::new(f));
        self
    }

    /// Send writes matching `f` twice.
    pub fn double_write(mut self, f: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.double_write = Some(Box::new(f));
        self
    }

    /// Deliver reads matching `f` twice.
    pub fn double_read(mut self, f: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.double_read = Some(Box::new(f));
        self
    }
}

fn hits(fault: &Option<Fault>, data: &[u8]) -> bool {
    fault.as_ref().is_some_and(|f| f(data))
}

fn copy_truncated(data: &[u8], buf: &mut [u8]) -> usize {
    let n = data.len().min(buf.len());
    buf[..n].copy_from_slice(&data[..n]);
    n
}

#[async_trait]
impl<C: PacketConn> PacketConn for FaultyConn<C> {
    async fn write_to(&self, buf: &[u8], dst: SocketAddr) -> Result<usize, NetError> {
        if hits(&self.lose_write, buf) {
            return Ok(buf.len());
        }
        if hits(&self.double_write, buf) {
            self.inner.write_to(buf, dst).await?;
        }
        self.inner.write_to(buf, dst).await
    }

    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NetError> {
        let pending = self.pending.lock().take();
        if let Some((data, from)) = pending {
            return Ok((copy_truncated(&data, buf), from));
        }
        loop {
            let mut scratch = vec![0u8; buf.len()];
            let (n, from) = self.inner.read_from(&mut scratch).await?;
            scratch.truncate(n);
            if hits(&self.lose_read, &scratch) {
                continue;
            }
            if hits(&self.double_read, &scratch) {
                let mut slot = self.pending.lock();
                if slot.is_none() {
                    *slot = Some((scratch.clone(), from));
                }
            }
            return Ok((copy_truncated(&scratch, buf), from));
        }
    }

    fn join(&self) -> Result<(), NetError> {
        self.inner.join()
    }

    fn close(&self) -> Result<(), NetError> {
        self.inner.close()
    }

    fn group(&self) -> SocketAddr {
        self.inner.group()
    }

    fn interface(&self) -> &Interface {
        self.inner.interface()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.set_read_deadline(deadline)
    }
}
