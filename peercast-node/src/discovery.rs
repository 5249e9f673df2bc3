//! Drive a [`Node`] over a packet connection: periodic declarations, the
//! receive loop, group re-join and expiry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use peercast_core::{PublicKey, SessionId};
use peercast_net::{spawn_maintain_join, NetError, PacketConn};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::node::{Node, NodeError, OutboundAction};

/// Largest UDP payload.
const MAX_DATAGRAM: usize = 65_536;

/// Pause after a failed read before reading again.
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

pub type SharedNode = Arc<Mutex<Node>>;

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub declare_interval: Duration,
    pub rejoin_interval: Duration,
    pub tick_interval: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            declare_interval: Duration::from_secs(5),
            rejoin_interval: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SessionEstablished {
        session_id: SessionId,
        peer: PublicKey,
    },
    Delivered {
        session_id: SessionId,
        peer: PublicKey,
        plaintext: Vec<u8>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("no session after {0} attempts")]
    HandshakeTimeout(u32),
}

/// Run until `cancel` fires or the connection closes, then close the connection.
pub async fn run(
    conn: Arc<dyn PacketConn>,
    node: SharedNode,
    opts: DiscoveryOptions,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) -> Result<(), NetError> {
    let stop = cancel.child_token();
    let rejoin = spawn_maintain_join(conn.clone(), opts.rejoin_interval, stop.clone());
    let declare_task = tokio::spawn(declare_loop(
        conn.clone(),
        node.clone(),
        opts.declare_interval,
        stop.clone(),
    ));
    let tick_task = tokio::spawn(tick_loop(node.clone(), opts.tick_interval, stop.clone()));

    recv_loop(conn.clone(), node, events, stop.clone()).await;

    stop.cancel();
    let _ = tokio::join!(rejoin, declare_task, tick_task);
    conn.close()
}

async fn declare_loop(
    conn: Arc<dyn PacketConn>,
    node: SharedNode,
    every: Duration,
    stop: CancellationToken,
) {
    let group = conn.group();
    let declaration = node.lock().await.declaration(group);
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = conn.write_to(&declaration, group).await {
            warn!(%group, "declaration send failed: {}", e);
        }
    }
}

async fn tick_loop(node: SharedNode, every: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        node.lock().await.tick(Instant::now());
    }
}

async fn recv_loop(
    conn: Arc<dyn PacketConn>,
    node: SharedNode,
    events: mpsc::UnboundedSender<Event>,
    stop: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = tokio::select! {
            _ = stop.cancelled() => return,
            res = conn.read_from(&mut buf) => match res {
                Ok(r) => r,
                Err(NetError::Closed) => {
                    info!("connection closed");
                    return;
                }
                Err(NetError::Timeout) => continue,
                Err(e) => {
                    warn!("read failed: {}", e);
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(READ_RETRY_DELAY) => continue,
                    }
                }
            },
        };
        let result = node.lock().await.on_datagram(&buf[..n], from, Instant::now());
        match result {
            Ok(actions) => perform(conn.as_ref(), actions, &events).await,
            Err(e) => debug!(%from, "dropped datagram: {}", e),
        }
    }
}

/// Carry out node actions: send datagrams, report sessions and deliveries.
pub async fn perform(
    conn: &dyn PacketConn,
    actions: Vec<OutboundAction>,
    events: &mpsc::UnboundedSender<Event>,
) {
    for action in actions {
        let event = match action {
            OutboundAction::Send { to, bytes } => {
                if let Err(e) = conn.write_to(&bytes, to).await {
                    warn!(%to, "send failed: {}", e);
                }
                continue;
            }
            OutboundAction::SessionEstablished { session_id, peer } => {
                Event::SessionEstablished { session_id, peer }
            }
            OutboundAction::Deliver {
                session_id,
                peer,
                plaintext,
            } => Event::Delivered {
                session_id,
                peer,
                plaintext,
            },
        };
        let _ = events.send(event);
    }
}

/// Handshake with `peer`, resending the same initiation with a linearly
/// growing pause until the receive loop has established the session.
pub async fn connect(
    conn: &dyn PacketConn,
    node: &SharedNode,
    peer: &PublicKey,
    attempts: u32,
    delay: Duration,
) -> Result<SessionId, DiscoveryError> {
    let init = node.lock().await.initiate(peer, Instant::now())?;
    for attempt in 1..=attempts {
        conn.write_to(&init.bytes, init.to).await?;
        tokio::time::sleep(delay * attempt).await;
        if node.lock().await.sessions().contains(&init.session_id) {
            debug!(%peer, attempt, "handshake complete");
            return Ok(init.session_id);
        }
    }
    Err(DiscoveryError::HandshakeTimeout(attempts))
}

/// Seal and send one message on an established session.
pub async fn send(
    conn: &dyn PacketConn,
    node: &SharedNode,
    session_id: &SessionId,
    plaintext: &[u8],
) -> Result<(), DiscoveryError> {
    let action = node.lock().await.send(session_id, plaintext, Instant::now())?;
    if let OutboundAction::Send { to, bytes } = action {
        conn.write_to(&bytes, to).await?;
    }
    Ok(())
}
