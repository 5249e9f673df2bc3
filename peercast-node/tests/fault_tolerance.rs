//! Handshake and data exchange between two nodes over in-memory links that
//! lose or duplicate datagrams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peercast_core::{Identity, PublicKey};
use peercast_net::faulty::{FaultyConn, MemoryConn};
use peercast_net::PacketConn;
use peercast_node::discovery::{self, DiscoveryOptions, Event, SharedNode};
use peercast_node::{Node, NodeSettings};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Side {
    conn: Arc<dyn PacketConn>,
    node: SharedNode,
    key: PublicKey,
    events: mpsc::UnboundedReceiver<Event>,
    driver: JoinHandle<Result<(), peercast_net::NetError>>,
}

fn opts() -> DiscoveryOptions {
    DiscoveryOptions {
        // One declaration each, sent at start-up.
        declare_interval: Duration::from_secs(3600),
        rejoin_interval: Duration::from_secs(3600),
        tick_interval: Duration::from_secs(3600),
    }
}

fn start(conn: Arc<dyn PacketConn>, cancel: &CancellationToken) -> Side {
    let node = Node::new(Identity::generate().unwrap(), NodeSettings::default());
    let key = *node.public_key();
    let node: SharedNode = Arc::new(Mutex::new(node));
    let (tx, events) = mpsc::unbounded_channel();
    let driver = tokio::spawn(discovery::run(
        conn.clone(),
        node.clone(),
        opts(),
        tx,
        cancel.clone(),
    ));
    Side {
        conn,
        node,
        key,
        events,
        driver,
    }
}

/// Drops the 2nd, 4th, 6th ... write.
fn every_other_write_lost(conn: MemoryConn) -> FaultyConn<MemoryConn> {
    let writes = AtomicUsize::new(0);
    FaultyConn::new(conn).lose_write(move |_| writes.fetch_add(1, Ordering::SeqCst) % 2 == 1)
}

fn links() -> (MemoryConn, MemoryConn) {
    MemoryConn::pair(
        "[ff1e::5043:4153:54]:1024".parse().unwrap(),
        "[ff1e::5043:4153:54]:1025".parse().unwrap(),
    )
}

async fn wait_for_peer(side: &Side, peer: &PublicKey) {
    for _ in 0..100 {
        if side.node.lock().await.peers().get(peer).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("peer {} never declared", peer);
}

async fn next_delivery(events: &mut mpsc::UnboundedReceiver<Event>) -> Option<Vec<u8>> {
    loop {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Some(Event::Delivered { plaintext, .. })) => return Some(plaintext),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn handshake_survives_every_other_write_lost() {
    let cancel = CancellationToken::new();
    let (a, b) = links();
    let mut a = start(Arc::new(every_other_write_lost(a)), &cancel);
    let mut b = start(Arc::new(every_other_write_lost(b)), &cancel);
    wait_for_peer(&a, &b.key).await;
    wait_for_peer(&b, &a.key).await;

    let session_id = discovery::connect(
        a.conn.as_ref(),
        &a.node,
        &b.key,
        6,
        Duration::from_millis(20),
    )
    .await
    .expect("handshake within bounded attempts");
    assert_eq!(b.node.lock().await.session_with(&a.key), Some(session_id));

    let mut delivered = None;
    for _ in 0..4 {
        discovery::send(a.conn.as_ref(), &a.node, &session_id, b"over a lossy link")
            .await
            .unwrap();
        delivered = next_delivery(&mut b.events).await;
        if delivered.is_some() {
            break;
        }
    }
    assert_eq!(delivered.as_deref(), Some(&b"over a lossy link"[..]));

    discovery::send(b.conn.as_ref(), &b.node, &session_id, b"reply")
        .await
        .unwrap();
    discovery::send(b.conn.as_ref(), &b.node, &session_id, b"reply")
        .await
        .unwrap();
    assert_eq!(next_delivery(&mut a.events).await.as_deref(), Some(&b"reply"[..]));

    cancel.cancel();
    a.driver.await.unwrap().unwrap();
    b.driver.await.unwrap().unwrap();
}

#[tokio::test]
async fn duplicated_datagrams_leave_one_session() {
    let cancel = CancellationToken::new();
    let (a, b) = links();
    let a_conn = FaultyConn::new(a).double_write(|_| true).double_read(|_| true);
    let b_conn = FaultyConn::new(b).double_write(|_| true).double_read(|_| true);
    let mut a = start(Arc::new(a_conn), &cancel);
    let mut b = start(Arc::new(b_conn), &cancel);
    wait_for_peer(&a, &b.key).await;
    wait_for_peer(&b, &a.key).await;

    let session_id = discovery::connect(
        a.conn.as_ref(),
        &a.node,
        &b.key,
        3,
        Duration::from_millis(20),
    )
    .await
    .unwrap();
    // Let every duplicate drain.
    tokio::time::sleep(Duration::from_millis(100)).await;

    {
        let a_node = a.node.lock().await;
        let b_node = b.node.lock().await;
        assert_eq!(a_node.sessions().len(), 1);
        assert_eq!(b_node.sessions().len(), 1);
        assert_eq!(
            a_node.sessions().get(&session_id).unwrap().key,
            b_node.sessions().get(&session_id).unwrap().key
        );
        assert!(!a_node.is_pending(&session_id));
    }

    let mut established = 0;
    while let Ok(event) = a.events.try_recv() {
        if matches!(event, Event::SessionEstablished { .. }) {
            established += 1;
        }
    }
    assert_eq!(established, 1);

    discovery::send(a.conn.as_ref(), &a.node, &session_id, b"once")
        .await
        .unwrap();
    assert_eq!(next_delivery(&mut b.events).await.as_deref(), Some(&b"once"[..]));
    // Duplicates decrypt to the same plaintext.
    assert_eq!(next_delivery(&mut b.events).await.as_deref(), Some(&b"once"[..]));

    cancel.cancel();
    a.driver.await.unwrap().unwrap();
    b.driver.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_peer_cannot_connect() {
    let cancel = CancellationToken::new();
    let (a, _b) = links();
    let a = start(Arc::new(a), &cancel);
    let stranger = *Identity::generate().unwrap().public_key();
    let res = discovery::connect(a.conn.as_ref(), &a.node, &stranger, 1, Duration::from_millis(1)).await;
    assert!(matches!(
        res,
        Err(discovery::DiscoveryError::Node(peercast_node::NodeError::UnknownPeer(_)))
    ));
    cancel.cancel();
    a.driver.await.unwrap().unwrap();
}
