// peercast node: declare on a multicast group, answer handshakes, print what peers send.
// Lines on stdin of the form `<peer public key hex> <message>` are sent to that peer.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use peercast_core::PublicKey;
use peercast_net::{discover_prefixed_address, interface_by_name, PacketConn};
use peercast_node::discovery::{self, DiscoveryOptions, Event, SharedNode};
use peercast_node::{config, Config, Node};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_DELAY: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("peercast-node {}", VERSION);
                return Ok(());
            }
            "--config" => match args.next() {
                Some(p) => config_path = Some(PathBuf::from(p)),
                None => bail!("--config needs a path"),
            },
            other => bail!("unknown argument {:?}", other),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load(config_path.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let identity = cfg.identity()?;
    let settings = cfg.node_settings()?;
    info!(public_key = %identity.public_key(), "identity ready");

    let (group, ifi) = if cfg.prefixed_group {
        let (group, ifi) = discover_prefixed_address().context("prefixed group discovery")?;
        (IpAddr::V6(group), Some(ifi))
    } else {
        let ifi = cfg.interface.as_deref().map(interface_by_name).transpose()?;
        (cfg.group, ifi)
    };
    let conn = peercast_net::open(ifi, group, cfg.port)
        .await
        .with_context(|| format!("opening {} port {}", group, cfg.port))?;

    let node: SharedNode = Arc::new(Mutex::new(Node::new(identity, settings)));
    let opts = DiscoveryOptions {
        declare_interval: cfg.declare_interval(),
        rejoin_interval: cfg.rejoin_interval(),
        ..DiscoveryOptions::default()
    };
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let driver = tokio::spawn(discovery::run(
        conn.clone(),
        node.clone(),
        opts,
        events_tx,
        cancel.clone(),
    ));
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                Event::SessionEstablished { session_id, peer } => {
                    info!(%peer, session = %hex::encode(session_id), "session up")
                }
                Event::Delivered { peer, plaintext, .. } => {
                    println!("{}: {}", peer, String::from_utf8_lossy(&plaintext))
                }
            }
        }
    });
    tokio::spawn(stdin_loop(conn, node));

    shutdown_signal().await?;
    info!("shutting down");
    cancel.cancel();
    driver.await??;
    Ok(())
}

async fn stdin_loop(conn: Arc<dyn PacketConn>, node: SharedNode) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some((key, text)) = line.trim().split_once(' ') else {
            warn!("expected `<peer key hex> <message>`");
            continue;
        };
        let peer = match parse_key(key) {
            Some(k) => k,
            None => {
                warn!(key, "not a public key");
                continue;
            }
        };
        if let Err(e) = send_line(conn.as_ref(), &node, &peer, text.as_bytes()).await {
            warn!(%peer, "send failed: {}", e);
        }
    }
}

async fn send_line(
    conn: &dyn PacketConn,
    node: &SharedNode,
    peer: &PublicKey,
    text: &[u8],
) -> Result<(), discovery::DiscoveryError> {
    let existing = node.lock().await.session_with(peer);
    let session_id = match existing {
        Some(id) => id,
        None => discovery::connect(conn, node, peer, CONNECT_ATTEMPTS, CONNECT_DELAY).await?,
    };
    discovery::send(conn, node, &session_id, text).await
}

fn parse_key(s: &str) -> Option<PublicKey> {
    let bytes: [u8; 32] = hex::decode(s).ok()?.try_into().ok()?;
    Some(PublicKey::from_bytes(bytes))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
