//! Periodic group re-join. Routers and switches age out memberships that are
//! not refreshed, so long-lived connections re-join on a fixed cadence.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::conn::PacketConn;
use crate::error::NetError;

/// Re-join once per `cadence` until `cancel` fires or the connection closes.
/// Join failures are logged and retried on the next tick.
pub async fn maintain_join(
    conn: Arc<dyn PacketConn>,
    cadence: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(cadence) => {}
        }
        match conn.join() {
            Ok(()) => {}
            Err(NetError::Closed) => {
                debug!(group = %conn.group(), "connection closed, stopping re-join");
                return;
            }
            Err(e) => warn!(group = %conn.group(), "re-join failed: {}", e),
        }
    }
}

pub fn spawn_maintain_join(
    conn: Arc<dyn PacketConn>,
    cadence: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(maintain_join(conn, cadence, cancel))
}
