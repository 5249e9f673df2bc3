//! Peer and session bookkeeping for a node.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use peercast_core::{PublicKey, SessionId, SessionKey};

/// Last declared address of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

/// What an upsert changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerUpdate {
    New,
    Moved,
    Refreshed,
}

/// Known peers, keyed by long-term public key.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PublicKey, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `addr` as the current address of `key`.
    pub fn upsert(&mut self, key: PublicKey, addr: SocketAddr, now: Instant) -> PeerUpdate {
        match self.peers.get_mut(&key) {
            Some(rec) => {
                rec.last_seen = now;
                if rec.addr == addr {
                    PeerUpdate::Refreshed
                } else {
                    rec.addr = addr;
                    PeerUpdate::Moved
                }
            }
            None => {
                self.peers.insert(key, PeerRecord { addr, last_seen: now });
                PeerUpdate::New
            }
        }
    }

    pub fn get(&self, key: &PublicKey) -> Option<&PeerRecord> {
        self.peers.get(key)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop peers not heard from within `timeout`. Returns the dropped keys.
    pub fn evict_stale(&mut self, now: Instant, timeout: Duration) -> Vec<PublicKey> {
        let stale: Vec<PublicKey> = self
            .peers
            .iter()
            .filter(|(_, rec)| now.saturating_duration_since(rec.last_seen) > timeout)
            .map(|(k, _)| *k)
            .collect();
        for k in &stale {
            self.peers.remove(k);
        }
        stale
    }
}

/// An established session.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: PublicKey,
    pub addr: SocketAddr,
    pub key: SessionKey,
    /// Encoded initiation we answered with, resent when the peer repeats itself.
    pub response: Option<Vec<u8>>,
    pub expires_at: Instant,
}

/// Established sessions, keyed by session ID. Entries expire `ttl` after last use.
#[derive(Debug)]
pub struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    ttl: Duration,
}

impl SessionTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            ttl,
        }
    }

    pub fn insert(
        &mut self,
        id: SessionId,
        peer: PublicKey,
        addr: SocketAddr,
        key: SessionKey,
        response: Option<Vec<u8>>,
        now: Instant,
    ) {
        self.sessions.insert(
            id,
            Session {
                peer,
                addr,
                key,
                response,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Look up a session and push its expiry out by one TTL.
    pub fn touch(&mut self, id: &SessionId, now: Instant) -> Option<&Session> {
        let ttl = self.ttl;
        let session = self.sessions.get_mut(id)?;
        session.expires_at = now + ttl;
        Some(session)
    }

    /// Most recently used session with `peer`.
    pub fn find_by_peer(&self, peer: &PublicKey) -> Option<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.peer == *peer)
            .max_by_key(|(_, s)| s.expires_at)
            .map(|(id, _)| *id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove sessions whose expiry has passed. Returns the removed IDs.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> PublicKey {
        PublicKey::from_bytes([b; 32])
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new("ff1e::1".parse().unwrap(), port)
    }

    #[test]
    fn upsert_reports_changes() {
        let now = Instant::now();
        let mut peers = PeerTable::new();
        assert_eq!(peers.upsert(key(1), addr(1024), now), PeerUpdate::New);
        assert_eq!(peers.upsert(key(1), addr(1024), now), PeerUpdate::Refreshed);
        assert_eq!(peers.upsert(key(1), addr(1025), now), PeerUpdate::Moved);
        assert_eq!(peers.get(&key(1)).unwrap().addr, addr(1025));
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn stale_peers_evicted() {
        let t0 = Instant::now();
        let mut peers = PeerTable::new();
        peers.upsert(key(1), addr(1), t0);
        peers.upsert(key(2), addr(2), t0 + Duration::from_secs(20));

        let gone = peers.evict_stale(t0 + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(gone, vec![key(1)]);
        assert!(peers.get(&key(1)).is_none());
        assert!(peers.get(&key(2)).is_some());
    }

    #[test]
    fn sessions_expire_unless_touched() {
        let t0 = Instant::now();
        let ttl = Duration::from_secs(600);
        let mut sessions = SessionTable::new(ttl);
        sessions.insert([1; 16], key(1), addr(1), SessionKey::from_bytes([9; 32]), None, t0);
        sessions.insert([2; 16], key(2), addr(2), SessionKey::from_bytes([8; 32]), None, t0);

        assert!(sessions.touch(&[2; 16], t0 + Duration::from_secs(300)).is_some());
        let gone = sessions.evict_expired(t0 + ttl);
        assert_eq!(gone, vec![[1u8; 16]]);
        assert!(sessions.contains(&[2; 16]));
        assert!(sessions.touch(&[1; 16], t0 + ttl).is_none());
    }
}
