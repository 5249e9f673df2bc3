//! Host-driven node: the host passes datagrams and clock readings in, the
//! node returns actions (datagrams to send, sessions, delivered plaintext).
//! No I/O happens here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use peercast_core::identity::NONCE_LEN;
use peercast_core::{
    AddressDeclaration, CryptoError, DecodeError, EphemeralSecret, Identity, KeyDerivation,
    Message, PublicKey, SessionData, SessionId, SessionInitiation,
};
use tracing::{debug, info};

use crate::peers::{PeerTable, PeerUpdate, SessionTable};

/// Nonces of recently sent data, used to drop our own datagrams looped back by the group.
const SENT_NONCE_MEMORY: usize = 256;

/// Default session lifetime after last use.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(600);

/// Default time a peer stays known without a fresh declaration.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub derivation: KeyDerivation,
    pub session_ttl: Duration,
    pub peer_timeout: Duration,
    /// Peers whose declarations and initiations are accepted. Empty accepts any.
    pub allowed_peers: HashSet<PublicKey>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            derivation: KeyDerivation::Raw,
            session_ttl: DEFAULT_SESSION_TTL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            allowed_peers: HashSet::new(),
        }
    }
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    Send { to: SocketAddr, bytes: Vec<u8> },
    SessionEstablished { session_id: SessionId, peer: PublicKey },
    Deliver {
        session_id: SessionId,
        peer: PublicKey,
        plaintext: Vec<u8>,
    },
}

/// Encoded initiation and where to send it.
#[derive(Debug, Clone)]
pub struct Initiation {
    pub session_id: SessionId,
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Initiation we sent and are waiting on.
struct Pending {
    peer: PublicKey,
    addr: SocketAddr,
    secret: EphemeralSecret,
    started: Instant,
}

pub struct Node {
    identity: Identity,
    settings: NodeSettings,
    peers: PeerTable,
    sessions: SessionTable,
    pending: HashMap<SessionId, Pending>,
    sent_nonces: VecDeque<[u8; NONCE_LEN]>,
}

impl Node {
    pub fn new(identity: Identity, settings: NodeSettings) -> Self {
        Self {
            identity,
            sessions: SessionTable::new(settings.session_ttl),
            settings,
            peers: PeerTable::new(),
            pending: HashMap::new(),
            sent_nonces: VecDeque::with_capacity(SENT_NONCE_MEMORY),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn is_pending(&self, session_id: &SessionId) -> bool {
        self.pending.contains_key(session_id)
    }

    /// Encoded declaration of `addr` as this node's address.
    pub fn declaration(&self, addr: SocketAddr) -> Vec<u8> {
        AddressDeclaration::new(addr, &self.identity).to_bytes()
    }

    /// Start a handshake with a known peer. The returned datagram may be resent
    /// as-is until the session is established; the peer answers repeats with
    /// the same response.
    pub fn initiate(&mut self, peer: &PublicKey, now: Instant) -> Result<Initiation, NodeError> {
        let addr = self
            .peers
            .get(peer)
            .map(|rec| rec.addr)
            .ok_or(NodeError::UnknownPeer(*peer))?;
        let (init, secret) = SessionInitiation::new(&self.identity, peer, None)?;
        let session_id = init.session_id;
        self.pending.insert(
            session_id,
            Pending {
                peer: *peer,
                addr,
                secret,
                started: now,
            },
        );
        debug!(peer = %peer, session = %hex::encode(session_id), "initiating session");
        Ok(Initiation {
            session_id,
            to: addr,
            bytes: init.to_bytes(),
        })
    }

    /// Established session with `peer`, if any.
    pub fn session_with(&self, peer: &PublicKey) -> Option<SessionId> {
        self.sessions.find_by_peer(peer)
    }

    /// Seal `plaintext` for an established session.
    pub fn send(
        &mut self,
        session_id: &SessionId,
        plaintext: &[u8],
        now: Instant,
    ) -> Result<OutboundAction, NodeError> {
        let session = self
            .sessions
            .touch(session_id, now)
            .ok_or(NodeError::UnknownSession(*session_id))?;
        let data = SessionData::seal(&session.key, *session_id, plaintext)?;
        let to = session.addr;
        self.remember_nonce(data.nonce);
        Ok(OutboundAction::Send {
            to,
            bytes: data.to_bytes(),
        })
    }

    /// Process one received datagram. Errors describe why it was dropped;
    /// none of them leave the node in a different state.
    pub fn on_datagram(
        &mut self,
        bytes: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<Vec<OutboundAction>, NodeError> {
        match Message::parse(bytes)? {
            Message::AddressDeclaration(decl) => self.on_declaration(decl, from, now),
            Message::SessionInitiation(init) => self.on_initiation(init, now),
            Message::SessionData(data) => self.on_data(data, now),
        }
    }

    /// Expire idle sessions, stale peers and unanswered initiations.
    pub fn tick(&mut self, now: Instant) {
        for id in self.sessions.evict_expired(now) {
            debug!(session = %hex::encode(id), "session expired");
        }
        for key in self.peers.evict_stale(now, self.settings.peer_timeout) {
            debug!(peer = %key, "peer timed out");
        }
        let ttl = self.settings.session_ttl;
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.started) < ttl);
    }

    fn allowed(&self, key: &PublicKey) -> bool {
        self.settings.allowed_peers.is_empty() || self.settings.allowed_peers.contains(key)
    }

    fn remember_nonce(&mut self, nonce: [u8; NONCE_LEN]) {
        if self.sent_nonces.len() == SENT_NONCE_MEMORY {
            self.sent_nonces.pop_front();
        }
        self.sent_nonces.push_back(nonce);
    }

    fn on_declaration(
        &mut self,
        decl: AddressDeclaration,
        from: SocketAddr,
        now: Instant,
    ) -> Result<Vec<OutboundAction>, NodeError> {
        if decl.src == *self.public_key() {
            return Ok(Vec::new());
        }
        if !decl.validate() {
            return Err(NodeError::BadSignature);
        }
        if !self.allowed(&decl.src) {
            return Err(NodeError::NotAllowed(decl.src));
        }
        let addr = decl.socket_addr();
        match self.peers.upsert(decl.src, addr, now) {
            PeerUpdate::New => info!(peer = %decl.src, %addr, %from, "peer registered"),
            PeerUpdate::Moved => info!(peer = %decl.src, %addr, "peer moved"),
            PeerUpdate::Refreshed => {}
        }
        Ok(Vec::new())
    }

    fn on_initiation(
        &mut self,
        init: SessionInitiation,
        now: Instant,
    ) -> Result<Vec<OutboundAction>, NodeError> {
        let me = *self.public_key();
        if init.dst != me {
            return Err(NodeError::NotForUs);
        }
        if !init.validate_for(&me, None) {
            return Err(NodeError::BadSignature);
        }
        if !self.allowed(&init.src) {
            return Err(NodeError::NotAllowed(init.src));
        }
        let id = init.session_id;

        // Reply to one of ours.
        if let Some(pending) = self.pending.get(&id) {
            if pending.peer != init.src {
                return Err(NodeError::SessionConflict(id));
            }
            let key = pending
                .secret
                .complete(&init.dh_public, self.settings.derivation)?;
            let addr = pending.addr;
            self.pending.remove(&id);
            self.sessions.insert(id, init.src, addr, key, None, now);
            info!(peer = %init.src, session = %hex::encode(id), "session established");
            return Ok(vec![OutboundAction::SessionEstablished {
                session_id: id,
                peer: init.src,
            }]);
        }

        // Repeat of an initiation we already answered, or of a reply we already used.
        if let Some(session) = self.sessions.get(&id) {
            if session.peer != init.src {
                return Err(NodeError::SessionConflict(id));
            }
            let resend = session.response.clone().map(|bytes| OutboundAction::Send {
                to: session.addr,
                bytes,
            });
            self.sessions.touch(&id, now);
            debug!(session = %hex::encode(id), "duplicate initiation");
            return Ok(resend.into_iter().collect());
        }

        let addr = self
            .peers
            .get(&init.src)
            .map(|rec| rec.addr)
            .ok_or(NodeError::UnknownPeer(init.src))?;
        let (reply, secret) = SessionInitiation::new(&self.identity, &init.src, Some(id))?;
        let key = secret.complete(&init.dh_public, self.settings.derivation)?;
        let bytes = reply.to_bytes();
        self.sessions
            .insert(id, init.src, addr, key, Some(bytes.clone()), now);
        info!(peer = %init.src, session = %hex::encode(id), "session established");
        Ok(vec![
            OutboundAction::Send { to: addr, bytes },
            OutboundAction::SessionEstablished {
                session_id: id,
                peer: init.src,
            },
        ])
    }

    fn on_data(&mut self, data: SessionData, now: Instant) -> Result<Vec<OutboundAction>, NodeError> {
        if self.sent_nonces.contains(&data.nonce) {
            return Ok(Vec::new());
        }
        let session = self
            .sessions
            .get(&data.session_id)
            .ok_or(NodeError::UnknownSession(data.session_id))?;
        let plaintext = data.open(&session.key)?;
        let peer = session.peer;
        self.sessions.touch(&data.session_id, now);
        Ok(vec![OutboundAction::Deliver {
            session_id: data.session_id,
            peer,
            plaintext,
        }])
    }
}

/// Why a datagram or request was refused.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("malformed datagram: {0}")]
    Decode(#[from] DecodeError),
    #[error("invalid signature")]
    BadSignature,
    #[error("initiation addressed to another node")]
    NotForUs,
    #[error("peer {0} is not allowed")]
    NotAllowed(PublicKey),
    #[error("unknown peer {0}")]
    UnknownPeer(PublicKey),
    #[error("unknown session {}", hex::encode(.0))]
    UnknownSession(SessionId),
    #[error("session {} belongs to another peer", hex::encode(.0))]
    SessionConflict(SessionId),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        Node::new(Identity::generate().unwrap(), NodeSettings::default())
    }

    fn group() -> SocketAddr {
        "[ff1e::5043:4153:54]:1024".parse().unwrap()
    }

    fn introduce(a: &mut Node, b: &mut Node, now: Instant) {
        let da = a.declaration(group());
        let db = b.declaration(group());
        b.on_datagram(&da, group(), now).unwrap();
        a.on_datagram(&db, group(), now).unwrap();
    }

    fn sent(actions: &[OutboundAction]) -> Vec<u8> {
        actions
            .iter()
            .find_map(|a| match a {
                OutboundAction::Send { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .expect("send action")
    }

    #[test]
    fn declaration_registers_peer() {
        let now = Instant::now();
        let mut a = node();
        let b = node();
        a.on_datagram(&b.declaration(group()), group(), now).unwrap();
        assert_eq!(a.peers().get(b.public_key()).unwrap().addr, group());
    }

    #[test]
    fn own_declaration_ignored() {
        let mut a = node();
        let own = a.declaration(group());
        a.on_datagram(&own, group(), Instant::now()).unwrap();
        assert!(a.peers().is_empty());
    }

    #[test]
    fn tampered_declaration_rejected() {
        let mut a = node();
        let mut bytes = node().declaration(group());
        bytes[2] ^= 1;
        assert!(matches!(
            a.on_datagram(&bytes, group(), Instant::now()),
            Err(NodeError::BadSignature)
        ));
        assert!(a.peers().is_empty());
    }

    #[test]
    fn allow_list_filters_declarations() {
        let friend = Identity::generate().unwrap();
        let settings = NodeSettings {
            allowed_peers: [*friend.public_key()].into_iter().collect(),
            ..NodeSettings::default()
        };
        let mut a = Node::new(Identity::generate().unwrap(), settings);
        let stranger = node();
        assert!(matches!(
            a.on_datagram(&stranger.declaration(group()), group(), Instant::now()),
            Err(NodeError::NotAllowed(_))
        ));
        let friend = Node::new(friend, NodeSettings::default());
        a.on_datagram(&friend.declaration(group()), group(), Instant::now())
            .unwrap();
        assert_eq!(a.peers().len(), 1);
    }

    #[test]
    fn handshake_and_data_both_ways() {
        let now = Instant::now();
        let mut a = node();
        let mut b = node();
        introduce(&mut a, &mut b, now);

        let init = a.initiate(&b.public_key().clone(), now).unwrap();
        let id = init.session_id;
        assert!(a.is_pending(&id));
        assert_eq!(init.to, group());

        let b_actions = b.on_datagram(&init.bytes, group(), now).unwrap();
        assert!(b_actions.contains(&OutboundAction::SessionEstablished {
            session_id: id,
            peer: *a.public_key(),
        }));
        let reply = sent(&b_actions);

        let a_actions = a.on_datagram(&reply, group(), now).unwrap();
        assert_eq!(
            a_actions,
            vec![OutboundAction::SessionEstablished {
                session_id: id,
                peer: *b.public_key(),
            }]
        );
        assert!(!a.is_pending(&id));

        let data = sent(&[a.send(&id, b"hello b", now).unwrap()]);
        assert_eq!(
            b.on_datagram(&data, group(), now).unwrap(),
            vec![OutboundAction::Deliver {
                session_id: id,
                peer: *a.public_key(),
                plaintext: b"hello b".to_vec(),
            }]
        );

        let back = sent(&[b.send(&id, b"hello a", now).unwrap()]);
        match &a.on_datagram(&back, group(), now).unwrap()[..] {
            [OutboundAction::Deliver { plaintext, .. }] => assert_eq!(plaintext, b"hello a"),
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[test]
    fn hashed_keys_interoperate() {
        let now = Instant::now();
        let settings = NodeSettings {
            derivation: KeyDerivation::Sha256,
            ..NodeSettings::default()
        };
        let mut a = Node::new(Identity::generate().unwrap(), settings.clone());
        let mut b = Node::new(Identity::generate().unwrap(), settings);
        introduce(&mut a, &mut b, now);

        let init = a.initiate(&b.public_key().clone(), now).unwrap();
        let id = init.session_id;
        let reply = sent(&b.on_datagram(&init.bytes, group(), now).unwrap());
        a.on_datagram(&reply, group(), now).unwrap();
        let data = sent(&[a.send(&id, b"x", now).unwrap()]);
        assert_eq!(b.on_datagram(&data, group(), now).unwrap().len(), 1);
    }

    #[test]
    fn initiation_for_someone_else_dropped() {
        let now = Instant::now();
        let mut a = node();
        let mut b = node();
        let mut c = node();
        introduce(&mut a, &mut b, now);
        introduce(&mut c, &mut b, now);

        let init = a.initiate(&b.public_key().clone(), now).unwrap();
        assert!(matches!(
            c.on_datagram(&init.bytes, group(), now),
            Err(NodeError::NotForUs)
        ));
        assert!(c.sessions().is_empty());
    }

    #[test]
    fn initiation_from_unknown_peer_dropped() {
        let now = Instant::now();
        let mut a = node();
        let mut b = node();
        a.on_datagram(&b.declaration(group()), group(), now).unwrap();
        let init = a.initiate(&b.public_key().clone(), now).unwrap();
        assert!(matches!(
            b.on_datagram(&init.bytes, group(), now),
            Err(NodeError::UnknownPeer(_))
        ));
        assert!(b.sessions().is_empty());
    }

    #[test]
    fn initiate_unknown_peer_fails() {
        let mut a = node();
        let stranger = *node().public_key();
        assert!(matches!(
            a.initiate(&stranger, Instant::now()),
            Err(NodeError::UnknownPeer(_))
        ));
    }

    #[test]
    fn data_for_unknown_session_dropped() {
        let mut a = node();
        let key = peercast_core::SessionKey::from_bytes([1; 32]);
        let data = SessionData::seal(&key, [7; 16], b"?").unwrap().to_bytes();
        assert!(matches!(
            a.on_datagram(&data, group(), Instant::now()),
            Err(NodeError::UnknownSession(_))
        ));
    }

    #[test]
    fn looped_back_data_ignored() {
        let now = Instant::now();
        let mut a = node();
        let mut b = node();
        introduce(&mut a, &mut b, now);
        let init = a.initiate(&b.public_key().clone(), now).unwrap();
        let id = init.session_id;
        let reply = sent(&b.on_datagram(&init.bytes, group(), now).unwrap());
        a.on_datagram(&reply, group(), now).unwrap();

        let data = sent(&[a.send(&id, b"mine", now).unwrap()]);
        assert!(a.on_datagram(&data, group(), now).unwrap().is_empty());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let mut a = node();
        assert!(matches!(
            a.on_datagram(&[9, 9, 9], group(), Instant::now()),
            Err(NodeError::Decode(DecodeError::UnknownType(9)))
        ));
        assert!(matches!(
            a.on_datagram(&[], group(), Instant::now()),
            Err(NodeError::Decode(DecodeError::Empty))
        ));
    }

    #[test]
    fn tick_expires_sessions_and_pending() {
        let t0 = Instant::now();
        let mut a = node();
        let mut b = node();
        introduce(&mut a, &mut b, t0);
        let init = a.initiate(&b.public_key().clone(), t0).unwrap();
        let id = init.session_id;
        b.on_datagram(&init.bytes, group(), t0).unwrap();
        assert_eq!(b.sessions().len(), 1);

        let later = t0 + DEFAULT_SESSION_TTL;
        a.tick(later);
        b.tick(later);
        assert!(!a.is_pending(&id));
        assert!(b.sessions().is_empty());
        assert!(b.peers().is_empty());
    }
}
