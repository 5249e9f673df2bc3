//! peercast wire protocol: message types, construction, signing and validation.
//!
//! Every message is one datagram: a 1-byte type tag followed by fixed-width
//! big-endian fields (see the wire module for the byte layout). Declarations
//! and initiations are self-certifying: they are signed by the long-term key
//! they embed, so `validate` only proves the sender owns that key. Deciding
//! which keys to trust is up to the caller.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use crate::identity::{
    self, CryptoError, EphemeralSecret, Identity, PublicKey, SessionId, SessionKey, Signature,
    NONCE_LEN, SIGNATURE_LEN,
};

/// Type tag of an address declaration.
pub const TYPE_ADDRESS_DECLARATION: u8 = 0;
/// Type tag of a session initiation.
pub const TYPE_SESSION_INITIATION: u8 = 1;
/// Type tag of session data.
pub const TYPE_SESSION_DATA: u8 = 2;

/// All wire message types.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Message {
    AddressDeclaration(AddressDeclaration),
    SessionInitiation(SessionInitiation),
    SessionData(SessionData),
}

/// Signed announcement: "the holder of `src` is reachable at `address`:`port`".
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AddressDeclaration {
    pub port: u16,
    /// IPv6 address, or an IPv4 address in IPv4-mapped form.
    pub address: [u8; 16],
    pub src: PublicKey,
    pub signature: Signature,
}

impl AddressDeclaration {
    /// Declare `addr` as the reachable address of `identity`, signed by it.
    pub fn new(addr: SocketAddr, identity: &Identity) -> Self {
        let address = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        let mut decl = Self {
            port: addr.port(),
            address,
            src: *identity.public_key(),
            signature: Signature::from_bytes([0u8; SIGNATURE_LEN]),
        };
        decl.signature = identity.sign(signed_part(&decl.to_bytes()));
        decl
    }

    /// Declared transport address. IPv4-mapped addresses come back as IPv4.
    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.address);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        SocketAddr::new(ip, self.port)
    }

    /// Check the signature against the embedded public key.
    pub fn validate(&self) -> bool {
        self.src
            .verify(signed_part(&self.to_bytes()), &self.signature)
    }
}

/// Signed half of an authenticated X25519 handshake.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionInitiation {
    pub session_id: SessionId,
    pub src: PublicKey,
    pub dst: PublicKey,
    /// Sender's ephemeral X25519 public value.
    pub dh_public: [u8; 32],
    pub signature: Signature,
}

impl SessionInitiation {
    /// Start (or answer) a handshake with `dst`.
    ///
    /// A random session ID is drawn when `session_id` is `None`; responders
    /// pass the initiator's ID. Returns the message and the ephemeral secret
    /// needed to complete the exchange once the peer's half arrives.
    pub fn new(
        identity: &Identity,
        dst: &PublicKey,
        session_id: Option<SessionId>,
    ) -> Result<(Self, EphemeralSecret), CryptoError> {
        let session_id = match session_id {
            Some(id) => id,
            None => {
                let mut id = [0u8; 16];
                identity::fill_random(&mut id)?;
                id
            }
        };
        let secret = EphemeralSecret::generate()?;
        let mut init = Self {
            session_id,
            src: *identity.public_key(),
            dst: *dst,
            dh_public: secret.public(),
            signature: Signature::from_bytes([0u8; SIGNATURE_LEN]),
        };
        init.signature = identity.sign(signed_part(&init.to_bytes()));
        Ok((init, secret))
    }

    /// Check the signature against the embedded source key.
    pub fn validate(&self) -> bool {
        self.src
            .verify(signed_part(&self.to_bytes()), &self.signature)
    }

    /// Validate and check that the message is addressed to `me` and, when
    /// given, comes from `expected_src`.
    pub fn validate_for(&self, me: &PublicKey, expected_src: Option<&PublicKey>) -> bool {
        if self.dst != *me {
            return false;
        }
        if let Some(src) = expected_src {
            if self.src != *src {
                return false;
            }
        }
        self.validate()
    }
}

/// AES-256-GCM sealed application data for an established session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionData {
    pub session_id: SessionId,
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext followed by the 16-byte tag.
    pub ciphertext: Vec<u8>,
}

impl SessionData {
    /// Seal `plaintext` under `key` with a fresh random nonce.
    pub fn seal(
        key: &SessionKey,
        session_id: SessionId,
        plaintext: &[u8],
    ) -> Result<Self, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        identity::fill_random(&mut nonce)?;
        let ciphertext = identity::seal(key, &nonce, plaintext)?;
        Ok(Self {
            session_id,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt with the session key. Fails as a whole on any mismatch.
    pub fn open(&self, key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
        identity::open(key, &self.nonce, &self.ciphertext)
    }
}

/// Encoded message minus the trailing signature.
fn signed_part(encoded: &[u8]) -> &[u8] {
    &encoded[..encoded.len() - SIGNATURE_LEN]
}
