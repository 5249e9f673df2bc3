//! Node identity and crypto: Ed25519 identity keys, X25519 ephemeral exchange, session sealing.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Session identifier carried by initiation and data messages.
pub type SessionId = [u8; 16];

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Long-term public key (32 bytes, Ed25519). Identifies a node on the wire.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes. The point is only checked when verifying.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    /// Verify an Ed25519 signature made by this key over `message`.
    /// Malformed keys and signatures verify as false.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

/// Ed25519 signature as carried on the wire.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
        Signature(bytes)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Long-term signing identity. Keep the secret private; expose only the public key.
pub struct Identity {
    signing: ed25519_dalek::SigningKey,
    public: PublicKey,
}

impl Identity {
    /// Generate a new identity from OS randomness.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = [0u8; 32];
        fill_random(&mut seed)?;
        let id = Self::from_seed(&seed);
        seed.zeroize();
        Ok(id)
    }

    /// Rebuild an identity from its 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = ed25519_dalek::SigningKey::from_bytes(seed);
        let public = PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    /// Secret seed, for callers that persist identities.
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }
}

/// How the X25519 output becomes the AES-256 session key.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum KeyDerivation {
    /// Use the raw shared secret as the key.
    #[default]
    Raw,
    /// SHA-256 over a domain label and the shared secret.
    Sha256,
}

/// Ephemeral X25519 secret for one handshake. Never transmitted.
pub struct EphemeralSecret {
    secret: StaticSecret,
}

impl EphemeralSecret {
    /// Draw a fresh secret scalar from OS randomness.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; 32];
        fill_random(&mut bytes)?;
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();
        Ok(Self { secret })
    }

    /// Public value to embed in a session initiation.
    pub fn public(&self) -> [u8; 32] {
        X25519PublicKey::from(&self.secret).to_bytes()
    }

    /// Complete the exchange with the peer's public value.
    /// Fails if the peer sent a low-order point (all-zero shared secret).
    pub fn complete(
        &self,
        peer_public: &[u8; 32],
        derivation: KeyDerivation,
    ) -> Result<SessionKey, CryptoError> {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::LowOrderPoint);
        }
        Ok(match derivation {
            KeyDerivation::Raw => SessionKey(*shared.as_bytes()),
            KeyDerivation::Sha256 => derive_session_key(shared.as_bytes()),
        })
    }
}

/// Hash a shared secret into a session key under a fixed domain label.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(b"peercast-session-v1");
    hasher.update(shared_secret);
    SessionKey(hasher.finalize().into())
}

/// 32-byte AES-256-GCM session key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        SessionKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Seal with AES-256-GCM, no associated data. Output is ciphertext followed by the tag.
pub fn seal(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)
}

/// Open a sealed payload. Any key, nonce or ciphertext mismatch fails as a whole.
pub fn open(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

/// Fill `buf` from the OS randomness source. No fallback to a weaker source.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng.try_fill_bytes(buf).map_err(|_| CryptoError::Random)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("randomness source failed")]
    Random,
    #[error("peer sent a low-order public value")]
    LowOrderPoint,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
