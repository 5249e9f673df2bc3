//! peercast protocol core: multicast address allocation, wire codec, identity and session crypto.
//! No I/O; the packet connection lives in `peercast-net`.

pub mod addr;
pub mod identity;
pub mod protocol;
pub mod wire;

pub use addr::{prefixed_v6, transient, transient_v4, transient_v6, AddrError, Family, Prefix};
pub use identity::{
    CryptoError, EphemeralSecret, Identity, KeyDerivation, PublicKey, SessionId, SessionKey,
    Signature,
};
pub use protocol::{AddressDeclaration, Message, SessionData, SessionInitiation};
pub use wire::{encode, parse, DecodeError};

