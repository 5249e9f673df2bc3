//! Framing: one message per datagram. Type tag, then fixed-width big-endian fields.
//!
//! | message              | layout                                              | size     |
//! |----------------------|-----------------------------------------------------|----------|
//! | address declaration  | tag, port u16, address 16, src 32, signature 64     | 115      |
//! | session initiation   | tag, session 16, src 32, dst 32, dh 32, signature 64| 177      |
//! | session data         | tag, session 16, nonce 12, ciphertext ..            | 29 + len |

use crate::identity::{PublicKey, Signature, NONCE_LEN, SIGNATURE_LEN};
use crate::protocol::{
    AddressDeclaration, Message, SessionData, SessionInitiation, TYPE_ADDRESS_DECLARATION,
    TYPE_SESSION_DATA, TYPE_SESSION_INITIATION,
};

/// Encoded size of an address declaration.
pub const ADDRESS_DECLARATION_LEN: usize = 1 + 2 + 16 + 32 + SIGNATURE_LEN;
/// Encoded size of a session initiation.
pub const SESSION_INITIATION_LEN: usize = 1 + 16 + 32 + 32 + 32 + SIGNATURE_LEN;
/// Session data header size; the ciphertext follows.
pub const SESSION_DATA_HEADER_LEN: usize = 1 + 16 + NONCE_LEN;

/// Encode a message into a single datagram.
pub fn encode(msg: &Message) -> Vec<u8> {
    match msg {
        Message::AddressDeclaration(m) => m.to_bytes(),
        Message::SessionInitiation(m) => m.to_bytes(),
        Message::SessionData(m) => m.to_bytes(),
    }
}

/// Decode one datagram. The first byte selects the layout.
pub fn parse(bytes: &[u8]) -> Result<Message, DecodeError> {
    let tag = *bytes.first().ok_or(DecodeError::Empty)?;
    match tag {
        TYPE_ADDRESS_DECLARATION => AddressDeclaration::from_bytes(bytes).map(Message::AddressDeclaration),
        TYPE_SESSION_INITIATION => SessionInitiation::from_bytes(bytes).map(Message::SessionInitiation),
        TYPE_SESSION_DATA => SessionData::from_bytes(bytes).map(Message::SessionData),
        other => Err(DecodeError::UnknownType(other)),
    }
}

impl Message {
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        parse(bytes)
    }
}

impl AddressDeclaration {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ADDRESS_DECLARATION_LEN);
        out.push(TYPE_ADDRESS_DECLARATION);
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&self.address);
        out.extend_from_slice(self.src.as_bytes());
        out.extend_from_slice(self.signature.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::fixed(bytes, TYPE_ADDRESS_DECLARATION, ADDRESS_DECLARATION_LEN)?;
        Ok(Self {
            port: u16::from_be_bytes(r.array()?),
            address: r.array()?,
            src: PublicKey::from_bytes(r.array()?),
            signature: Signature::from_bytes(r.array()?),
        })
    }
}

impl SessionInitiation {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SESSION_INITIATION_LEN);
        out.push(TYPE_SESSION_INITIATION);
        out.extend_from_slice(&self.session_id);
        out.extend_from_slice(self.src.as_bytes());
        out.extend_from_slice(self.dst.as_bytes());
        out.extend_from_slice(&self.dh_public);
        out.extend_from_slice(self.signature.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::fixed(bytes, TYPE_SESSION_INITIATION, SESSION_INITIATION_LEN)?;
        Ok(Self {
            session_id: r.array()?,
            src: PublicKey::from_bytes(r.array()?),
            dst: PublicKey::from_bytes(r.array()?),
            dh_public: r.array()?,
            signature: Signature::from_bytes(r.array()?),
        })
    }
}

impl SessionData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SESSION_DATA_HEADER_LEN + self.ciphertext.len());
        out.push(TYPE_SESSION_DATA);
        out.extend_from_slice(&self.session_id);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < SESSION_DATA_HEADER_LEN {
            return Err(DecodeError::Truncated {
                expected: SESSION_DATA_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let mut r = Reader::new(bytes, TYPE_SESSION_DATA)?;
        Ok(Self {
            session_id: r.array()?,
            nonce: r.array()?,
            ciphertext: r.rest().to_vec(),
        })
    }
}

/// Cursor over a datagram, positioned after the type tag.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], tag: u8) -> Result<Self, DecodeError> {
        match bytes.split_first() {
            None => Err(DecodeError::Empty),
            Some((&t, rest)) if t == tag => Ok(Self { buf: rest }),
            Some((&t, _)) => Err(DecodeError::UnknownType(t)),
        }
    }

    /// Fixed-size layouts must match `len` exactly.
    fn fixed(bytes: &'a [u8], tag: u8, len: usize) -> Result<Self, DecodeError> {
        if bytes.len() < len {
            return Err(DecodeError::Truncated {
                expected: len,
                actual: bytes.len(),
            });
        }
        if bytes.len() > len {
            return Err(DecodeError::TrailingBytes(bytes.len() - len));
        }
        Self::new(bytes, tag)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        if self.buf.len() < N {
            return Err(DecodeError::Truncated {
                expected: N,
                actual: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(N);
        self.buf = tail;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn rest(self) -> &'a [u8] {
        self.buf
    }
}

/// Error decoding a datagram (empty, unknown tag, wrong length).
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum DecodeError {
    #[error("cannot parse empty message")]
    Empty,
    #[error("unsupported message type {0}")]
    UnknownType(u8),
    #[error("truncated message: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, SessionKey};

    fn sample_declaration() -> AddressDeclaration {
        let id = Identity::generate().unwrap();
        AddressDeclaration::new("[fe80::1]:1025".parse().unwrap(), &id)
    }

    #[test]
    fn declaration_layout() {
        let decl = sample_declaration();
        let bytes = decl.to_bytes();
        assert_eq!(bytes.len(), ADDRESS_DECLARATION_LEN);
        assert_eq!(bytes.len(), 115);
        assert_eq!(bytes[0], TYPE_ADDRESS_DECLARATION);
        assert_eq!(&bytes[1..3], &1025u16.to_be_bytes());
        assert_eq!(&bytes[3..19], &decl.address);
        assert_eq!(&bytes[19..51], decl.src.as_bytes());
        assert_eq!(&bytes[51..], decl.signature.as_bytes());
    }

    #[test]
    fn initiation_layout() {
        let a = Identity::generate().unwrap();
        let b = Identity::generate().unwrap();
        let (init, _) = SessionInitiation::new(&a, b.public_key(), Some([9u8; 16])).unwrap();
        let bytes = init.to_bytes();
        assert_eq!(bytes.len(), 177);
        assert_eq!(bytes[0], TYPE_SESSION_INITIATION);
        assert_eq!(&bytes[1..17], &[9u8; 16]);
        assert_eq!(&bytes[17..49], a.public_key().as_bytes());
        assert_eq!(&bytes[49..81], b.public_key().as_bytes());
        assert_eq!(&bytes[81..113], &init.dh_public);
    }

    #[test]
    fn data_layout() {
        let data = SessionData {
            session_id: [1u8; 16],
            nonce: [2u8; NONCE_LEN],
            ciphertext: vec![3, 4, 5],
        };
        let bytes = data.to_bytes();
        assert_eq!(bytes.len(), 29 + 3);
        assert_eq!(bytes[0], TYPE_SESSION_DATA);
        assert_eq!(&bytes[29..], &[3u8, 4, 5]);
    }

    #[test]
    fn roundtrip_each_variant() {
        let a = Identity::generate().unwrap();
        let b = Identity::generate().unwrap();
        let (init, _) = SessionInitiation::new(&a, b.public_key(), None).unwrap();
        let key = SessionKey::from_bytes([5u8; 32]);
        let data = SessionData::seal(&key, init.session_id, b"payload").unwrap();

        for msg in [
            Message::AddressDeclaration(sample_declaration()),
            Message::SessionInitiation(init),
            Message::SessionData(data),
        ] {
            assert_eq!(parse(&encode(&msg)).unwrap(), msg);
        }
    }

    #[test]
    fn parsed_declaration_still_validates() {
        let decl = sample_declaration();
        match parse(&decl.to_bytes()).unwrap() {
            Message::AddressDeclaration(d) => assert!(d.validate()),
            other => panic!("expected declaration, got {:?}", other),
        }
    }

    #[test]
    fn tampered_byte_before_signature_fails_validation() {
        let bytes = sample_declaration().to_bytes();
        for i in 1..ADDRESS_DECLARATION_LEN - SIGNATURE_LEN {
            let mut tampered = bytes.clone();
            tampered[i] ^= 0x80;
            let d = AddressDeclaration::from_bytes(&tampered).unwrap();
            assert!(!d.validate(), "byte {} tamper not detected", i);
        }
    }

    #[test]
    fn empty_and_unknown() {
        assert_eq!(parse(&[]), Err(DecodeError::Empty));
        assert_eq!(parse(&[7, 0, 0]), Err(DecodeError::UnknownType(7)));
    }

    #[test]
    fn truncated_inputs() {
        let bytes = sample_declaration().to_bytes();
        assert!(matches!(
            parse(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            parse(&[TYPE_SESSION_DATA; 28]),
            Err(DecodeError::Truncated {
                expected: 29,
                actual: 28
            })
        ));
        assert!(matches!(
            parse(&[TYPE_SESSION_INITIATION]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn trailing_bytes_rejected_for_fixed_layouts() {
        let mut bytes = sample_declaration().to_bytes();
        bytes.push(0);
        assert_eq!(parse(&bytes), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn empty_ciphertext_header_only() {
        let mut bytes = vec![TYPE_SESSION_DATA];
        bytes.extend_from_slice(&[0u8; 28]);
        match parse(&bytes).unwrap() {
            Message::SessionData(d) => assert!(d.ciphertext.is_empty()),
            other => panic!("expected data, got {:?}", other),
        }
    }
}
