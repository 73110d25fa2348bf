//! Core types shared by the engine, the sessions and the round processors

use frost_secp256k1_tr as frost;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

/// Numeric routing identifier of a party on the message transport
pub type PartyId = u16;

/// Session fingerprint shared by every party taking part in the same run
pub type SessionId = [u8; 32];

/// Which protocol a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Distributed key generation
    Keygen,
    /// Threshold signing
    Signing,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Keygen => f.write_str("keygen"),
            SessionKind::Signing => f.write_str("signing"),
        }
    }
}

/// Opaque serialized secret share produced by key generation.
///
/// The buffer is owned by exactly one engine; it is copied at the API
/// boundary and wiped when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ShareData(Vec<u8>);

impl ShareData {
    /// Wrap an existing serialized share
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Borrow the serialized share
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ShareData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShareData(<{} bytes redacted>)", self.0.len())
    }
}

/// Group public key derived during key generation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// BIP-340 x-only form of the key
    pub fn x_only(&self) -> Result<[u8; 32]> {
        let x = match self.0.len() {
            32 => &self.0[..],
            33 => &self.0[1..],
            len => {
                return Err(Error::Deserialization(format!(
                    "Invalid public key length: {}",
                    len
                )))
            }
        };
        let mut out = [0u8; 32];
        out.copy_from_slice(x);
        Ok(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Verify a threshold signature over `message` against this key
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = frost::VerifyingKey::deserialize(&self.0)
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        let sig = frost::Signature::deserialize(signature.as_bytes())
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        key.verify(message, &sig)
            .map_err(|e| Error::Protocol(format!("Signature verification failed: {}", e)))
    }
}

/// BIP-340 Schnorr signature (64 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// A message delivered to the engine by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Opaque round payload
    pub payload: Vec<u8>,
    /// Routing id of the sender
    pub from: PartyId,
    /// Whether the sender addressed every member
    pub broadcast: bool,
}

/// Addressee of an outbound round message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// Every other configured member
    All,
    /// A single member
    Party(PartyId),
}

/// A round message produced by a processor, handed to the transport once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub to: Recipient,
}

impl OutboundMessage {
    pub fn broadcast(payload: Vec<u8>) -> Self {
        Self {
            payload,
            to: Recipient::All,
        }
    }

    pub fn direct(to: PartyId, payload: Vec<u8>) -> Self {
        Self {
            payload,
            to: Recipient::Party(to),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == Recipient::All
    }

    /// Destination id; `0` for broadcasts, where transports ignore it
    pub fn destination(&self) -> PartyId {
        match self.to {
            Recipient::All => 0,
            Recipient::Party(id) => id,
        }
    }
}

/// Wire envelope around one processor round payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Session fingerprint
    pub session: SessionId,
    /// Protocol the payload belongs to
    pub kind: SessionKind,
    /// Round number (1-based)
    pub round: u32,
    /// Sender routing id
    pub from: PartyId,
    /// Serialized protocol package
    pub data: Vec<u8>,
}

impl Envelope {
    /// Wrap `data` and encode it for the wire
    pub fn seal(
        session: SessionId,
        kind: SessionKind,
        round: u32,
        from: PartyId,
        data: Vec<u8>,
    ) -> Result<Vec<u8>> {
        Self {
            session,
            kind,
            round,
            from,
            data,
        }
        .encode()
    }

    /// Decode an inbound message and check it belongs to the given session
    pub fn open(message: &InboundMessage, session: &SessionId, kind: SessionKind) -> Result<Self> {
        let envelope = Self::decode(&message.payload)?;
        if envelope.kind != kind || &envelope.session != session {
            return Err(Error::Protocol(format!(
                "Envelope belongs to another {} session",
                envelope.kind
            )));
        }
        if envelope.from != message.from {
            return Err(Error::Protocol(format!(
                "Envelope from {} relayed as {}",
                envelope.from, message.from
            )));
        }
        Ok(envelope)
    }

    /// Session fingerprint of an encoded envelope, without keeping the payload
    pub fn session_of(bytes: &[u8]) -> Option<SessionId> {
        #[derive(Deserialize)]
        struct Header {
            session: SessionId,
        }
        serde_json::from_slice::<Header>(bytes)
            .ok()
            .map(|header| header.session)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}
