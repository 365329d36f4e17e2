//! Link protocol: messages between a client and its gateway, and the end-to-end envelopes they carry.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::{bytes_32, PublicKey, ReceptionId};

/// Current protocol version. Used in the link handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Network round a message was placed in.
pub type RoundId = u64;

/// Application message type carried by E2E envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageType(pub u32);

impl MessageType {
    /// Listener wildcard: matches every type.
    pub const ANY: MessageType = MessageType(0);
    /// Plain text.
    pub const TEXT: MessageType = MessageType(2);

    pub fn matches(&self, other: MessageType) -> bool {
        *self == MessageType::ANY || *self == other
    }
}

/// Identifier of one logical E2E message (all of its parts share it).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(#[serde(with = "bytes_32")] pub [u8; 32]);

impl MessageId {
    pub fn compute(from: &ReceptionId, to: &ReceptionId, nonce: u64, payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"mixboot-message-id-v1");
        hasher.update(from.as_bytes());
        hasher.update(to.as_bytes());
        hasher.update(nonce.to_le_bytes());
        hasher.update(payload);
        MessageId(hasher.finalize().into())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..12]))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// What an envelope's ciphertext holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Opens a direct channel; ciphertext is the sender's contact, sealed to the recipient.
    ChannelRequest,
    /// One part of an E2E message on a direct channel.
    E2e {
        message_type: MessageType,
        message_id: MessageId,
        part: u16,
        parts: u16,
    },
    /// Single-use request; `sender_key` is the requester's ephemeral key.
    SingleUseRequest { request_id: [u8; 16] },
    /// Reply to a single-use request.
    SingleUseResponse { request_id: [u8; 16] },
}

/// End-to-end envelope. The gateway only reads the recipient on `Forward`; everything else is opaque to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: ReceptionId,
    pub sender_key: PublicKey,
    pub nonce: u64,
    pub kind: EnvelopeKind,
    pub ciphertext: Vec<u8>,
}

/// All link message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LinkMessage {
    /// Gateway: a new round started. Drives the health tracker.
    RoundUpdate { round: RoundId },
    /// Client: route this envelope to `to`.
    Forward { to: ReceptionId, envelope: Envelope },
    /// Gateway: an envelope addressed to this client.
    Deliver { envelope: Envelope },
}
