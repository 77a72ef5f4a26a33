//! # Wire Envelope
//!
//! The [`WireMessage`] envelope is the unit of everything that crosses the
//! radio: payment traffic, acknowledgments, application-defined extras.
//! One logical message is encrypted and signed as a whole, *then* split
//! into fragments if it exceeds the link MTU — so a fragment's payload is
//! an opaque slice of ciphertext and the receiver must reassemble before
//! it can verify or decrypt anything.
//!
//! Envelopes are immutable once constructed. Fragmentation and the
//! encrypt-and-sign step both produce new envelopes rather than editing
//! in place; anything else makes signature bookkeeping a guessing game.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config;
use crate::identity::DeviceId;

use super::error::WireError;

// ---------------------------------------------------------------------------
// Message Types
// ---------------------------------------------------------------------------

/// Discriminates how an inbound envelope is routed after reassembly.
///
/// `Ack` is protocol control traffic and short-circuits the crypto path;
/// every other type is verified, decrypted, acknowledged, and dispatched
/// to whatever handler registered for it. `Custom` leaves room for
/// application traffic without a protocol version bump.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Acknowledges receipt of a specific prior message by id.
    Ack,
    /// Payment request (sender → receiver).
    PaymentRequest,
    /// Accept/reject answer to a payment request.
    PaymentResponse,
    /// Signed transfer record.
    PaymentTransaction,
    /// Confirm/reject answer to a transfer record.
    PaymentConfirmation,
    /// Cancels a non-terminal payment session.
    PaymentCancellation,
    /// Application-defined message kind.
    Custom(String),
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::PaymentRequest => write!(f, "payment-request"),
            Self::PaymentResponse => write!(f, "payment-response"),
            Self::PaymentTransaction => write!(f, "payment-transaction"),
            Self::PaymentConfirmation => write!(f, "payment-confirmation"),
            Self::PaymentCancellation => write!(f, "payment-cancellation"),
            Self::Custom(kind) => write!(f, "custom:{}", kind),
        }
    }
}

// ---------------------------------------------------------------------------
// WireMessage
// ---------------------------------------------------------------------------

/// The envelope for every frame on the radio link.
///
/// `version` is deliberately the first field: bincode encodes it as the
/// first two bytes of the frame, which lets a receiver reject a
/// wrong-version frame without decoding the rest.
///
/// A fragment is a `WireMessage` with `total_fragments > 1`; it shares its
/// base `id` (suffixed with `#<index>`) and carries the signature of the
/// whole logical message, so any single surviving fragment is enough to
/// know what the set reassembles into.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Wire protocol version. See [`config::WIRE_PROTOCOL_VERSION`].
    pub version: u16,
    /// Unique message id (UUIDv4); fragments append `#<index>`.
    pub id: String,
    /// Routing discriminator.
    pub msg_type: MessageType,
    /// Fragment index, `0` for an unfragmented message.
    pub sequence: u32,
    /// Total fragments in the logical message, `1` when unfragmented.
    pub total_fragments: u32,
    /// Application payload. Ciphertext for everything except `Ack`.
    pub payload: Vec<u8>,
    /// Ed25519 signature over [`signing_payload`](Self::signing_payload).
    pub signature: Vec<u8>,
    /// Unix timestamp in milliseconds at construction.
    pub timestamp_ms: u64,
    /// Sender device id.
    pub from: DeviceId,
    /// Intended recipient device id.
    pub to: DeviceId,
}

impl WireMessage {
    /// Construct a fresh, unsigned, unfragmented envelope.
    pub fn new(msg_type: MessageType, payload: Vec<u8>, from: DeviceId, to: DeviceId) -> Self {
        Self {
            version: config::WIRE_PROTOCOL_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            msg_type,
            sequence: 0,
            total_fragments: 1,
            payload,
            signature: Vec::new(),
            timestamp_ms: config::unix_millis(),
            from,
            to,
        }
    }

    /// The message id with any fragment suffix stripped.
    pub fn base_id(&self) -> &str {
        match self.id.rsplit_once('#') {
            Some((base, _)) => base,
            None => &self.id,
        }
    }

    /// `true` when this envelope is one piece of a larger logical message.
    pub fn is_fragment(&self) -> bool {
        self.total_fragments > 1
    }

    /// Canonical byte representation of every field except `signature`.
    ///
    /// This is what gets signed and verified. The payload is hex-encoded
    /// into the canonical string so the representation is unambiguous
    /// regardless of what bytes the payload contains.
    pub fn signing_payload(&self) -> Vec<u8> {
        let canonical = format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.version,
            self.id,
            self.msg_type,
            self.sequence,
            self.total_fragments,
            hex::encode(&self.payload),
            self.timestamp_ms,
            self.from,
            self.to,
        );
        canonical.into_bytes()
    }

    /// Structural and freshness validation.
    ///
    /// Rejects envelopes with empty identity fields, an empty payload or
    /// signature, a zero timestamp, or a timestamp older than `max_age`
    /// (the replay window). Timestamps in the future are tolerated — two
    /// phones rarely agree on the time to the millisecond.
    pub fn validate(&self, max_age: Duration) -> Result<(), WireError> {
        if self.id.is_empty() {
            return Err(WireError::Invalid("empty message id"));
        }
        if self.from.as_str().is_empty() {
            return Err(WireError::Invalid("empty sender id"));
        }
        if self.to.as_str().is_empty() {
            return Err(WireError::Invalid("empty recipient id"));
        }
        if self.payload.is_empty() {
            return Err(WireError::Invalid("empty payload"));
        }
        if self.signature.is_empty() {
            return Err(WireError::Invalid("missing signature"));
        }
        if self.timestamp_ms == 0 {
            return Err(WireError::Invalid("zero timestamp"));
        }

        let age_ms = config::unix_millis().saturating_sub(self.timestamp_ms);
        let max_ms = max_age.as_millis() as u64;
        if age_ms > max_ms {
            return Err(WireError::Stale { age_ms, max_ms });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Acknowledgment Payload
// ---------------------------------------------------------------------------

/// Payload of a [`MessageType::Ack`] envelope.
///
/// ACKs carry no application data, so their payload is this plain record
/// rather than ciphertext — the receiver resolves the matching pending
/// send by id and moves on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckPayload {
    /// Base id of the message being acknowledged.
    pub original_message_id: String,
}
