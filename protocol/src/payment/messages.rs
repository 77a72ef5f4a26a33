//! # Payment Message Payloads
//!
//! The five message bodies of the payment exchange. Each rides inside a
//! [`WireMessage`](crate::wire::WireMessage) payload — encrypted with the
//! session key and covered by the envelope signature like any other
//! traffic.
//!
//! The transfer record and the confirmation additionally embed their own
//! Ed25519 signature over a canonical field representation. Those two are
//! the documents of record for a payment: either party may need to present
//! one long after the session (and its envelope) is gone, so they must
//! verify standalone.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::keys::{PulsePublicKey, PulseSignature};
use crate::crypto::signer::DeviceSigner;
use crate::identity::DeviceId;

// ---------------------------------------------------------------------------
// Currency
// ---------------------------------------------------------------------------

/// Currencies a payment can be denominated in. Amounts are always in the
/// currency's smallest unit (centavos, cents, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    /// Brazilian Real (smallest unit: centavo, 10^-2).
    BRL,
    /// United States Dollar (smallest unit: cent, 10^-2).
    USD,
    /// Euro (smallest unit: cent, 10^-2).
    EUR,
    /// USD Coin stablecoin (smallest unit: 10^-6).
    USDC,
    /// PULSE native credit (smallest unit: 10^-2).
    PULSE,
    /// Arbitrary token identifier for non-standard assets.
    Custom(String),
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BRL => write!(f, "BRL"),
            Self::USD => write!(f, "USD"),
            Self::EUR => write!(f, "EUR"),
            Self::USDC => write!(f, "USDC"),
            Self::PULSE => write!(f, "PULSE"),
            Self::Custom(ticker) => write!(f, "{}", ticker),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / Response
// ---------------------------------------------------------------------------

/// The opening move: "I want to pay you this much."
///
/// Authenticity comes from the envelope signature; the request itself
/// carries no embedded signature because it never outlives the session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentRequestPayload {
    /// Unique request id; doubles as the payment session id on both sides.
    pub request_id: String,
    /// Amount in the currency's smallest unit.
    pub amount: u64,
    /// Currency of the payment.
    pub currency: Currency,
    /// Human-readable note ("Coffee at Pulse Cafe").
    pub memo: String,
    /// Unix ms after which the request is void.
    pub expires_at_ms: u64,
}

/// The receiver's answer to a request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentResponsePayload {
    /// The request being answered.
    pub request_id: String,
    /// Whether the receiver will take the payment.
    pub accepted: bool,
    /// Optional human-readable reason, mainly for rejections.
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Transfer Record
// ---------------------------------------------------------------------------

/// The signed transfer record — the money actually moving.
///
/// Carries the sender's balance before and after the debit so the receiver
/// can sanity-check the arithmetic, and a nonce so a captured record can
/// never be replayed into a second credit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Unique transaction id (UUIDv4).
    pub transaction_id: String,
    /// The request this transfer settles.
    pub request_id: String,
    /// Paying device.
    pub sender: DeviceId,
    /// Receiving device.
    pub receiver: DeviceId,
    /// Amount in smallest units.
    pub amount: u64,
    /// Currency of the transfer.
    pub currency: Currency,
    /// Per-sender unique nonce; checked against the replay set.
    pub nonce: u64,
    /// Sender's balance before the debit.
    pub balance_before: u64,
    /// Sender's balance after the debit.
    pub balance_after: u64,
    /// Unix ms when the record was built.
    pub timestamp_ms: u64,
    /// Sender's Ed25519 signature over [`signing_payload`](Self::signing_payload).
    pub signature: Vec<u8>,
}

impl TransferRecord {
    /// Canonical byte representation of everything except the signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        let canonical = format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.transaction_id,
            self.request_id,
            self.sender,
            self.receiver,
            self.amount,
            self.currency,
            self.nonce,
            self.balance_before,
            self.balance_after,
            self.timestamp_ms,
        );
        canonical.into_bytes()
    }

    /// Sign the record with the device's long-term key.
    pub fn sign_with(&mut self, signer: &dyn DeviceSigner) {
        self.signature = signer.sign(&self.signing_payload()).to_vec();
    }

    /// Verify the embedded signature against the sender's identity key.
    pub fn verify(&self, sender_key: &PulsePublicKey) -> bool {
        match PulseSignature::parse(&self.signature) {
            Some(sig) => sender_key.verify(&self.signing_payload(), &sig),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Confirmation / Cancellation
// ---------------------------------------------------------------------------

/// The receiver's signed verdict on a transfer record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentConfirmationPayload {
    /// The transfer being confirmed or rejected.
    pub transaction_id: String,
    /// `true` when the receiver validated and applied the transfer.
    pub confirmed: bool,
    /// Reason for a rejection.
    pub reason: Option<String>,
    /// Unix ms when the verdict was produced.
    pub timestamp_ms: u64,
    /// Receiver's Ed25519 signature over [`signing_payload`](Self::signing_payload).
    pub signature: Vec<u8>,
}

impl PaymentConfirmationPayload {
    /// Canonical byte representation of everything except the signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        let canonical = format!(
            "{}:{}:{}:{}",
            self.transaction_id,
            self.confirmed,
            self.reason.as_deref().unwrap_or(""),
            self.timestamp_ms,
        );
        canonical.into_bytes()
    }

    /// Sign the confirmation with the device's long-term key.
    pub fn sign_with(&mut self, signer: &dyn DeviceSigner) {
        self.signature = signer.sign(&self.signing_payload()).to_vec();
    }

    /// Verify the embedded signature against the receiver's identity key.
    pub fn verify(&self, receiver_key: &PulsePublicKey) -> bool {
        match PulseSignature::parse(&self.signature) {
            Some(sig) => receiver_key.verify(&self.signing_payload(), &sig),
            None => false,
        }
    }
}

/// Either side walking away from a non-terminal session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentCancellationPayload {
    /// The session being cancelled.
    pub request_id: String,
    /// Why.
    pub reason: String,
}
