//! Error types for the payment state machine.
//!
//! Every variant is terminal to the one payment session it concerns.
//! Failed payments carry human-readable reasons; nothing here tears down
//! a link or touches another session.

use thiserror::Error;

use crate::delivery::DeliveryError;

/// Errors that can occur while driving a payment session.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Zero or otherwise unusable amount.
    #[error("invalid payment amount")]
    InvalidAmount,

    /// The memo exceeds the wire limit.
    #[error("memo too long: limit is {max} bytes")]
    MemoTooLong {
        /// Maximum memo length in bytes.
        max: usize,
    },

    /// The wallet cannot cover the payment.
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Amount the payment needs.
        required: u64,
        /// Amount the wallet holds.
        available: u64,
    },

    /// No session with this id exists.
    #[error("payment session not found: {0}")]
    SessionNotFound(String),

    /// The session has expired; no further steps are possible.
    #[error("payment session expired: {0}")]
    SessionExpired(String),

    /// The session is not in a state where this step is allowed.
    #[error("invalid payment state: session {id} is {current}, cannot {event}")]
    InvalidState {
        /// Session id.
        id: String,
        /// Current status, for the error message.
        current: String,
        /// The step that was attempted.
        event: String,
    },

    /// The transfer nonce was seen before — a replayed record.
    #[error("replayed transaction nonce: {0}")]
    ReplayedNonce(u64),

    /// An embedded payment signature failed verification.
    #[error("payment signature verification failed")]
    InvalidSignature,

    /// The delivery layer could not move the message.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// A payload failed to encode or decode.
    #[error("payment payload serialization failed: {0}")]
    Serialization(String),
}
