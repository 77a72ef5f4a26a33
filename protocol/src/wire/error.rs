//! Error types for the wire protocol codec.
//!
//! Every variant is fatal to the single message it occurred on, never to
//! the connection carrying it. A malformed frame gets logged and dropped;
//! the link keeps running.

use thiserror::Error;

/// Errors that can occur while encoding, decoding, fragmenting, or
/// validating wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// The encoded wire version differs from ours. There is no
    /// cross-version negotiation at short range — the message is refused.
    #[error("unsupported wire protocol version: got {got}, expected {expected}")]
    VersionMismatch {
        /// Version found in the encoded frame.
        got: u16,
        /// Version this implementation speaks.
        expected: u16,
    },

    /// The frame could not be decoded into an envelope.
    #[error("malformed wire data: {0}")]
    Malformed(String),

    /// The envelope overhead alone (id, keys, signature, bookkeeping)
    /// exceeds the fragment budget — no payload could ever fit.
    #[error("envelope overhead exceeds the {mtu}-byte fragment budget")]
    Oversized {
        /// The fragment budget that was exceeded.
        mtu: usize,
    },

    /// A fragment set was handed to reassembly with pieces missing.
    #[error("missing fragments: expected {expected}, got {got}")]
    MissingFragments {
        /// The fragment count declared by the envelope.
        expected: u32,
        /// How many fragments were actually present.
        got: u32,
    },

    /// Fragment sequence numbers do not form a contiguous range —
    /// duplicates or gaps.
    #[error("fragment sequence numbers are not contiguous")]
    OutOfOrder,

    /// A structural field check failed (empty id, zero timestamp, ...).
    #[error("invalid envelope: {0}")]
    Invalid(&'static str),

    /// The message timestamp falls outside the replay window.
    #[error("stale message: age {age_ms}ms exceeds replay window of {max_ms}ms")]
    Stale {
        /// Message age at receipt.
        age_ms: u64,
        /// Configured replay window.
        max_ms: u64,
    },
}
