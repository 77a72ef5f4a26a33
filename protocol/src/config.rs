//! # Protocol Configuration & Constants
//!
//! Every magic number in PULSE lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Most of these values are negotiated implicitly by both devices agreeing
//! on the same protocol version, so changing them is a wire-format break.
//! The timing knobs at the bottom are local policy and safe to tune.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Protocol magic bytes. Every PULSE frame family is identified by these
/// 4 bytes in the advertisement payload so scanners can reject non-PULSE
/// devices without connecting.
pub const PROTOCOL_MAGIC: u32 = 0x50554C53; // "PULS" in ASCII hex. Yes, we're that cute.

/// Wire protocol version. Bumped on any breaking change to the envelope
/// layout. A device that sees a different version on the wire refuses the
/// message outright — there is no cross-version negotiation at short range.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// The full crate version string, assembled at compile time so we don't
/// allocate for something this trivial at runtime.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Ed25519 — the only sane choice for signatures in 2024+.
pub const SIGNING_ALGORITHM: &str = "Ed25519";

/// Public (verifying) key length in bytes.
pub const VERIFYING_KEY_LENGTH: usize = 32;

/// Ed25519 signature length. Always 64 bytes. If yours isn't, something
/// has gone terribly wrong.
pub const SIGNATURE_LENGTH: usize = 64;

/// X25519 for the per-peer key agreement. Same curve as Ed25519 but in
/// Montgomery form — because mathematicians enjoy making things confusing.
pub const KEY_EXCHANGE_ALGORITHM: &str = "X25519";

/// AES-256-GCM for session encryption. 256-bit keys, 96-bit nonces,
/// 128-bit authentication tags. The holy trinity of authenticated encryption.
pub const SYMMETRIC_ALGORITHM: &str = "AES-256-GCM";

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. 96 bits is the standard and the only
/// length you should use. 12 bytes. Not 16. Not 8. Twelve.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// How long a derived session key stays valid before both sides must run
/// the key agreement again. One hour comfortably outlives any plausible
/// face-to-face payment exchange.
pub const SESSION_TTL: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Wire Limits
// ---------------------------------------------------------------------------

/// Default maximum size of a single radio write, in bytes. Short-range
/// transports negotiate their real MTU per connection; 512 is the common
/// ceiling for data-length-extended links and a safe default when the
/// transport doesn't tell us better.
pub const DEFAULT_MTU: usize = 512;

/// Replay window: messages whose timestamp is older than this are rejected
/// as stale. Five minutes tolerates clock skew between two phones without
/// leaving captured traffic replayable for long.
pub const REPLAY_WINDOW: Duration = Duration::from_secs(300);

/// Maximum memo field length in bytes. Enough for a short message,
/// not enough for your novel.
pub const MAX_MEMO_LENGTH: usize = 512;

/// Capacity of the seen-nonce set used to reject replayed transfer records.
/// Oldest entries are evicted once the cap is reached, which bounds memory
/// while still covering every nonce a live session could plausibly produce.
pub const NONCE_CACHE_CAP: usize = 1024;

/// Capacity of the delivery layer's seen-message-id cache. Duplicate
/// arrivals (a retry whose first copy actually landed) are re-ACKed but
/// not re-dispatched.
pub const SEEN_MESSAGE_CACHE_CAP: usize = 4096;

// ---------------------------------------------------------------------------
// Connection Policy
// ---------------------------------------------------------------------------

/// Maximum simultaneous authenticated links. Short-range radios degrade
/// quickly past a handful of connections, and a payment device rarely
/// needs more than one peer at a time anyway.
pub const MAX_CONNECTIONS: usize = 8;

/// Heartbeat check interval. Any inbound traffic counts as a heartbeat,
/// so an active exchange never pays for a dedicated keepalive message.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A peer is considered silent when nothing has arrived within this window.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive silent heartbeat windows before the link is forced down.
pub const MAX_MISSED_HEARTBEATS: u32 = 3;

/// Reconnect attempts issued after an unexpected disconnect before the
/// peer is dropped back to discovery.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Fixed delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Delivery Policy
// ---------------------------------------------------------------------------

/// How long a sender waits for an acknowledgment before treating the
/// attempt as failed.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum send attempts for one logical message (first try included).
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Fixed backoff between whole-message retries. Retrying the entire
/// message rather than individual fragments keeps the receiver's
/// reassembly state trivial.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Payment Policy
// ---------------------------------------------------------------------------

/// Lifetime of a payment request. If the receiver hasn't driven the
/// session to a terminal state within this window, it expires.
pub const PAYMENT_REQUEST_TTL: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Utility
// ---------------------------------------------------------------------------

/// Milliseconds since the Unix epoch. The single clock used for every
/// timestamp that crosses the wire; monotonic clocks stay internal to
/// timers because the peer can't see them.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_magic_is_valid_ascii() {
        // The magic bytes should decode to a readable 4-char ASCII tag.
        let bytes = PROTOCOL_MAGIC.to_be_bytes();
        assert!(bytes.iter().all(|b| b.is_ascii_alphanumeric()));
        assert_eq!(&bytes, b"PULS");
    }

    #[test]
    fn test_crypto_parameter_sizes() {
        assert_eq!(VERIFYING_KEY_LENGTH, 32);
        assert_eq!(SIGNATURE_LENGTH, 64);
        assert_eq!(AES_KEY_LENGTH, 32);
        assert_eq!(AES_NONCE_LENGTH, 12);
        assert_eq!(AES_TAG_LENGTH, 16);
    }

    #[test]
    fn test_timing_constants_sanity() {
        // The silence window must cover at least one heartbeat interval,
        // otherwise every tick would count as a miss.
        assert!(CONNECTION_TIMEOUT >= HEARTBEAT_INTERVAL);
        assert!(REPLAY_WINDOW.as_secs() > 0);
        assert!(ACK_TIMEOUT > RETRY_BACKOFF);
    }

    #[test]
    fn test_mtu_leaves_room_for_envelope() {
        // A fragment envelope (id, keys, signature, bookkeeping) costs on
        // the order of 200 bytes; the default MTU must leave actual payload
        // capacity after that.
        assert!(DEFAULT_MTU >= 384);
    }

    #[test]
    fn test_unix_millis_advances() {
        let a = unix_millis();
        assert!(a > 1_600_000_000_000); // sometime after Sep 2020
    }
}
