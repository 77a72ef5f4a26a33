//! # Device Identity
//!
//! A PULSE device id is the human-facing representation of a device's
//! identity: the base58 encoding of its Ed25519 public key. Base58 keeps
//! it short enough to read aloud across a market stall and avoids the
//! characters people confuse (0/O, I/l).
//!
//! A [`PeerIdentity`] is everything one device learns about another before
//! trusting it: the id, the Ed25519 identity key (for verifying envelope
//! and transfer-record signatures), the X25519 agreement key (for deriving
//! a session key), and a display name. Identities are immutable once
//! learned — a peer that shows up with different keys is a different peer.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::keys::PulsePublicKey;

// ---------------------------------------------------------------------------
// DeviceId
// ---------------------------------------------------------------------------

/// A device identifier — base58 of the device's Ed25519 public key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Derive the id from an identity key.
    pub fn from_sign_key(key: &PulsePublicKey) -> Self {
        Self(key.to_base58())
    }

    /// Wrap an arbitrary id string. Radio transports report discovered
    /// devices by whatever id their advertisement carried; the id is only
    /// bound to a key once the full identity is learned.
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Ids are long; eight characters is plenty to tell peers apart in logs.
        let short: String = self.0.chars().take(8).collect();
        write!(f, "DeviceId({}…)", short)
    }
}

// ---------------------------------------------------------------------------
// PeerIdentity
// ---------------------------------------------------------------------------

/// The public identity of a peer device.
///
/// The keys are only *trusted* after a completed key agreement and a
/// verified signature — until then this is just what the peer claims.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Stable device identifier (base58 of `sign_key`).
    pub device_id: DeviceId,
    /// Ed25519 identity key. Verifies every signature the peer produces.
    pub sign_key: PulsePublicKey,
    /// X25519 agreement key. Input to the session key derivation.
    pub agree_key: [u8; 32],
    /// Human-readable name shown in pairing UIs ("Maria's phone").
    pub display_name: String,
}

impl PeerIdentity {
    /// Build an identity, deriving the device id from the signing key.
    pub fn new(sign_key: PulsePublicKey, agree_key: [u8; 32], display_name: String) -> Self {
        Self {
            device_id: DeviceId::from_sign_key(&sign_key),
            sign_key,
            agree_key,
            display_name,
        }
    }
}
