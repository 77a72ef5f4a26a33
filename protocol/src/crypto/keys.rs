//! # Public Key Material
//!
//! The key types that cross the wire: a peer's Ed25519 verifying key and
//! the signatures checked against it. That is the whole module — there is
//! deliberately no keypair type here. Private key material exists in
//! exactly one place in this crate, behind the
//! [`DeviceSigner`](super::signer::DeviceSigner) boundary, where on real
//! hardware it never leaves the secure element at all.
//!
//! ## Strict verification
//!
//! [`PulsePublicKey::verify`] uses `verify_strict`, which additionally
//! rejects signatures involving small-order components that lenient
//! Ed25519 implementations wave through. A payment protocol has no
//! legacy peers to stay compatible with, so it takes the strict path.
//!
//! ## Fixed-width signatures
//!
//! Wire formats carry signatures as plain byte vectors; [`PulseSignature::parse`]
//! is the only way back into the typed world. A wrong-length blob fails
//! at the parse, which means the verifier itself only ever sees 64-byte
//! values — one less failure mode to reason about in the hot path.

use ed25519_dalek::{Signature as DalekSignature, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from parsing untrusted key material.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Wrong length, or bytes that don't decode to a curve point.
    #[error("invalid public key bytes")]
    InvalidPublicKey,
}

// ---------------------------------------------------------------------------
// PulsePublicKey
// ---------------------------------------------------------------------------

/// The public half of a device identity: an Ed25519 verifying key.
///
/// Everything a peer is — its device id, the signatures on its envelopes
/// and transfer records — traces back to one of these. Safe to share,
/// log, print on a receipt.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulsePublicKey([u8; 32]);

impl PulsePublicKey {
    /// Parse untrusted key bytes, e.g. from an advertisement payload.
    ///
    /// Rejects wrong lengths and byte strings that don't decode to a
    /// point on the curve. Accepting arbitrary bytes here would only
    /// defer the failure to every later `verify` call.
    pub fn parse(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    /// Wrap a key that already went through dalek's own validation.
    pub(crate) fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check `signature` over `message`.
    ///
    /// One boolean covers every failure mode — bad signature, stored
    /// bytes that stopped being a curve point, anything. Callers get a
    /// yes/no answer, not an oracle.
    pub fn verify(&self, message: &[u8], signature: &PulseSignature) -> bool {
        match VerifyingKey::from_bytes(&self.0) {
            Ok(key) => key.verify_strict(message, &signature.to_dalek()).is_ok(),
            Err(_) => false,
        }
    }

    /// Base58 — the device-id alphabet.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Hex — the logging alphabet. 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PulsePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PulsePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PulsePublicKey({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// PulseSignature
// ---------------------------------------------------------------------------

/// An Ed25519 signature, held at its fixed 64-byte width.
#[derive(Clone, PartialEq, Eq)]
pub struct PulseSignature([u8; 64]);

impl PulseSignature {
    /// Parse signature bytes off the wire. `None` on any length other
    /// than 64 — there is nothing useful to salvage from a truncated
    /// signature.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Wrap a signature freshly produced by dalek.
    pub(crate) fn from_dalek(signature: DalekSignature) -> Self {
        Self(signature.to_bytes())
    }

    fn to_dalek(&self) -> DalekSignature {
        DalekSignature::from_bytes(&self.0)
    }

    /// The signature as owned bytes, for envelope and record fields.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Hex encoding. 128 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PulseSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_str = self.to_hex();
        write!(f, "PulseSignature({}...{})", &hex_str[..8], &hex_str[120..])
    }
}
