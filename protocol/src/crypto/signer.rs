//! # Device Signer Boundary
//!
//! On a real phone the long-term Ed25519 key never leaves the secure
//! element: the OS key store performs the actual sign operation and hands
//! back only the signature. This module is that boundary, and it is the
//! only place in the crate where private key material exists at all —
//! the rest of the protocol asks for signatures and public keys, nothing
//! else.
//!
//! [`SoftwareSigner`] is the non-hardware implementation used by tests
//! and the simulator. A production build would provide an implementation
//! backed by the platform keystore behind the same trait.

use std::fmt;
use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

use super::keys::{PulsePublicKey, PulseSignature};

/// Hardware signing collaborator.
///
/// Implementations must be cheap to call from any task — signing happens
/// on every outbound message.
///
/// # Example
///
/// ```
/// use pulse_protocol::crypto::{DeviceSigner, SoftwareSigner};
///
/// let signer = SoftwareSigner::generate();
/// let sig = signer.sign(b"envelope bytes");
/// assert!(signer.public_key().verify(b"envelope bytes", &sig));
/// ```
pub trait DeviceSigner: Send + Sync {
    /// Sign the given canonical bytes with the device's long-term key.
    fn sign(&self, message: &[u8]) -> PulseSignature;

    /// The public half of the long-term key. This is the device identity.
    fn public_key(&self) -> PulsePublicKey;
}

/// An in-memory signer holding the Ed25519 signing key in process memory
/// — which is exactly what the hardware boundary exists to avoid. Use
/// only where a secure element isn't available (tests, simulator,
/// development hosts).
///
/// The key is generated fresh from the OS RNG and zeroized on drop
/// (courtesy of ed25519-dalek). It is never exported: there is no
/// accessor for the secret bytes, here or anywhere else in the crate.
pub struct SoftwareSigner {
    key: SigningKey,
}

impl SoftwareSigner {
    /// Generate a fresh device identity.
    pub fn generate() -> Arc<Self> {
        Arc::new(Self {
            key: SigningKey::generate(&mut OsRng),
        })
    }
}

impl DeviceSigner for SoftwareSigner {
    fn sign(&self, message: &[u8]) -> PulseSignature {
        PulseSignature::from_dalek(self.key.sign(message))
    }

    fn public_key(&self) -> PulsePublicKey {
        PulsePublicKey::from_verifying_key(&self.key.verifying_key())
    }
}

impl fmt::Debug for SoftwareSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The public key identifies the signer; the secret stays out of
        // every log line.
        write!(f, "SoftwareSigner(pub={})", self.public_key().to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_verify_against_the_signer_identity() {
        let signer = SoftwareSigner::generate();
        let sig = signer.sign(b"envelope bytes");
        assert!(signer.public_key().verify(b"envelope bytes", &sig));
    }

    #[test]
    fn signatures_are_deterministic() {
        // Ed25519 is deterministic: same key + same message = same
        // signature. No nonce games at signing time.
        let signer = SoftwareSigner::generate();
        let sig1 = signer.sign(b"determinism is underrated");
        let sig2 = signer.sign(b"determinism is underrated");
        assert_eq!(sig1.to_vec(), sig2.to_vec());
    }

    #[test]
    fn each_generated_signer_is_a_distinct_identity() {
        let a = SoftwareSigner::generate();
        let b = SoftwareSigner::generate();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn identity_is_stable_across_calls() {
        let signer = SoftwareSigner::generate();
        assert_eq!(signer.public_key(), signer.public_key());
    }

    #[test]
    fn debug_does_not_leak_the_secret() {
        let signer = SoftwareSigner::generate();
        let debug_str = format!("{:?}", signer);
        assert!(debug_str.starts_with("SoftwareSigner(pub="));
        assert!(debug_str.contains(&signer.public_key().to_hex()));
    }
}
