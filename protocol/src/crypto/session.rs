//! # Session Crypto
//!
//! Per-peer session keys for PULSE: key agreement, payload encryption, and
//! whole-envelope signing.
//!
//! ## Key agreement
//!
//! Each device carries a static X25519 agreement keypair alongside its
//! Ed25519 identity key. [`SessionCrypto::agree_key`] runs a static-static
//! Diffie-Hellman against the peer's agreement public key and feeds the
//! result through BLAKE3's `derive_key` mode with a domain-separation
//! context. Both sides derive the same 256-bit session key with no further
//! round trips — which is exactly what a radio link that may drop at any
//! moment needs.
//!
//! The raw Diffie-Hellman output is NOT used directly as an encryption key.
//! That would be a textbook mistake — DH outputs are points on an elliptic
//! curve with algebraic structure, not uniformly random bytes. The KDF
//! extracts the entropy and binds the key to this specific peer pair by
//! mixing in both public keys in canonical (sorted) order.
//!
//! ## Encrypt, then sign
//!
//! [`SessionCrypto::encrypt_and_sign`] replaces an envelope's payload with
//! AES-256-GCM ciphertext and then signs the *entire* envelope with the
//! long-term key. The receiving side runs [`SessionCrypto::verify_and_decrypt`]:
//! signature first, fail closed on mismatch, only then decrypt. A message
//! that was fragmented in transit must be fully reassembled before either
//! step can run — no partial plaintext ever exists on the receiver.
//!
//! ## AEAD frame format
//!
//! A sealed payload is one buffer: a fresh random 96-bit nonce followed
//! by the GCM ciphertext with its 16-byte tag. GCM is notoriously
//! unforgiving about nonce reuse (reuse once and an attacker recovers
//! plaintext XORs and can forge tags), so every seal draws a new nonce
//! from the OS CSPRNG. The birthday bound on 96-bit random nonces is
//! ~2^48 messages per key; session keys expire after an hour, which
//! keeps reality many orders of magnitude away from that cliff.
//!
//! ## What never leaves this module
//!
//! Session keys and the agreement secret. Callers get ciphertext,
//! signatures, and booleans. That's it.

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::debug;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::config::{self, AES_KEY_LENGTH, AES_NONCE_LENGTH, AES_TAG_LENGTH};
use crate::identity::DeviceId;
use crate::wire::message::WireMessage;

use super::keys::{PulsePublicKey, PulseSignature};
use super::signer::DeviceSigner;

/// Errors produced by session crypto operations.
///
/// Every variant is fatal to the message it occurred on and to nothing
/// else. A bad signature never tears down a link — it just means this
/// particular envelope is garbage.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// No session key has been agreed with this peer.
    #[error("no session established with peer {0}")]
    NoSession(DeviceId),

    /// The session key exists but has passed its expiry.
    #[error("session with peer {0} has expired")]
    Expired(DeviceId),

    /// Envelope signature verification failed. Fail closed — the payload
    /// is never decrypted after this.
    #[error("envelope signature verification failed")]
    InvalidSignature,

    /// Sealing a payload failed.
    #[error("payload encryption failed")]
    SealFailed,

    /// Opening a payload failed: wrong key, tampered ciphertext, or a
    /// frame too short to even hold a nonce and tag. Deliberately one
    /// variant — the distinction is none of an attacker's business.
    #[error("payload decryption failed")]
    OpenFailed,
}

/// A derived session key with its validity window.
struct SessionKeyRecord {
    key: [u8; AES_KEY_LENGTH],
    created_at_ms: u64,
    expires_at_ms: u64,
}

/// Per-peer session key management plus envelope sign/verify.
///
/// One instance per device, created at engine startup and shared (via
/// `Arc`) with the link manager and delivery layer. The agreement secret
/// is generated here and never exported; only the public half is exposed
/// for inclusion in the device's advertised identity.
pub struct SessionCrypto {
    /// Static X25519 agreement secret. Lives for the process lifetime.
    agree_secret: StaticSecret,
    /// Public half of the agreement key, advertised to peers.
    agree_public: [u8; 32],
    /// Long-term signing boundary (hardware-backed in production).
    signer: Arc<dyn DeviceSigner>,
    /// Validity window applied to every derived session key.
    session_ttl: Duration,
    /// Active session keys, keyed by peer device id.
    sessions: DashMap<DeviceId, SessionKeyRecord>,
}

impl SessionCrypto {
    /// Create a session crypto component with a fresh agreement keypair.
    pub fn new(signer: Arc<dyn DeviceSigner>, session_ttl: Duration) -> Self {
        let agree_secret = StaticSecret::random_from_rng(OsRng);
        let agree_public = X25519PublicKey::from(&agree_secret).to_bytes();
        Self {
            agree_secret,
            agree_public,
            signer,
            session_ttl,
            sessions: DashMap::new(),
        }
    }

    /// The X25519 public key peers use to agree a session key with us.
    pub fn agree_public_bytes(&self) -> [u8; 32] {
        self.agree_public
    }

    /// The device's long-term verifying key (identity).
    pub fn sign_public_key(&self) -> PulsePublicKey {
        self.signer.public_key()
    }

    /// Derive and store a session key for `peer`.
    ///
    /// Deterministic for a given pair of agreement keys: calling this on
    /// both devices, each with the other's public key, yields the same
    /// session key without any secret crossing the air. Re-running it for
    /// a peer replaces (supersedes) any previous session key.
    pub fn agree_key(&self, peer: &DeviceId, peer_agree_key: &[u8; 32]) {
        let peer_pk = X25519PublicKey::from(*peer_agree_key);
        let shared = self.agree_secret.diffie_hellman(&peer_pk);
        let key = derive_session_key(shared.as_bytes(), &self.agree_public, peer_agree_key);

        let now = config::unix_millis();
        let record = SessionKeyRecord {
            key,
            created_at_ms: now,
            expires_at_ms: now + self.session_ttl.as_millis() as u64,
        };
        debug!(peer = %peer, expires_at_ms = record.expires_at_ms, "session key agreed");
        self.sessions.insert(peer.clone(), record);
    }

    /// Encrypt `plaintext` under the session key for `peer`.
    ///
    /// Output is `nonce || ciphertext` with a fresh random nonce per call.
    pub fn encrypt(&self, peer: &DeviceId, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.session_key(peer)?;
        seal(&key, plaintext)
    }

    /// Decrypt `data` (as produced by [`encrypt`](Self::encrypt)) under the
    /// session key for `peer`.
    pub fn decrypt(&self, peer: &DeviceId, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.session_key(peer)?;
        open(&key, data)
    }

    /// Sign an envelope with the long-term device key.
    ///
    /// Signs over the canonical representation of every envelope field
    /// except the signature itself.
    pub fn sign(&self, message: &WireMessage) -> PulseSignature {
        self.signer.sign(&message.signing_payload())
    }

    /// Verify an envelope signature against the peer's identity key.
    /// A signature of the wrong width fails here, before any curve math.
    pub fn verify(&self, message: &WireMessage, peer_sign_key: &PulsePublicKey) -> bool {
        match PulseSignature::parse(&message.signature) {
            Some(sig) => peer_sign_key.verify(&message.signing_payload(), &sig),
            None => false,
        }
    }

    /// Encrypt the payload and sign the resulting envelope, in that order.
    ///
    /// The signature therefore covers the ciphertext — a receiver can
    /// reject a tampered envelope before spending any cycles on AEAD.
    pub fn encrypt_and_sign(
        &self,
        mut message: WireMessage,
        peer: &DeviceId,
    ) -> Result<WireMessage, CryptoError> {
        message.payload = self.encrypt(peer, &message.payload)?;
        message.signature = self.sign(&message).to_vec();
        Ok(message)
    }

    /// Verify the envelope signature, then decrypt the payload.
    ///
    /// Verification failure is terminal for the message
    /// ([`CryptoError::InvalidSignature`]) and the payload is never touched.
    pub fn verify_and_decrypt(
        &self,
        message: &WireMessage,
        peer: &DeviceId,
        peer_sign_key: &PulsePublicKey,
    ) -> Result<Vec<u8>, CryptoError> {
        if !self.verify(message, peer_sign_key) {
            return Err(CryptoError::InvalidSignature);
        }
        self.decrypt(peer, &message.payload)
    }

    /// Drop the session key for `peer`, if any.
    pub fn revoke(&self, peer: &DeviceId) {
        if self.sessions.remove(peer).is_some() {
            debug!(peer = %peer, "session key revoked");
        }
    }

    /// Whether a live (non-expired) session exists for `peer`.
    ///
    /// An expired record found here is revoked on the spot, so a `false`
    /// answer always means "no usable key remains".
    pub fn has_valid_session(&self, peer: &DeviceId) -> bool {
        let now = config::unix_millis();
        let expired = match self.sessions.get(peer) {
            Some(record) => now >= record.expires_at_ms,
            None => return false,
        };
        if expired {
            self.revoke(peer);
            return false;
        }
        true
    }

    /// When the session with `peer` was established, if one exists.
    pub fn session_established_at(&self, peer: &DeviceId) -> Option<u64> {
        self.sessions.get(peer).map(|r| r.created_at_ms)
    }

    /// Drop every session key. Used at shutdown.
    pub fn expire_all(&self) {
        self.sessions.clear();
    }

    /// Fetch the live session key for `peer`, enforcing expiry.
    fn session_key(&self, peer: &DeviceId) -> Result<[u8; AES_KEY_LENGTH], CryptoError> {
        let record = self
            .sessions
            .get(peer)
            .ok_or_else(|| CryptoError::NoSession(peer.clone()))?;
        if config::unix_millis() >= record.expires_at_ms {
            drop(record);
            self.revoke(peer);
            return Err(CryptoError::Expired(peer.clone()));
        }
        Ok(record.key)
    }
}

/// Seal `plaintext` under `key`: draw a fresh 96-bit nonce and return it
/// with the ciphertext+tag appended, as one buffer. The frame starts life
/// as the nonce and grows — the caller never handles the nonce separately.
fn seal(key: &[u8; AES_KEY_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut frame = vec![0u8; AES_NONCE_LENGTH];
    OsRng.fill_bytes(&mut frame);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&frame), plaintext)
        .map_err(|_| CryptoError::SealFailed)?;

    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Open a frame produced by [`seal`]. The shortest legitimate frame is a
/// nonce plus the tag of an empty plaintext; anything shorter is refused
/// before the cipher is even constructed.
fn open(key: &[u8; AES_KEY_LENGTH], frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if frame.len() < AES_NONCE_LENGTH + AES_TAG_LENGTH {
        return Err(CryptoError::OpenFailed);
    }
    let (nonce, ciphertext) = frame.split_at(AES_NONCE_LENGTH);
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::OpenFailed)
}

/// Derive a session key from the DH shared secret and both public keys.
///
/// The construction is:
///
///   session_key = BLAKE3-derive-key(
///     context = "pulse-protocol v1 session key",
///     input   = shared_secret || min(pub_a, pub_b) || max(pub_a, pub_b)
///   )
///
/// The two public keys are sorted into canonical (lexicographic) order so
/// that both sides of the exchange derive the same session key regardless
/// of which is "ours" vs "peer". Including them at all binds the key to
/// this specific peer pair.
fn derive_session_key(
    shared_secret: &[u8; 32],
    our_public: &[u8; 32],
    peer_public: &[u8; 32],
) -> [u8; AES_KEY_LENGTH] {
    let mut hasher = blake3::Hasher::new_derive_key("pulse-protocol v1 session key");
    hasher.update(shared_secret);

    let (first, second) = if our_public <= peer_public {
        (our_public, peer_public)
    } else {
        (peer_public, our_public)
    };
    hasher.update(first);
    hasher.update(second);

    let mut session_key = [0u8; AES_KEY_LENGTH];
    let mut output_reader = hasher.finalize_xof();
    output_reader.fill(&mut session_key);
    session_key
}
