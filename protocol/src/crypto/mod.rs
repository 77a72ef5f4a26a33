//! # Cryptographic Primitives & Session Keys
//!
//! Everything that touches key material lives in this module, and key
//! material never leaves it. The rest of the crate sees ciphertext,
//! signatures, and booleans.
//!
//! - **keys** — public key material: verifying keys and signatures.
//! - **signer** — the hardware key-store boundary, the one home of the
//!   long-term private key.
//! - **session** — per-peer X25519 key agreement, session-key lifecycle,
//!   the AES-256-GCM payload framing, and the encrypt-then-sign /
//!   verify-then-decrypt envelope flow.

pub mod keys;
pub mod session;
pub mod signer;

pub use keys::{KeyError, PulsePublicKey, PulseSignature};
pub use session::{CryptoError, SessionCrypto};
pub use signer::{DeviceSigner, SoftwareSigner};
