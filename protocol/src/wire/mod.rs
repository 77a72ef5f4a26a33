//! # Wire Protocol
//!
//! Envelope format, binary codec, fragmentation/reassembly, and
//! structural/freshness validation. This layer knows nothing about keys
//! or payments — it moves signed byte envelopes and tells you when they
//! don't add up.

pub mod codec;
pub mod message;

mod error;

pub use codec::{deserialize, fragment, reassemble, serialize};
pub use error::WireError;
pub use message::{AckPayload, MessageType, WireMessage};
