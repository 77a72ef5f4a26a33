// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # PULSE Protocol — Core Library
//!
//! PULSE moves money between two phones standing next to each other, with
//! no backend, no cell coverage, and no excuses: a signed, encrypted
//! payment over a short-range radio link.
//!
//! The hard part is not the balance arithmetic — it's the protocol
//! machinery around a radio that drops frames, duplicates them, delivers
//! them out of order, and caps every write at a few hundred bytes. PULSE
//! takes a pragmatic stance on all of it: Ed25519 for signatures (because
//! we're not barbarians), X25519 + BLAKE3 for session keys, and
//! AES-256-GCM for the payload (because NIST got that one right).
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the actual concerns of an
//! offline payment exchange:
//!
//! - **crypto** — Keys, AEAD, key agreement, the signing boundary. Don't
//!   roll your own.
//! - **identity** — Device ids and peer identities. Your keys, your money.
//! - **wire** — The envelope, the codec, fragmentation/reassembly, and the
//!   replay window.
//! - **link** — Radio transport boundary and connection lifecycle: one
//!   session per peer, traffic-as-heartbeat, bounded reconnection.
//! - **delivery** — Queuing, ACK/retry, inbound reassembly and dispatch.
//!   The "reliable" in reliable delivery.
//! - **discovery** — The peer table, trust levels, and ranking.
//! - **payment** — The request/response/transaction/confirmation state
//!   machine. The part that touches money, so the part with the most tests.
//! - **store** — The persistence boundary (trust lists, history).
//! - **engine** — One of each, wired together. The thing a host app holds.
//! - **config** — Protocol constants and policy defaults.
//!
//! ## Design Philosophy
//!
//! 1. Correctness over performance (but we're still fast).
//! 2. No message reaches application code before its signature verifies.
//! 3. One peer's failure never touches another peer's session.
//! 4. If it touches money, it has tests. Plural.

pub mod config;
pub mod crypto;
pub mod delivery;
pub mod discovery;
pub mod engine;
pub mod identity;
pub mod link;
pub mod payment;
pub mod store;
pub mod wire;

pub use engine::{PulseConfig, PulseEngine};
pub use identity::{DeviceId, PeerIdentity};
