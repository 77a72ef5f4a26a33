//! # Payment Layer
//!
//! The request → response → transaction → confirmation exchange that
//! settles a payment between two devices, riding on the delivery layer
//! as a reliable, encrypted channel.
//!
//! - **messages** — the five payload types on the wire.
//! - **session** — the per-payment state machine.
//! - **wallet** — minimal balance ledger backing transfer records.
//! - **engine** — the orchestrator driving it all.

pub mod engine;
pub mod messages;
pub mod session;
pub mod wallet;

mod error;

pub use engine::{PaymentEngine, PaymentEvent};
pub use error::PaymentError;
pub use messages::{
    Currency, PaymentCancellationPayload, PaymentConfirmationPayload, PaymentRequestPayload,
    PaymentResponsePayload, TransferRecord,
};
pub use session::{PaymentRole, PaymentSession, PaymentStatus};
pub use wallet::Wallet;
