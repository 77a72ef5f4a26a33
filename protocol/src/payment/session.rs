//! # Payment Session State Machine
//!
//! One [`PaymentSession`] per payment attempt, on each side of the link.
//! The status walks a fixed graph and nothing ever moves a terminal
//! session again — history is history.
//!
//! ```text
//!           sender                         receiver
//!           ──────                         ────────
//!          Initiated ──request──────────► Pending
//!              │                             │ respond
//!              │◄─────────response───────────┤
//!        Accepted/Rejected             Accepted/Rejected
//!              │ transfer sent               │
//!           Pending ──transaction─────────► (validate + apply)
//!              │◄───────confirmation─────────┤
//!       Completed/Failed              Completed/Failed
//!
//!   any non-terminal state ──timer──► Expired
//!   any non-terminal state ──cancellation──► Failed
//! ```

use serde::{Deserialize, Serialize};

use crate::config;
use crate::identity::DeviceId;

use super::messages::Currency;

// ---------------------------------------------------------------------------
// Role & Status
// ---------------------------------------------------------------------------

/// Which side of the payment this session represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentRole {
    /// The device paying.
    Sender,
    /// The device being paid.
    Receiver,
}

/// Lifecycle status of a payment session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// Request sent, no answer yet (sender side).
    Initiated,
    /// Awaiting the next protocol step: the receiver's decision, or —
    /// after the transfer is sent — the receiver's confirmation.
    Pending,
    /// Request accepted; the transfer may proceed.
    Accepted,
    /// Terminal: the receiver declined the request.
    Rejected,
    /// Terminal: transfer applied and confirmed.
    Completed,
    /// Terminal: something went wrong; see the failure reason.
    Failed,
    /// Terminal: the expiry timer fired first.
    Expired,
}

impl PaymentStatus {
    /// Whether this status ends the session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Completed | Self::Failed | Self::Expired
        )
    }
}

// ---------------------------------------------------------------------------
// PaymentSession
// ---------------------------------------------------------------------------

/// The per-payment state record. Terminal sessions are retained for
/// history and never mutated again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSession {
    /// Session id — identical to the request id on both sides.
    pub id: String,
    /// The other device in this payment.
    pub peer: DeviceId,
    /// Which side we are.
    pub role: PaymentRole,
    /// Amount in the currency's smallest unit.
    pub amount: u64,
    /// Payment currency.
    pub currency: Currency,
    /// Human-readable note.
    pub memo: String,
    /// Current status.
    pub status: PaymentStatus,
    /// Unix ms the session was created.
    pub created_at_ms: u64,
    /// Unix ms the expiry timer fires.
    pub expires_at_ms: u64,
    /// Transaction id, once a transfer record exists.
    pub transaction_id: Option<String>,
    /// Why the session failed, for terminal failures.
    pub failure_reason: Option<String>,
}

impl PaymentSession {
    /// Create the sender-side session for an outbound request.
    pub fn new_sender(
        id: String,
        peer: DeviceId,
        amount: u64,
        currency: Currency,
        memo: String,
        expires_at_ms: u64,
    ) -> Self {
        Self {
            id,
            peer,
            role: PaymentRole::Sender,
            amount,
            currency,
            memo,
            status: PaymentStatus::Initiated,
            created_at_ms: config::unix_millis(),
            expires_at_ms,
            transaction_id: None,
            failure_reason: None,
        }
    }

    /// Create the mirrored receiver-side session for an inbound request.
    pub fn new_receiver(
        id: String,
        peer: DeviceId,
        amount: u64,
        currency: Currency,
        memo: String,
        expires_at_ms: u64,
    ) -> Self {
        Self {
            id,
            peer,
            role: PaymentRole::Receiver,
            amount,
            currency,
            memo,
            status: PaymentStatus::Pending,
            created_at_ms: config::unix_millis(),
            expires_at_ms,
            transaction_id: None,
            failure_reason: None,
        }
    }

    /// Request accepted (receiver decided, or sender learned of it).
    pub fn mark_accepted(&mut self) {
        if matches!(self.status, PaymentStatus::Initiated | PaymentStatus::Pending) {
            self.status = PaymentStatus::Accepted;
        }
    }

    /// Request rejected. Terminal.
    pub fn mark_rejected(&mut self, reason: Option<String>) {
        if matches!(self.status, PaymentStatus::Initiated | PaymentStatus::Pending) {
            self.status = PaymentStatus::Rejected;
            self.failure_reason = reason;
        }
    }

    /// Sender dispatched the transfer record; back to waiting.
    pub fn mark_transfer_sent(&mut self, transaction_id: String) {
        if self.status == PaymentStatus::Accepted {
            self.transaction_id = Some(transaction_id);
            self.status = PaymentStatus::Pending;
        }
    }

    /// Transfer applied and confirmed. Terminal.
    pub fn mark_completed(&mut self, transaction_id: String) {
        if matches!(self.status, PaymentStatus::Accepted | PaymentStatus::Pending) {
            self.transaction_id = Some(transaction_id);
            self.status = PaymentStatus::Completed;
        }
    }

    /// The session failed. Terminal. No-op on already-terminal sessions.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = PaymentStatus::Failed;
            self.failure_reason = Some(reason.into());
        }
    }

    /// The expiry timer fired. Terminal. No-op on terminal sessions.
    pub fn mark_expired(&mut self) {
        if !self.status.is_terminal() {
            self.status = PaymentStatus::Expired;
        }
    }

    /// Whether the wall clock has passed this session's deadline.
    pub fn is_past_expiry(&self) -> bool {
        config::unix_millis() >= self.expires_at_ms
    }
}
