//! # Payment Engine
//!
//! Drives the five-message payment exchange over the delivery layer and
//! owns every [`PaymentSession`] on this device.
//!
//! ```text
//!   ┌──────────┐                              ┌──────────┐
//!   │  Sender  │                              │ Receiver │
//!   └────┬─────┘                              └────┬─────┘
//!        │  1. PaymentRequest (amount, memo, ttl)  │
//!        ├────────────────────────────────────────►│
//!        │  2. PaymentResponse (accept / reject)   │
//!        │◄────────────────────────────────────────┤
//!        │  3. TransferRecord (signed, nonce)      │
//!        ├────────────────────────────────────────►│
//!        │  4. PaymentConfirmation (signed)        │
//!        │◄────────────────────────────────────────┤
//!        │  PaymentCancellation (either side, any  │
//!        │  time before a terminal state)          │
//! ```
//!
//! Every non-terminal session owns an expiry timer; the timer firing is
//! the *only* liveness mechanism at this layer — link health belongs to
//! the connection manager below. Terminal transitions abort the timer,
//! the timer forces `Expired`, and either way the session record stays
//! around as history.
//!
//! ## Replay protection
//!
//! Transfer nonces are drawn from a per-engine monotonic counter and
//! checked receiver-side against a bounded seen-set (oldest evicted at
//! capacity). A captured transfer record replayed later trips the set and
//! earns a rejection, not a second credit.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config;
use crate::crypto::signer::DeviceSigner;
use crate::delivery::{DeliveryLayer, InboundMessage, SendOptions};
use crate::identity::DeviceId;
use crate::link::manager::LinkManager;
use crate::wire::MessageType;

use super::error::PaymentError;
use super::messages::{
    Currency, PaymentCancellationPayload, PaymentConfirmationPayload, PaymentRequestPayload,
    PaymentResponsePayload, TransferRecord,
};
use super::session::{PaymentRole, PaymentSession, PaymentStatus};
use super::wallet::Wallet;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Payment lifecycle notifications for the application layer.
#[derive(Debug, Clone)]
pub enum PaymentEvent {
    /// An inbound request needs a user decision — answer with
    /// [`PaymentEngine::respond`].
    RequestReceived {
        /// Session / request id.
        request_id: String,
        /// The requesting device.
        peer: DeviceId,
        /// Amount in smallest units.
        amount: u64,
        /// Payment currency.
        currency: Currency,
        /// Human-readable note.
        memo: String,
    },
    /// The peer accepted our request; the transfer is on its way.
    Accepted {
        /// Session id.
        request_id: String,
    },
    /// The peer rejected our request. Terminal.
    Rejected {
        /// Session id.
        request_id: String,
        /// The peer's stated reason, if any.
        reason: Option<String>,
    },
    /// The payment settled on both sides. Terminal.
    Completed {
        /// Session id.
        request_id: String,
        /// Settled transaction id.
        transaction_id: String,
    },
    /// The payment failed. Terminal.
    Failed {
        /// Session id.
        request_id: String,
        /// What went wrong.
        reason: String,
    },
    /// The expiry timer fired first. Terminal.
    Expired {
        /// Session id.
        request_id: String,
    },
}

// ---------------------------------------------------------------------------
// Nonce Set
// ---------------------------------------------------------------------------

/// Bounded set of seen transfer nonces. FIFO eviction keeps memory flat
/// while still covering every nonce a live session could produce.
struct NonceSet {
    seen: HashSet<u64>,
    order: VecDeque<u64>,
    cap: usize,
}

impl NonceSet {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Record a nonce. Returns `false` when it was already present.
    fn insert(&mut self, nonce: u64) -> bool {
        if !self.seen.insert(nonce) {
            return false;
        }
        self.order.push_back(nonce);
        if self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// PaymentEngine
// ---------------------------------------------------------------------------

/// The payment orchestrator. One per device.
pub struct PaymentEngine {
    local_id: DeviceId,
    signer: Arc<dyn DeviceSigner>,
    delivery: Arc<DeliveryLayer>,
    link: Arc<LinkManager>,
    wallet: Arc<Wallet>,
    request_ttl: Duration,
    /// Every session, live and historical, by request id.
    sessions: DashMap<String, PaymentSession>,
    /// Expiry timers for non-terminal sessions.
    expiry_timers: DashMap<String, JoinHandle<()>>,
    /// Seen transfer nonces (receiver side).
    nonces: Mutex<NonceSet>,
    /// Monotonic nonce source (sender side), seeded from the clock so a
    /// restarted engine never reuses a previous run's values.
    nonce_counter: AtomicU64,
    events: broadcast::Sender<PaymentEvent>,
}

impl PaymentEngine {
    /// Create the engine and register its inbound handlers with the
    /// delivery layer.
    pub fn new(
        signer: Arc<dyn DeviceSigner>,
        delivery: Arc<DeliveryLayer>,
        link: Arc<LinkManager>,
        wallet: Arc<Wallet>,
        request_ttl: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let local_id = DeviceId::from_sign_key(&signer.public_key());
        let engine = Arc::new(Self {
            local_id,
            signer,
            delivery,
            link,
            wallet,
            request_ttl,
            sessions: DashMap::new(),
            expiry_timers: DashMap::new(),
            nonces: Mutex::new(NonceSet::new(config::NONCE_CACHE_CAP)),
            nonce_counter: AtomicU64::new(config::unix_millis()),
            events,
        });
        engine.register_handlers();
        engine
    }

    /// Subscribe to payment lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PaymentEvent> {
        self.events.subscribe()
    }

    /// Look up a session (live or historical).
    pub fn session(&self, request_id: &str) -> Option<PaymentSession> {
        self.sessions.get(request_id).map(|s| s.clone())
    }

    /// Every session this engine has seen.
    pub fn sessions(&self) -> Vec<PaymentSession> {
        self.sessions.iter().map(|s| s.clone()).collect()
    }

    /// The wallet backing this engine.
    pub fn wallet(&self) -> &Arc<Wallet> {
        &self.wallet
    }

    // -----------------------------------------------------------------------
    // Sender API
    // -----------------------------------------------------------------------

    /// Ask `peer` to take a payment of `amount` in `currency`.
    ///
    /// Creates the sender-side session, arms its expiry timer, and sends
    /// the request. The rest of the exchange is driven by inbound
    /// messages; watch [`subscribe`](Self::subscribe) for the outcome.
    pub async fn request_payment(
        self: &Arc<Self>,
        peer: &DeviceId,
        amount: u64,
        currency: Currency,
        memo: String,
    ) -> Result<String, PaymentError> {
        if amount == 0 {
            return Err(PaymentError::InvalidAmount);
        }
        if memo.len() > config::MAX_MEMO_LENGTH {
            return Err(PaymentError::MemoTooLong {
                max: config::MAX_MEMO_LENGTH,
            });
        }

        let request_id = Uuid::new_v4().to_string();
        let expires_at_ms = config::unix_millis() + self.request_ttl.as_millis() as u64;

        let payload = PaymentRequestPayload {
            request_id: request_id.clone(),
            amount,
            currency: currency.clone(),
            memo: memo.clone(),
            expires_at_ms,
        };
        let bytes = encode(&payload)?;

        self.sessions.insert(
            request_id.clone(),
            PaymentSession::new_sender(
                request_id.clone(),
                peer.clone(),
                amount,
                currency,
                memo,
                expires_at_ms,
            ),
        );
        self.arm_expiry(request_id.clone(), expires_at_ms);
        info!(request_id = %request_id, peer = %peer, amount, "payment requested");

        if let Err(e) = self
            .delivery
            .send(peer, MessageType::PaymentRequest, &bytes, SendOptions::default())
            .await
        {
            let reason = format!("request delivery failed: {e}");
            self.fail_session(&request_id, &reason, false).await;
            return Err(PaymentError::Delivery(e));
        }
        Ok(request_id)
    }

    /// Cancel a non-terminal session, notifying the peer. Either side may
    /// do this at any point before a terminal state.
    pub async fn cancel(
        self: &Arc<Self>,
        request_id: &str,
        reason: &str,
    ) -> Result<(), PaymentError> {
        let session = self
            .session(request_id)
            .ok_or_else(|| PaymentError::SessionNotFound(request_id.to_string()))?;
        if session.status.is_terminal() {
            return Err(PaymentError::InvalidState {
                id: request_id.to_string(),
                current: format!("{:?}", session.status),
                event: "cancel".into(),
            });
        }

        let payload = PaymentCancellationPayload {
            request_id: request_id.to_string(),
            reason: reason.to_string(),
        };
        let bytes = encode(&payload)?;
        // Best effort: the peer may already be gone, and a cancellation
        // that can't be delivered still terminates our side.
        if let Err(e) = self
            .delivery
            .send(
                &session.peer,
                MessageType::PaymentCancellation,
                &bytes,
                SendOptions::default(),
            )
            .await
        {
            debug!(request_id, error = %e, "cancellation not delivered");
        }

        self.fail_session(request_id, &format!("cancelled: {reason}"), false)
            .await;
        Ok(())
    }

    /// Build, sign, debit, and send the transfer record. Called
    /// automatically when the peer accepts; public so a retried payment
    /// can be re-driven by the application.
    pub async fn send_transfer(self: &Arc<Self>, request_id: &str) -> Result<String, PaymentError> {
        let session = self
            .session(request_id)
            .ok_or_else(|| PaymentError::SessionNotFound(request_id.to_string()))?;

        if session.status == PaymentStatus::Expired || session.is_past_expiry() {
            // The timer may not have fired yet; either way the deadline has.
            self.expire(request_id);
            return Err(PaymentError::SessionExpired(request_id.to_string()));
        }
        if session.role != PaymentRole::Sender || session.status != PaymentStatus::Accepted {
            return Err(PaymentError::InvalidState {
                id: request_id.to_string(),
                current: format!("{:?}", session.status),
                event: "send transfer".into(),
            });
        }

        let (balance_before, balance_after) =
            self.wallet.debit(&session.currency, session.amount)?;

        let mut record = TransferRecord {
            transaction_id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            sender: self.local_id.clone(),
            receiver: session.peer.clone(),
            amount: session.amount,
            currency: session.currency.clone(),
            nonce: self.next_nonce(),
            balance_before,
            balance_after,
            timestamp_ms: config::unix_millis(),
            signature: Vec::new(),
        };
        record.sign_with(self.signer.as_ref());
        let transaction_id = record.transaction_id.clone();
        let bytes = encode(&record)?;

        if let Some(mut s) = self.sessions.get_mut(request_id) {
            s.mark_transfer_sent(transaction_id.clone());
        }
        debug!(request_id, transaction_id = %transaction_id, "transfer record sent");

        if let Err(e) = self
            .delivery
            .send(
                &session.peer,
                MessageType::PaymentTransaction,
                &bytes,
                SendOptions::default(),
            )
            .await
        {
            // The money never left; put it back.
            self.wallet.credit(&session.currency, session.amount);
            let reason = format!("transfer delivery failed: {e}");
            self.fail_session(request_id, &reason, false).await;
            return Err(PaymentError::Delivery(e));
        }
        Ok(transaction_id)
    }

    // -----------------------------------------------------------------------
    // Receiver API
    // -----------------------------------------------------------------------

    /// Answer an inbound payment request.
    pub async fn respond(
        self: &Arc<Self>,
        request_id: &str,
        accept: bool,
        reason: Option<String>,
    ) -> Result<(), PaymentError> {
        let session = self
            .session(request_id)
            .ok_or_else(|| PaymentError::SessionNotFound(request_id.to_string()))?;

        if session.status == PaymentStatus::Expired || session.is_past_expiry() {
            self.expire(request_id);
            return Err(PaymentError::SessionExpired(request_id.to_string()));
        }
        if session.role != PaymentRole::Receiver || session.status != PaymentStatus::Pending {
            return Err(PaymentError::InvalidState {
                id: request_id.to_string(),
                current: format!("{:?}", session.status),
                event: "respond".into(),
            });
        }

        let payload = PaymentResponsePayload {
            request_id: request_id.to_string(),
            accepted: accept,
            reason: reason.clone(),
        };
        let bytes = encode(&payload)?;

        // State first, wire second: the sender's transfer can arrive the
        // instant the response lands, and it must find this session
        // already Accepted.
        if accept {
            if let Some(mut s) = self.sessions.get_mut(request_id) {
                s.mark_accepted();
            }
        } else {
            if let Some(mut s) = self.sessions.get_mut(request_id) {
                s.mark_rejected(reason.clone());
            }
            self.clear_timer(request_id);
            let _ = self.events.send(PaymentEvent::Rejected {
                request_id: request_id.to_string(),
                reason,
            });
        }

        if let Err(e) = self
            .delivery
            .send(
                &session.peer,
                MessageType::PaymentResponse,
                &bytes,
                SendOptions::default(),
            )
            .await
        {
            let failure = format!("response delivery failed: {e}");
            self.fail_session(request_id, &failure, false).await;
            return Err(PaymentError::Delivery(e));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    /// Register one handler per payment message type. Handlers hop onto a
    /// fresh task immediately — the delivery pump must never block on
    /// payment logic.
    fn register_handlers(self: &Arc<Self>) {
        for msg_type in [
            MessageType::PaymentRequest,
            MessageType::PaymentResponse,
            MessageType::PaymentTransaction,
            MessageType::PaymentConfirmation,
            MessageType::PaymentCancellation,
        ] {
            let weak = Arc::downgrade(self);
            self.delivery.register_handler(
                msg_type,
                Box::new(move |inbound| {
                    let Some(engine) = weak.upgrade() else { return };
                    tokio::spawn(async move {
                        engine.dispatch(inbound).await;
                    });
                }),
            );
        }
    }

    async fn dispatch(self: &Arc<Self>, inbound: InboundMessage) {
        match inbound.msg_type {
            MessageType::PaymentRequest => match decode::<PaymentRequestPayload>(&inbound.payload) {
                Ok(p) => self.handle_request(&inbound.peer, p),
                Err(e) => warn!(peer = %inbound.peer, error = %e, "bad payment request payload"),
            },
            MessageType::PaymentResponse => {
                match decode::<PaymentResponsePayload>(&inbound.payload) {
                    Ok(p) => self.handle_response(p).await,
                    Err(e) => warn!(peer = %inbound.peer, error = %e, "bad payment response payload"),
                }
            }
            MessageType::PaymentTransaction => match decode::<TransferRecord>(&inbound.payload) {
                Ok(p) => self.handle_transfer(&inbound.peer, p).await,
                Err(e) => warn!(peer = %inbound.peer, error = %e, "bad transfer record payload"),
            },
            MessageType::PaymentConfirmation => {
                match decode::<PaymentConfirmationPayload>(&inbound.payload) {
                    Ok(p) => self.handle_confirmation(&inbound.peer, p).await,
                    Err(e) => warn!(peer = %inbound.peer, error = %e, "bad confirmation payload"),
                }
            }
            MessageType::PaymentCancellation => {
                match decode::<PaymentCancellationPayload>(&inbound.payload) {
                    Ok(p) => self.handle_cancellation(p).await,
                    Err(e) => warn!(peer = %inbound.peer, error = %e, "bad cancellation payload"),
                }
            }
            ref other => debug!(msg_type = %other, "payment engine ignoring non-payment type"),
        }
    }

    /// Receiver side: a request arrived. Mirror the session and surface it
    /// to the application.
    fn handle_request(self: &Arc<Self>, peer: &DeviceId, request: PaymentRequestPayload) {
        if request.expires_at_ms <= config::unix_millis() {
            // Arrived dead. Silently dropped — the sender's own timer will
            // expire the session on their side.
            debug!(request_id = %request.request_id, "dropping already-expired payment request");
            return;
        }
        if self.sessions.contains_key(&request.request_id) {
            debug!(request_id = %request.request_id, "duplicate payment request ignored");
            return;
        }
        if request.amount == 0 {
            warn!(request_id = %request.request_id, "dropping zero-amount payment request");
            return;
        }

        self.sessions.insert(
            request.request_id.clone(),
            PaymentSession::new_receiver(
                request.request_id.clone(),
                peer.clone(),
                request.amount,
                request.currency.clone(),
                request.memo.clone(),
                request.expires_at_ms,
            ),
        );
        self.arm_expiry(request.request_id.clone(), request.expires_at_ms);
        info!(request_id = %request.request_id, peer = %peer, amount = request.amount, "payment request received");

        let _ = self.events.send(PaymentEvent::RequestReceived {
            request_id: request.request_id,
            peer: peer.clone(),
            amount: request.amount,
            currency: request.currency,
            memo: request.memo,
        });
    }

    /// Sender side: the receiver answered. On acceptance the transfer goes
    /// out immediately — there is nothing to wait for.
    async fn handle_response(self: &Arc<Self>, response: PaymentResponsePayload) {
        let request_id = response.request_id.clone();
        let Some(session) = self.session(&request_id) else {
            warn!(request_id = %request_id, "response for unknown payment session");
            return;
        };
        if session.role != PaymentRole::Sender || session.status != PaymentStatus::Initiated {
            debug!(request_id = %request_id, status = ?session.status, "response ignored in current state");
            return;
        }

        if !response.accepted {
            if let Some(mut s) = self.sessions.get_mut(&request_id) {
                s.mark_rejected(response.reason.clone());
            }
            self.clear_timer(&request_id);
            info!(request_id = %request_id, "payment request rejected by peer");
            let _ = self.events.send(PaymentEvent::Rejected {
                request_id,
                reason: response.reason,
            });
            return;
        }

        if let Some(mut s) = self.sessions.get_mut(&request_id) {
            s.mark_accepted();
        }
        let _ = self.events.send(PaymentEvent::Accepted {
            request_id: request_id.clone(),
        });

        if let Err(e) = self.send_transfer(&request_id).await {
            warn!(request_id = %request_id, error = %e, "transfer failed after acceptance");
            self.fail_session(&request_id, &format!("transfer failed: {e}"), true)
                .await;
        }
    }

    /// Receiver side: the transfer record arrived. Validate everything,
    /// apply the credit, and return a signed verdict.
    async fn handle_transfer(self: &Arc<Self>, peer: &DeviceId, record: TransferRecord) {
        let request_id = record.request_id.clone();
        let Some(session) = self.session(&request_id) else {
            warn!(request_id = %request_id, "transfer for unknown payment session");
            return;
        };
        if session.role != PaymentRole::Receiver || session.status != PaymentStatus::Accepted {
            debug!(request_id = %request_id, status = ?session.status, "transfer ignored in current state");
            return;
        }
        if session.is_past_expiry() {
            self.expire(&request_id);
            self.send_confirmation(peer, &record.transaction_id, false, Some("session expired"))
                .await;
            return;
        }

        // Validation gauntlet. First failure wins and becomes the verdict.
        let verdict: Result<(), &str> = {
            let sender_key = self.link.peer_identity(peer).map(|p| p.sign_key);
            if record.amount != session.amount || record.currency != session.currency {
                Err("transfer does not match the agreed request")
            } else if record.balance_after != record.balance_before.saturating_sub(record.amount) {
                Err("transfer balance arithmetic does not add up")
            } else if !sender_key.map(|k| record.verify(&k)).unwrap_or(false) {
                Err("transfer signature invalid")
            } else if !self.nonces.lock().insert(record.nonce) {
                Err("transfer nonce replayed")
            } else {
                Ok(())
            }
        };

        match verdict {
            Ok(()) => {
                self.wallet.credit(&session.currency, session.amount);
                if let Some(mut s) = self.sessions.get_mut(&request_id) {
                    s.mark_completed(record.transaction_id.clone());
                }
                self.clear_timer(&request_id);
                info!(request_id = %request_id, transaction_id = %record.transaction_id, amount = record.amount, "payment received");

                self.send_confirmation(peer, &record.transaction_id, true, None)
                    .await;
                let _ = self.events.send(PaymentEvent::Completed {
                    request_id,
                    transaction_id: record.transaction_id,
                });
            }
            Err(reason) => {
                warn!(request_id = %request_id, reason, "transfer rejected");
                self.send_confirmation(peer, &record.transaction_id, false, Some(reason))
                    .await;
                self.fail_session(&request_id, reason, false).await;
            }
        }
    }

    /// Sender side: the receiver's verdict arrived. Match it back by
    /// transaction id.
    async fn handle_confirmation(
        self: &Arc<Self>,
        peer: &DeviceId,
        confirmation: PaymentConfirmationPayload,
    ) {
        // Confirmations reference the transaction, not the request.
        let Some(request_id) = self.sessions.iter().find_map(|s| {
            (s.transaction_id.as_deref() == Some(confirmation.transaction_id.as_str()))
                .then(|| s.id.clone())
        }) else {
            warn!(transaction_id = %confirmation.transaction_id, "confirmation for unknown transaction");
            return;
        };

        let Some(session) = self.session(&request_id) else { return };
        if session.role != PaymentRole::Sender || session.status != PaymentStatus::Pending {
            debug!(request_id = %request_id, status = ?session.status, "confirmation ignored in current state");
            return;
        }

        let receiver_key = self.link.peer_identity(peer).map(|p| p.sign_key);
        if !receiver_key.map(|k| confirmation.verify(&k)).unwrap_or(false) {
            warn!(request_id = %request_id, "confirmation signature invalid, ignoring");
            return;
        }

        if confirmation.confirmed {
            if let Some(mut s) = self.sessions.get_mut(&request_id) {
                s.mark_completed(confirmation.transaction_id.clone());
            }
            self.clear_timer(&request_id);
            info!(request_id = %request_id, transaction_id = %confirmation.transaction_id, "payment completed");
            let _ = self.events.send(PaymentEvent::Completed {
                request_id,
                transaction_id: confirmation.transaction_id,
            });
        } else {
            // The transfer was refused; the debit comes back.
            self.wallet.credit(&session.currency, session.amount);
            let reason = confirmation
                .reason
                .unwrap_or_else(|| "transfer rejected by receiver".into());
            self.fail_session(&request_id, &reason, false).await;
        }
    }

    /// Either side: the peer walked away.
    async fn handle_cancellation(self: &Arc<Self>, cancellation: PaymentCancellationPayload) {
        let request_id = cancellation.request_id.clone();
        let Some(session) = self.session(&request_id) else {
            debug!(request_id = %request_id, "cancellation for unknown session ignored");
            return;
        };
        if session.status.is_terminal() {
            return;
        }

        // A sender that already parted with the money gets it back; the
        // transfer was never confirmed.
        if session.role == PaymentRole::Sender && session.status == PaymentStatus::Pending {
            self.wallet.credit(&session.currency, session.amount);
        }
        self.fail_session(
            &request_id,
            &format!("cancelled by peer: {}", cancellation.reason),
            false,
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn send_confirmation(
        self: &Arc<Self>,
        peer: &DeviceId,
        transaction_id: &str,
        confirmed: bool,
        reason: Option<&str>,
    ) {
        let mut confirmation = PaymentConfirmationPayload {
            transaction_id: transaction_id.to_string(),
            confirmed,
            reason: reason.map(str::to_string),
            timestamp_ms: config::unix_millis(),
            signature: Vec::new(),
        };
        confirmation.sign_with(self.signer.as_ref());

        let Ok(bytes) = encode(&confirmation) else { return };
        if let Err(e) = self
            .delivery
            .send(peer, MessageType::PaymentConfirmation, &bytes, SendOptions::default())
            .await
        {
            warn!(transaction_id, error = %e, "confirmation not delivered");
        }
    }

    /// Terminal failure path: mark, disarm the timer, notify, and
    /// optionally tell the peer.
    async fn fail_session(self: &Arc<Self>, request_id: &str, reason: &str, notify_peer: bool) {
        let peer = {
            let Some(mut session) = self.sessions.get_mut(request_id) else { return };
            if session.status.is_terminal() {
                return;
            }
            session.mark_failed(reason);
            session.peer.clone()
        };
        self.clear_timer(request_id);
        let _ = self.events.send(PaymentEvent::Failed {
            request_id: request_id.to_string(),
            reason: reason.to_string(),
        });

        if notify_peer {
            let payload = PaymentCancellationPayload {
                request_id: request_id.to_string(),
                reason: reason.to_string(),
            };
            if let Ok(bytes) = encode(&payload) {
                if let Err(e) = self
                    .delivery
                    .send(&peer, MessageType::PaymentCancellation, &bytes, SendOptions::default())
                    .await
                {
                    debug!(request_id, error = %e, "failure notice not delivered");
                }
            }
        }
    }

    /// Arm the one-and-only timeout mechanism for a session.
    fn arm_expiry(self: &Arc<Self>, request_id: String, expires_at_ms: u64) {
        let weak = Arc::downgrade(self);
        let delay = Duration::from_millis(expires_at_ms.saturating_sub(config::unix_millis()));
        let id = request_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(engine) = weak.upgrade() {
                engine.expire(&id);
            }
        });
        if let Some(old) = self.expiry_timers.insert(request_id, handle) {
            old.abort();
        }
    }

    /// Force a non-terminal session to `Expired`, releasing its resources
    /// exactly as any other terminal transition does.
    fn expire(&self, request_id: &str) {
        let expired = {
            let Some(mut session) = self.sessions.get_mut(request_id) else { return };
            if session.status.is_terminal() {
                false
            } else {
                session.mark_expired();
                true
            }
        };
        self.expiry_timers.remove(request_id);
        if expired {
            info!(request_id, "payment session expired");
            let _ = self.events.send(PaymentEvent::Expired {
                request_id: request_id.to_string(),
            });
        }
    }

    fn clear_timer(&self, request_id: &str) {
        if let Some((_, handle)) = self.expiry_timers.remove(request_id) {
            handle.abort();
        }
    }

    fn next_nonce(&self) -> u64 {
        self.nonce_counter.fetch_add(1, Ordering::SeqCst)
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, PaymentError> {
    bincode::serialize(value).map_err(|e| PaymentError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, PaymentError> {
    bincode::deserialize(bytes).map_err(|e| PaymentError::Serialization(e.to_string()))
}
