//! # Pulse Engine
//!
//! The top-level runtime entity: owns one of each component, wires them
//! together at startup, and runs the small glue loops (accepting inbound
//! connections, pumping frames into delivery, reacting to trust changes)
//! that no single component should own by itself.
//!
//! Construction is plain dependency injection — the host hands in its
//! radio, its key store, and its persistence, and gets back a ready
//! engine. No globals, no singletons, nothing to reach around.
//!
//! ```text
//! DeviceSigner ───┐
//! RadioTransport ─┼─► PulseEngine ├─ SessionCrypto
//! TrustStore ─────┘                ├─ LinkManager ── heartbeats, reconnects
//!                                  ├─ DeliveryLayer ── queues, ACKs, retries
//!                                  ├─ PeerRegistry ── discovery, trust
//!                                  └─ PaymentEngine ── the actual payments
//! ```
//!
//! The device identity (id, signing key, agreement key) is derived from
//! the signer and the session crypto. Hosts that need the identity before
//! the engine exists — to register it with an advertising radio, say —
//! build the [`SessionCrypto`] themselves and use
//! [`PulseEngine::with_crypto`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config;
use crate::crypto::session::SessionCrypto;
use crate::crypto::signer::DeviceSigner;
use crate::delivery::DeliveryLayer;
use crate::discovery::{DiscoveryEvent, PeerRegistry, TrustLevel};
use crate::identity::{DeviceId, PeerIdentity};
use crate::link::manager::{LinkConfig, LinkError, LinkEvent, LinkManager};
use crate::link::radio::{RadioError, RadioTransport, ScanFilter};
use crate::payment::engine::PaymentEngine;
use crate::payment::wallet::Wallet;
use crate::store::TrustStore;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct PulseConfig {
    /// Name shown to peers in pairing UIs.
    pub display_name: String,
    /// Largest single radio write, in bytes.
    pub mtu: usize,
    /// Connection policy.
    pub link: LinkConfig,
    /// Session key lifetime.
    pub session_ttl: Duration,
    /// Payment request lifetime.
    pub payment_request_ttl: Duration,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            display_name: "pulse device".into(),
            mtu: config::DEFAULT_MTU,
            link: LinkConfig::default(),
            session_ttl: config::SESSION_TTL,
            payment_request_ttl: config::PAYMENT_REQUEST_TTL,
        }
    }
}

// ---------------------------------------------------------------------------
// PulseEngine
// ---------------------------------------------------------------------------

/// A fully wired PULSE protocol engine. One per device.
pub struct PulseEngine {
    identity: PeerIdentity,
    link: Arc<LinkManager>,
    delivery: Arc<DeliveryLayer>,
    registry: Arc<PeerRegistry>,
    payments: Arc<PaymentEngine>,
    radio: Arc<dyn RadioTransport>,
}

impl PulseEngine {
    /// Build an engine from its three external collaborators, generating
    /// the agreement keypair internally.
    pub fn new(
        signer: Arc<dyn DeviceSigner>,
        radio: Arc<dyn RadioTransport>,
        store: Arc<dyn TrustStore>,
        config: PulseConfig,
    ) -> Arc<Self> {
        let crypto = Arc::new(SessionCrypto::new(Arc::clone(&signer), config.session_ttl));
        Self::with_crypto(signer, crypto, radio, store, config)
    }

    /// Build an engine around an existing [`SessionCrypto`].
    ///
    /// Use this when the device identity must exist before the engine —
    /// e.g. to register it with the radio's advertising side first.
    pub fn with_crypto(
        signer: Arc<dyn DeviceSigner>,
        crypto: Arc<SessionCrypto>,
        radio: Arc<dyn RadioTransport>,
        store: Arc<dyn TrustStore>,
        config: PulseConfig,
    ) -> Arc<Self> {
        let identity = PeerIdentity::new(
            crypto.sign_public_key(),
            crypto.agree_public_bytes(),
            config.display_name.clone(),
        );
        let link = LinkManager::new(Arc::clone(&radio), Arc::clone(&crypto), config.link.clone());
        let delivery = DeliveryLayer::new(
            identity.device_id.clone(),
            Arc::clone(&link),
            crypto,
            config.mtu,
        );
        let registry = Arc::new(PeerRegistry::new(store));
        let wallet = Arc::new(Wallet::new());
        let payments = PaymentEngine::new(
            signer,
            Arc::clone(&delivery),
            Arc::clone(&link),
            wallet,
            config.payment_request_ttl,
        );

        info!(device = %identity.device_id, name = %identity.display_name, "pulse engine created");
        Arc::new(Self {
            identity,
            link,
            delivery,
            registry,
            payments,
            radio,
        })
    }

    /// Start the glue loops: accept inbound connections, wire delivery
    /// pumps, and enforce blocks. Call once after construction.
    pub fn start(self: &Arc<Self>) {
        self.spawn_accept_loop();
        self.spawn_link_event_loop();
        self.spawn_trust_event_loop();
    }

    /// Begin scanning and feed sightings into the registry.
    pub async fn start_discovery(self: &Arc<Self>, filter: ScanFilter) -> Result<(), RadioError> {
        let mut sightings = self.radio.scan(filter).await?;
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            while let Some(sighting) = sightings.recv().await {
                registry.observe(&sighting);
            }
            debug!("discovery stream ended");
        });
        Ok(())
    }

    /// Connect to a peer and leave the session ready for traffic.
    pub async fn connect(self: &Arc<Self>, peer: &PeerIdentity) -> Result<(), LinkError> {
        if self.registry.trust_level(&peer.device_id) == TrustLevel::Blocked {
            return Err(LinkError::Radio(RadioError::ConnectFailed(
                "peer is blocked".into(),
            )));
        }
        self.link.connect(peer).await
    }

    /// Disconnect from a peer. Idempotent.
    pub async fn disconnect(self: &Arc<Self>, peer: &DeviceId) {
        self.link.disconnect(peer).await;
    }

    /// Tear everything down.
    pub async fn shutdown(self: &Arc<Self>) {
        self.link.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// This device's advertised identity.
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// This device's id.
    pub fn device_id(&self) -> &DeviceId {
        &self.identity.device_id
    }

    /// The payment orchestrator.
    pub fn payments(&self) -> &Arc<PaymentEngine> {
        &self.payments
    }

    /// The peer table and trust state.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// The delivery layer, for custom message types.
    pub fn delivery(&self) -> &Arc<DeliveryLayer> {
        &self.delivery
    }

    /// The connection manager.
    pub fn link(&self) -> &Arc<LinkManager> {
        &self.link
    }

    // -----------------------------------------------------------------------
    // Glue loops
    // -----------------------------------------------------------------------

    /// Accept inbound connections: register the session (unless the peer
    /// is blocked or we're full) and let the link event loop wire the pump.
    fn spawn_accept_loop(self: &Arc<Self>) {
        let radio = Arc::clone(&self.radio);
        let link = Arc::clone(&self.link);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            loop {
                let incoming = match radio.next_incoming().await {
                    Ok(i) => i,
                    Err(e) => {
                        debug!(error = %e, "accept loop ending");
                        break;
                    }
                };
                if registry.trust_level(&incoming.peer.device_id) == TrustLevel::Blocked {
                    debug!(peer = %incoming.peer.device_id, "refusing connection from blocked peer");
                    let _ = incoming.link.close().await;
                    continue;
                }
                if let Err(e) = link.attach_incoming(&incoming.peer, Arc::clone(&incoming.link)) {
                    warn!(peer = %incoming.peer.device_id, error = %e, "refusing inbound connection");
                    let _ = incoming.link.close().await;
                }
            }
        });
    }

    /// React to session lifecycle: wire the delivery pump on connect,
    /// cancel in-flight work on disconnect.
    fn spawn_link_event_loop(self: &Arc<Self>) {
        let mut events = self.link.subscribe();
        let link = Arc::clone(&self.link);
        let delivery = Arc::clone(&self.delivery);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    // A lagged receiver missed some events but the loop
                    // must keep serving the ones still coming.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                match event {
                    LinkEvent::Connected(peer) => {
                        if let Some(session_link) = link.session_link(&peer) {
                            // take_notifications is single-consumer, so a
                            // reconnected session can't end up double-pumped.
                            if let Some(frames) = session_link.take_notifications() {
                                delivery.spawn_pump(peer.clone(), frames);
                            }
                        }
                        registry.note_connected(&peer, true);
                    }
                    LinkEvent::Disconnected { peer, .. } => {
                        delivery.abort_peer(&peer);
                        registry.note_connected(&peer, false);
                    }
                    LinkEvent::ReconnectExhausted(peer) => {
                        debug!(peer = %peer, "peer dropped after reconnect attempts");
                    }
                }
            }
        });
    }

    /// Enforce blocks: a peer blocked mid-session gets disconnected.
    fn spawn_trust_event_loop(self: &Arc<Self>) {
        let mut events = self.registry.subscribe();
        let link = Arc::clone(&self.link);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DiscoveryEvent::PeerBlocked(peer)) => link.disconnect(&peer).await,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
