//! # Connection Lifecycle Manager
//!
//! Owns the one-and-only session per peer: dialing, key agreement,
//! health monitoring, bounded reconnection, and teardown. Nothing else in
//! the crate creates or destroys sessions.
//!
//! ```text
//! connect() ──► Connecting ──► Authenticating ──► Authenticated
//!                   │                │                 │
//!                   ▼                ▼                 ▼ (3 missed heartbeats,
//!               (radio err)      (key err)              explicit disconnect)
//!                   └────────────────┴──────────► torn down, session deleted
//!                                                      │ auto_reconnect
//!                                                      ▼
//!                                           up to max_reconnect_attempts,
//!                                           spaced reconnect_delay apart
//! ```
//!
//! ## Traffic is the heartbeat
//!
//! There is no dedicated keepalive message. Every inbound frame of any
//! type resets the peer's silence clock via [`LinkManager::record_inbound`];
//! the monitor task only counts a miss when a full heartbeat window passes
//! with nothing heard. Three consecutive misses force the link down.
//!
//! ## Teardown is total
//!
//! Disconnecting a peer aborts its monitor and reconnect tasks, closes the
//! radio link, revokes the crypto session, and deletes health state —
//! in that order, every time, even when the radio close fails. A timer
//! still firing after its session is gone is a correctness bug, not a leak.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config;
use crate::crypto::session::SessionCrypto;
use crate::identity::{DeviceId, PeerIdentity};

use super::radio::{RadioError, RadioLink, RadioTransport};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for connection management.
///
/// Defaults come from [`config`]; tests shrink the timing values to keep
/// the paused-clock runs tight.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Ceiling on simultaneous live sessions.
    pub max_connections: usize,
    /// How often the monitor checks each peer for silence.
    pub heartbeat_interval: Duration,
    /// Silence longer than this counts as a missed heartbeat window.
    pub connection_timeout: Duration,
    /// Whether an unexpected disconnect triggers automatic redial.
    pub auto_reconnect: bool,
    /// Redial attempts before the peer is dropped back to discovery.
    pub max_reconnect_attempts: u32,
    /// Fixed delay between redial attempts.
    pub reconnect_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_connections: config::MAX_CONNECTIONS,
            heartbeat_interval: config::HEARTBEAT_INTERVAL,
            connection_timeout: config::CONNECTION_TIMEOUT,
            auto_reconnect: true,
            max_reconnect_attempts: config::MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: config::RECONNECT_DELAY,
        }
    }
}

// ---------------------------------------------------------------------------
// Session & Health State
// ---------------------------------------------------------------------------

/// Lifecycle state of a peer session.
///
/// Only live states are held in the session table; a peer with no entry is
/// `Disconnected`. `Errored` is reported transiently through
/// [`LinkEvent::Disconnected`] reasons rather than parked in the table —
/// superseded sessions are destroyed, not mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Radio dial in progress.
    Connecting,
    /// Radio link up, key agreement running.
    Authenticating,
    /// Session key agreed; traffic may flow.
    Authenticated,
    /// No live session.
    Disconnected,
    /// Torn down due to an error.
    Errored,
}

struct LinkSession {
    peer: PeerIdentity,
    state: SessionState,
    established_at_ms: u64,
    link: Option<Arc<dyn RadioLink>>,
}

/// Per-peer traffic and liveness counters.
///
/// Mutated only by the manager; deleted with the session.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    /// Last time anything arrived from the peer.
    pub last_heartbeat: Instant,
    /// Consecutive silent heartbeat windows.
    pub missed_heartbeats: u32,
    /// Frames sent to the peer this session.
    pub messages_sent: u64,
    /// Frames received from the peer this session.
    pub messages_received: u64,
    /// Errors observed on this link.
    pub errors: u64,
}

impl ConnectionHealth {
    fn new() -> Self {
        Self {
            last_heartbeat: Instant::now(),
            missed_heartbeats: 0,
            messages_sent: 0,
            messages_received: 0,
            errors: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Events & Errors
// ---------------------------------------------------------------------------

/// Peer-level connection status events.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A session reached `Authenticated`.
    Connected(DeviceId),
    /// A session was torn down.
    Disconnected {
        /// The peer whose session ended.
        peer: DeviceId,
        /// Human-readable teardown reason.
        reason: String,
    },
    /// Automatic redial gave up; the peer must be re-discovered.
    ReconnectExhausted(DeviceId),
}

/// Errors surfaced to `connect`/`disconnect` callers.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The session table is full.
    #[error("connection ceiling reached ({max} live sessions)")]
    AtCapacity {
        /// The configured ceiling.
        max: usize,
    },

    /// A live session for this peer already exists.
    #[error("already connected to peer {0}")]
    AlreadyConnected(DeviceId),

    /// The operation requires an authenticated session.
    #[error("not connected to peer {0}")]
    NotConnected(DeviceId),

    /// The radio failed; connection state has been rolled back.
    #[error(transparent)]
    Radio(#[from] RadioError),
}

// ---------------------------------------------------------------------------
// LinkManager
// ---------------------------------------------------------------------------

/// The connection lifecycle manager. One per device.
pub struct LinkManager {
    config: LinkConfig,
    radio: Arc<dyn RadioTransport>,
    crypto: Arc<SessionCrypto>,
    sessions: DashMap<DeviceId, LinkSession>,
    health: DashMap<DeviceId, ConnectionHealth>,
    monitors: DashMap<DeviceId, JoinHandle<()>>,
    reconnects: DashMap<DeviceId, JoinHandle<()>>,
    events: broadcast::Sender<LinkEvent>,
}

impl LinkManager {
    /// Create a manager wired to a radio and the device's session crypto.
    pub fn new(
        radio: Arc<dyn RadioTransport>,
        crypto: Arc<SessionCrypto>,
        config: LinkConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            radio,
            crypto,
            sessions: DashMap::new(),
            health: DashMap::new(),
            monitors: DashMap::new(),
            reconnects: DashMap::new(),
            events,
        })
    }

    /// Subscribe to peer-level connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Dial a peer and drive the session to `Authenticated`.
    ///
    /// Rejects when the ceiling is reached or a live session already
    /// exists. A radio failure rolls the session table back to exactly
    /// its prior state.
    pub async fn connect(self: &Arc<Self>, peer: &PeerIdentity) -> Result<(), LinkError> {
        if self.sessions.contains_key(&peer.device_id) {
            return Err(LinkError::AlreadyConnected(peer.device_id.clone()));
        }
        if self.sessions.len() >= self.config.max_connections {
            return Err(LinkError::AtCapacity {
                max: self.config.max_connections,
            });
        }

        // Reserve the slot before the dial so a concurrent connect to the
        // same peer sees AlreadyConnected instead of racing the radio.
        self.sessions.insert(
            peer.device_id.clone(),
            LinkSession {
                peer: peer.clone(),
                state: SessionState::Connecting,
                established_at_ms: 0,
                link: None,
            },
        );
        debug!(peer = %peer.device_id, "dialing");

        let link = match self.radio.connect(&peer.device_id).await {
            Ok(link) => link,
            Err(e) => {
                self.sessions.remove(&peer.device_id);
                warn!(peer = %peer.device_id, error = %e, "dial failed");
                return Err(LinkError::Radio(e));
            }
        };

        self.finish_establish(peer, link);
        Ok(())
    }

    /// Register a session for a connection the peer initiated.
    ///
    /// Same ceiling and single-session rules as [`connect`](Self::connect);
    /// the radio dial is skipped because the link already exists.
    pub fn attach_incoming(
        self: &Arc<Self>,
        peer: &PeerIdentity,
        link: Arc<dyn RadioLink>,
    ) -> Result<(), LinkError> {
        if self.sessions.contains_key(&peer.device_id) {
            return Err(LinkError::AlreadyConnected(peer.device_id.clone()));
        }
        if self.sessions.len() >= self.config.max_connections {
            return Err(LinkError::AtCapacity {
                max: self.config.max_connections,
            });
        }

        self.sessions.insert(
            peer.device_id.clone(),
            LinkSession {
                peer: peer.clone(),
                state: SessionState::Connecting,
                established_at_ms: 0,
                link: None,
            },
        );
        self.finish_establish(peer, link);
        Ok(())
    }

    /// Key agreement + transition to `Authenticated` + monitoring.
    fn finish_establish(self: &Arc<Self>, peer: &PeerIdentity, link: Arc<dyn RadioLink>) {
        if let Some(mut session) = self.sessions.get_mut(&peer.device_id) {
            session.state = SessionState::Authenticating;
        }
        self.crypto.agree_key(&peer.device_id, &peer.agree_key);

        let now = config::unix_millis();
        if let Some(mut session) = self.sessions.get_mut(&peer.device_id) {
            session.state = SessionState::Authenticated;
            session.established_at_ms = now;
            session.link = Some(link);
        }
        self.health
            .insert(peer.device_id.clone(), ConnectionHealth::new());
        self.spawn_monitor(peer.clone());

        info!(peer = %peer.device_id, name = %peer.display_name, "session authenticated");
        let _ = self.events.send(LinkEvent::Connected(peer.device_id.clone()));
    }

    /// Tear down the session with `peer`. Idempotent — disconnecting a
    /// peer that isn't connected is a no-op.
    pub async fn disconnect(self: &Arc<Self>, peer: &DeviceId) {
        if let Some((_, handle)) = self.reconnects.remove(peer) {
            handle.abort();
        }
        self.teardown(peer, "requested", true).await;
    }

    /// Shared teardown path. `abort_monitor` is false when the caller *is*
    /// the monitor task — a task must not abort itself mid-teardown.
    async fn teardown(self: &Arc<Self>, peer: &DeviceId, reason: &str, abort_monitor: bool) -> bool {
        if let Some((_, handle)) = self.monitors.remove(peer) {
            if abort_monitor {
                handle.abort();
            }
        }

        let Some((_, session)) = self.sessions.remove(peer) else {
            return false;
        };

        // Close the radio link. Health and crypto state go regardless of
        // whether the radio cooperates.
        if let Some(link) = session.link {
            if let Err(e) = link.close().await {
                warn!(peer = %peer, error = %e, "radio close failed during teardown");
            }
        }
        self.crypto.revoke(peer);
        self.health.remove(peer);

        info!(peer = %peer, reason = reason, "session torn down");
        let _ = self.events.send(LinkEvent::Disconnected {
            peer: peer.clone(),
            reason: reason.to_string(),
        });
        true
    }

    /// Per-peer silence monitor. Counts missed heartbeat windows and
    /// forces the link down after three in a row.
    fn spawn_monitor(self: &Arc<Self>, peer: PeerIdentity) {
        let weak = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval;
        let timeout = self.config.connection_timeout;
        let auto_reconnect = self.config.auto_reconnect;
        let device_id = peer.device_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = weak.upgrade() else { break };
                if !manager.sessions.contains_key(&peer.device_id) {
                    break;
                }

                let missed = {
                    let Some(mut health) = manager.health.get_mut(&peer.device_id) else {
                        break;
                    };
                    if health.last_heartbeat.elapsed() > timeout {
                        health.missed_heartbeats += 1;
                    } else {
                        health.missed_heartbeats = 0;
                    }
                    health.missed_heartbeats
                };

                if missed >= config::MAX_MISSED_HEARTBEATS {
                    warn!(peer = %peer.device_id, missed, "heartbeat timeout, forcing disconnect");
                    manager
                        .teardown(&peer.device_id, "heartbeat timeout", false)
                        .await;
                    if auto_reconnect {
                        manager.spawn_reconnect(peer.clone());
                    }
                    break;
                }
            }
        });

        if let Some(old) = self.monitors.insert(device_id, handle) {
            old.abort();
        }
    }

    /// Bounded redial loop after an unexpected disconnect.
    fn spawn_reconnect(self: &Arc<Self>, peer: PeerIdentity) {
        let weak = Arc::downgrade(self);
        let max_attempts = self.config.max_reconnect_attempts;
        let delay = self.config.reconnect_delay;
        let device_id = peer.device_id.clone();

        let handle = tokio::spawn(async move {
            for attempt in 1..=max_attempts {
                tokio::time::sleep(delay).await;
                let Some(manager) = weak.upgrade() else { return };
                match manager.connect(&peer).await {
                    Ok(()) => {
                        info!(peer = %peer.device_id, attempt, "reconnected");
                        return;
                    }
                    Err(e) => {
                        debug!(peer = %peer.device_id, attempt, error = %e, "reconnect attempt failed");
                    }
                }
            }
            let Some(manager) = weak.upgrade() else { return };
            warn!(peer = %peer.device_id, attempts = max_attempts, "reconnect attempts exhausted");
            let _ = manager
                .events
                .send(LinkEvent::ReconnectExhausted(peer.device_id.clone()));
        });

        if let Some(old) = self.reconnects.insert(device_id, handle) {
            old.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Health bookkeeping
    // -----------------------------------------------------------------------

    /// Record inbound traffic. Any frame of any type doubles as a
    /// heartbeat.
    pub fn record_inbound(&self, peer: &DeviceId) {
        if let Some(mut health) = self.health.get_mut(peer) {
            health.messages_received += 1;
            health.missed_heartbeats = 0;
            health.last_heartbeat = Instant::now();
        }
    }

    /// Record a frame successfully written to the peer.
    pub fn record_outbound(&self, peer: &DeviceId) {
        if let Some(mut health) = self.health.get_mut(peer) {
            health.messages_sent += 1;
        }
    }

    /// Record a link-level error.
    pub fn record_error(&self, peer: &DeviceId) {
        if let Some(mut health) = self.health.get_mut(peer) {
            health.errors += 1;
        }
    }

    /// Snapshot of the peer's health counters.
    pub fn health(&self, peer: &DeviceId) -> Option<ConnectionHealth> {
        self.health.get(peer).map(|h| h.clone())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current session state; `Disconnected` when no session exists.
    pub fn session_state(&self, peer: &DeviceId) -> SessionState {
        self.sessions
            .get(peer)
            .map(|s| s.state)
            .unwrap_or(SessionState::Disconnected)
    }

    /// Whether the peer's session is ready for traffic.
    pub fn is_authenticated(&self, peer: &DeviceId) -> bool {
        self.session_state(peer) == SessionState::Authenticated
    }

    /// The live radio link for an authenticated peer.
    pub fn session_link(&self, peer: &DeviceId) -> Option<Arc<dyn RadioLink>> {
        self.sessions.get(peer).and_then(|s| s.link.clone())
    }

    /// The identity a session was established with.
    pub fn peer_identity(&self, peer: &DeviceId) -> Option<PeerIdentity> {
        self.sessions.get(peer).map(|s| s.peer.clone())
    }

    /// Number of live sessions.
    pub fn connected_count(&self) -> usize {
        self.sessions.len()
    }

    /// The authenticated peer with the lowest activity score — the one a
    /// caller should evict when it needs a free slot for a higher-priority
    /// peer. Ties go to the oldest session; the answer is deterministic.
    pub fn find_peer_to_disconnect(&self) -> Option<DeviceId> {
        self.sessions
            .iter()
            .filter(|entry| entry.state == SessionState::Authenticated)
            .map(|entry| {
                let activity = self
                    .health
                    .get(entry.key())
                    .map(|h| h.messages_sent + h.messages_received)
                    .unwrap_or(0);
                (entry.key().clone(), activity, entry.established_at_ms)
            })
            .min_by_key(|(_, activity, established)| (*activity, *established))
            .map(|(peer, _, _)| peer)
    }

    /// Tear down every session. Used at shutdown.
    pub async fn shutdown(self: &Arc<Self>) {
        let peers: Vec<DeviceId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            self.disconnect(&peer).await;
        }
        self.crypto.expire_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signer::SoftwareSigner;
    use crate::crypto::SessionCrypto;
    use crate::link::radio::{
        DiscoveredPeer, IncomingConnection, MemoryHub, MemoryLink, ScanFilter,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    fn device(name: &str) -> (PeerIdentity, Arc<SessionCrypto>) {
        let signer = SoftwareSigner::generate();
        let crypto = Arc::new(SessionCrypto::new(signer, Duration::from_secs(60)));
        let identity = PeerIdentity::new(
            crypto.sign_public_key(),
            crypto.agree_public_bytes(),
            name.into(),
        );
        (identity, crypto)
    }

    fn manager_on(
        hub: &MemoryHub,
        name: &str,
        config: LinkConfig,
    ) -> (Arc<LinkManager>, PeerIdentity) {
        let (identity, crypto) = device(name);
        let radio = hub.join(identity.clone(), -40);
        (LinkManager::new(radio, crypto, config), identity)
    }

    #[tokio::test]
    async fn connect_reaches_authenticated() {
        let hub = MemoryHub::new();
        let (manager, _) = manager_on(&hub, "alice", LinkConfig::default());
        let (bob, _) = device("bob");
        let _bob_radio = hub.join(bob.clone(), -40);

        manager.connect(&bob).await.unwrap();
        assert!(manager.is_authenticated(&bob.device_id));
        assert_eq!(manager.connected_count(), 1);
        assert!(manager.session_link(&bob.device_id).is_some());
    }

    #[tokio::test]
    async fn double_connect_is_rejected() {
        let hub = MemoryHub::new();
        let (manager, _) = manager_on(&hub, "alice", LinkConfig::default());
        let (bob, _) = device("bob");
        let _bob_radio = hub.join(bob.clone(), -40);

        manager.connect(&bob).await.unwrap();
        assert!(matches!(
            manager.connect(&bob).await,
            Err(LinkError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn third_connection_hits_the_ceiling() {
        let hub = MemoryHub::new();
        let config = LinkConfig {
            max_connections: 2,
            ..LinkConfig::default()
        };
        let (manager, _) = manager_on(&hub, "alice", config);

        let joined: Vec<_> = (0..3)
            .map(|i| {
                let (p, _) = device(&format!("peer-{i}"));
                let radio = hub.join(p.clone(), -40);
                (p, radio)
            })
            .collect();
        let peers: Vec<PeerIdentity> = joined.iter().map(|(p, _)| p.clone()).collect();

        manager.connect(&peers[0]).await.unwrap();
        manager.connect(&peers[1]).await.unwrap();
        assert!(matches!(
            manager.connect(&peers[2]).await,
            Err(LinkError::AtCapacity { max: 2 })
        ));
        // The two earlier sessions are unharmed.
        assert!(manager.is_authenticated(&peers[0].device_id));
        assert!(manager.is_authenticated(&peers[1].device_id));
    }

    #[tokio::test]
    async fn failed_dial_rolls_back_session_state() {
        let hub = MemoryHub::new();
        let (manager, _) = manager_on(&hub, "alice", LinkConfig::default());
        let (ghost, _) = device("ghost"); // never joins the hub

        assert!(matches!(
            manager.connect(&ghost).await,
            Err(LinkError::Radio(_))
        ));
        assert_eq!(manager.connected_count(), 0);
        assert_eq!(
            manager.session_state(&ghost.device_id),
            SessionState::Disconnected
        );
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_total() {
        let hub = MemoryHub::new();
        let (manager, _) = manager_on(&hub, "alice", LinkConfig::default());
        let (bob, _) = device("bob");
        let _bob_radio = hub.join(bob.clone(), -40);

        manager.connect(&bob).await.unwrap();
        manager.disconnect(&bob.device_id).await;
        assert_eq!(manager.connected_count(), 0);
        assert!(manager.health(&bob.device_id).is_none());

        // Second disconnect of the same peer is a quiet no-op.
        manager.disconnect(&bob.device_id).await;
    }

    #[tokio::test]
    async fn attach_incoming_registers_a_session() {
        let hub = MemoryHub::new();
        let (manager, _) = manager_on(&hub, "alice", LinkConfig::default());
        let (bob, _) = device("bob");
        let (link, _other_half) = MemoryLink::pair();

        manager.attach_incoming(&bob, link).unwrap();
        assert!(manager.is_authenticated(&bob.device_id));
    }

    #[tokio::test]
    async fn eviction_picks_least_active_then_oldest() {
        let hub = MemoryHub::new();
        let (manager, _) = manager_on(&hub, "alice", LinkConfig::default());

        let (first, _) = device("first");
        let (second, _) = device("second");
        let _first_radio = hub.join(first.clone(), -40);
        let _second_radio = hub.join(second.clone(), -40);

        manager.connect(&first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.connect(&second).await.unwrap();

        // Equal activity: the older session loses.
        assert_eq!(
            manager.find_peer_to_disconnect(),
            Some(first.device_id.clone())
        );

        // Traffic on the old session shifts the choice to the idle one.
        manager.record_inbound(&first.device_id);
        manager.record_outbound(&first.device_id);
        assert_eq!(
            manager.find_peer_to_disconnect(),
            Some(second.device_id.clone())
        );
    }

    #[tokio::test]
    async fn inbound_traffic_resets_missed_heartbeats() {
        let hub = MemoryHub::new();
        let (manager, _) = manager_on(&hub, "alice", LinkConfig::default());
        let (bob, _) = device("bob");
        let _bob_radio = hub.join(bob.clone(), -40);
        manager.connect(&bob).await.unwrap();

        if let Some(mut h) = manager.health.get_mut(&bob.device_id) {
            h.missed_heartbeats = 2;
        }
        manager.record_inbound(&bob.device_id);
        let health = manager.health(&bob.device_id).unwrap();
        assert_eq!(health.missed_heartbeats, 0);
        assert_eq!(health.messages_received, 1);
    }

    /// A radio whose first dial succeeds and every later dial fails —
    /// exactly what a peer walking out of range looks like.
    struct VanishingRadio {
        dials: AtomicU32,
        kept_links: parking_lot::Mutex<Vec<Arc<MemoryLink>>>,
    }

    #[async_trait]
    impl RadioTransport for VanishingRadio {
        async fn scan(
            &self,
            _filter: ScanFilter,
        ) -> Result<mpsc::UnboundedReceiver<DiscoveredPeer>, RadioError> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }

        async fn connect(&self, _peer: &DeviceId) -> Result<Arc<dyn RadioLink>, RadioError> {
            let attempt = self.dials.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                let (ours, theirs) = MemoryLink::pair();
                self.kept_links.lock().push(theirs);
                Ok(ours)
            } else {
                Err(RadioError::ConnectFailed("out of range".into()))
            }
        }

        async fn next_incoming(&self) -> Result<IncomingConnection, RadioError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_disconnects_and_reconnects_exactly_n_times() {
        let (bob, _) = device("bob");
        let (identity, crypto) = device("alice");
        let _ = identity;
        let radio = Arc::new(VanishingRadio {
            dials: AtomicU32::new(0),
            kept_links: parking_lot::Mutex::new(Vec::new()),
        });

        let config = LinkConfig {
            max_connections: 4,
            heartbeat_interval: Duration::from_millis(100),
            connection_timeout: Duration::from_millis(250),
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(200),
        };
        let manager = LinkManager::new(radio.clone(), crypto, config);

        manager.connect(&bob).await.unwrap();
        assert_eq!(radio.dials.load(Ordering::SeqCst), 1);
        let mut events = manager.subscribe();

        // Silence. Three missed windows force the disconnect, then the
        // redial loop burns its three attempts against the dead radio.
        let mut saw_disconnect = false;
        let mut saw_exhausted = false;
        while !saw_exhausted {
            match events.recv().await.unwrap() {
                LinkEvent::Disconnected { reason, .. } => {
                    assert_eq!(reason, "heartbeat timeout");
                    saw_disconnect = true;
                }
                LinkEvent::ReconnectExhausted(peer) => {
                    assert_eq!(peer, bob.device_id);
                    saw_exhausted = true;
                }
                LinkEvent::Connected(_) => panic!("reconnect cannot succeed on a dead radio"),
            }
        }
        assert!(saw_disconnect);
        // 1 initial dial + exactly max_reconnect_attempts redials.
        assert_eq!(radio.dials.load(Ordering::SeqCst), 4);
        assert_eq!(manager.connected_count(), 0);
    }
}
