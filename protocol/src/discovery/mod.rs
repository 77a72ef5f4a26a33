//! # Peer Discovery & Trust Registry
//!
//! Raw radio sightings are noisy: the same device shows up every
//! advertising interval with a slightly different signal strength. The
//! registry merges that stream into a stable peer table, layers the
//! user's trust decisions on top, and ranks the result so the UI can put
//! the peer you actually want to pay at the top of the list.
//!
//! ## Trust lifecycle
//!
//! ```text
//! Discovered ──► Pending ──► Trusted
//!     │             │           │
//!     └─────────────┴───────────┴──► Blocked ──(explicit unblock)──► Discovered
//! ```
//!
//! Blocking is reachable from every state and is irreversible except by
//! explicit unblock. A blocked peer is stripped from the peer table, its
//! sightings are silently ignored, and the block survives restarts via
//! the persistence collaborator.
//!
//! Trust and block sets are persisted on every change; a failing backend
//! is logged and the registry carries on in memory. A payment device with
//! a broken disk should still pay.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::identity::{DeviceId, PeerIdentity};
use crate::link::radio::DiscoveredPeer;
use crate::store::TrustStore;

/// Persistence keys for the trust sets.
const KEY_TRUSTED: &str = "pulse.trusted_peers";
const KEY_BLOCKED: &str = "pulse.blocked_peers";

// ---------------------------------------------------------------------------
// Trust & Proximity
// ---------------------------------------------------------------------------

/// How far the user's trust in a peer has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    /// Seen on the radio, nothing more.
    Discovered,
    /// Pairing started, not yet confirmed.
    Pending,
    /// Confirmed by the user; survives restarts.
    Trusted,
    /// Banned; sightings ignored, connections refused.
    Blocked,
}

impl TrustLevel {
    /// Ranking weight. Blocked is pushed far below everything else so no
    /// combination of proximity and activity can float it back up.
    fn weight(self) -> i32 {
        match self {
            Self::Trusted => 40,
            Self::Pending => 20,
            Self::Discovered => 10,
            Self::Blocked => -100,
        }
    }
}

/// Signal-strength bucket, coarse on purpose — RSSI jitters far too much
/// for anything finer to mean something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proximity {
    /// Practically touching (≥ −50 dBm).
    Immediate,
    /// Same table (≥ −70 dBm).
    Near,
    /// Same room (≥ −90 dBm).
    Far,
    /// Fringe reception.
    OutOfRange,
}

impl Proximity {
    /// Bucket a raw RSSI reading.
    pub fn from_rssi(rssi: i16) -> Self {
        if rssi >= -50 {
            Self::Immediate
        } else if rssi >= -70 {
            Self::Near
        } else if rssi >= -90 {
            Self::Far
        } else {
            Self::OutOfRange
        }
    }

    fn weight(self) -> i32 {
        match self {
            Self::Immediate => 30,
            Self::Near => 20,
            Self::Far => 10,
            Self::OutOfRange => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Peer Table Types
// ---------------------------------------------------------------------------

/// A peer as the registry knows it: identity plus sighting and activity
/// history.
#[derive(Debug, Clone)]
pub struct PeerDevice {
    /// The advertised identity.
    pub identity: PeerIdentity,
    /// Most recent signal strength, dBm.
    pub rssi: i16,
    /// Unix ms of the first sighting.
    pub first_seen_ms: u64,
    /// Unix ms of the latest sighting.
    pub last_seen_ms: u64,
    /// Sessions ever established with this peer.
    pub connect_count: u32,
    /// Messages ever exchanged with this peer.
    pub message_count: u64,
    /// Whether a session is currently live.
    pub connected: bool,
}

/// A ranked peer, as returned by [`PeerRegistry::rank_peers`].
#[derive(Debug, Clone)]
pub struct RankedPeer {
    /// The peer's device id.
    pub device_id: DeviceId,
    /// Composite trust + proximity + activity score.
    pub score: i32,
}

/// Registry events for the application layer.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// First sighting of a device.
    PeerDiscovered(PeerIdentity),
    /// A peer was blocked; any live connection should be torn down.
    PeerBlocked(DeviceId),
    /// A previously blocked peer may be discovered again.
    PeerUnblocked(DeviceId),
}

/// Errors from trust transitions.
#[derive(Debug, Error)]
pub enum TrustError {
    /// The peer is not in the table and has no trust record.
    #[error("unknown peer {0}")]
    UnknownPeer(DeviceId),

    /// The requested transition is not allowed from the current level.
    #[error("invalid trust transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current trust level.
        from: TrustLevel,
        /// Requested trust level.
        to: TrustLevel,
    },
}

// ---------------------------------------------------------------------------
// PeerRegistry
// ---------------------------------------------------------------------------

/// The merged peer table and trust state. One per device.
pub struct PeerRegistry {
    peers: RwLock<HashMap<DeviceId, PeerDevice>>,
    trust: RwLock<HashMap<DeviceId, TrustLevel>>,
    store: Arc<dyn TrustStore>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl PeerRegistry {
    /// Create a registry, loading persisted trust/block sets from `store`.
    pub fn new(store: Arc<dyn TrustStore>) -> Self {
        let (events, _) = broadcast::channel(64);
        let registry = Self {
            peers: RwLock::new(HashMap::new()),
            trust: RwLock::new(HashMap::new()),
            store,
            events,
        };
        registry.load_persisted();
        registry
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Merge one raw sighting into the table.
    ///
    /// Repeat sightings update `rssi`/`last_seen`; first sightings insert
    /// the peer and emit [`DiscoveryEvent::PeerDiscovered`]. Sightings of
    /// blocked peers are ignored without a trace — a blocked device does
    /// not get to know it's being ignored.
    pub fn observe(&self, sighting: &DiscoveredPeer) {
        let id = &sighting.identity.device_id;
        if self.trust_level(id) == TrustLevel::Blocked {
            return;
        }

        let mut peers = self.peers.write();
        match peers.get_mut(id) {
            Some(existing) => {
                existing.rssi = sighting.rssi;
                existing.last_seen_ms = sighting.seen_at_ms;
            }
            None => {
                peers.insert(
                    id.clone(),
                    PeerDevice {
                        identity: sighting.identity.clone(),
                        rssi: sighting.rssi,
                        first_seen_ms: sighting.seen_at_ms,
                        last_seen_ms: sighting.seen_at_ms,
                        connect_count: 0,
                        message_count: 0,
                        connected: false,
                    },
                );
                self.trust
                    .write()
                    .entry(id.clone())
                    .or_insert(TrustLevel::Discovered);
                debug!(peer = %id, name = %sighting.identity.display_name, "peer discovered");
                let _ = self
                    .events
                    .send(DiscoveryEvent::PeerDiscovered(sighting.identity.clone()));
            }
        }
    }

    /// The peer's current trust level. Unknown peers read as `Discovered`.
    pub fn trust_level(&self, peer: &DeviceId) -> TrustLevel {
        self.trust
            .read()
            .get(peer)
            .copied()
            .unwrap_or(TrustLevel::Discovered)
    }

    /// Look up a peer in the table.
    pub fn peer(&self, peer: &DeviceId) -> Option<PeerDevice> {
        self.peers.read().get(peer).cloned()
    }

    /// Every known (non-blocked) peer.
    pub fn peers(&self) -> Vec<PeerDevice> {
        self.peers.read().values().cloned().collect()
    }

    /// Begin pairing: `Discovered → Pending`.
    pub fn mark_pending(&self, peer: &DeviceId) -> Result<(), TrustError> {
        self.transition(peer, TrustLevel::Pending, &[TrustLevel::Discovered])
    }

    /// Confirm trust: `Pending → Trusted`. Persisted.
    pub fn trust(&self, peer: &DeviceId) -> Result<(), TrustError> {
        self.transition(peer, TrustLevel::Trusted, &[TrustLevel::Pending])?;
        self.persist();
        Ok(())
    }

    /// Block a peer, from any state. Removes it from the peer table and
    /// emits [`DiscoveryEvent::PeerBlocked`] so any live session gets torn
    /// down. Persisted.
    pub fn block(&self, peer: &DeviceId) {
        self.trust.write().insert(peer.clone(), TrustLevel::Blocked);
        self.peers.write().remove(peer);
        self.persist();
        let _ = self.events.send(DiscoveryEvent::PeerBlocked(peer.clone()));
    }

    /// Lift a block: `Blocked → Discovered`. The peer starts from scratch.
    pub fn unblock(&self, peer: &DeviceId) -> Result<(), TrustError> {
        self.transition(peer, TrustLevel::Discovered, &[TrustLevel::Blocked])?;
        self.persist();
        let _ = self.events.send(DiscoveryEvent::PeerUnblocked(peer.clone()));
        Ok(())
    }

    fn transition(
        &self,
        peer: &DeviceId,
        to: TrustLevel,
        allowed_from: &[TrustLevel],
    ) -> Result<(), TrustError> {
        let mut trust = self.trust.write();
        let current = trust
            .get(peer)
            .copied()
            .ok_or_else(|| TrustError::UnknownPeer(peer.clone()))?;
        if !allowed_from.contains(&current) {
            return Err(TrustError::InvalidTransition { from: current, to });
        }
        trust.insert(peer.clone(), to);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Activity bookkeeping
    // -----------------------------------------------------------------------

    /// Record a session coming up or going down for `peer`.
    pub fn note_connected(&self, peer: &DeviceId, connected: bool) {
        let mut peers = self.peers.write();
        if let Some(device) = peers.get_mut(peer) {
            device.connected = connected;
            if connected {
                device.connect_count += 1;
            }
        }
    }

    /// Record one exchanged message with `peer`.
    pub fn note_message(&self, peer: &DeviceId) {
        let mut peers = self.peers.write();
        if let Some(device) = peers.get_mut(peer) {
            device.message_count += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Ranking
    // -----------------------------------------------------------------------

    /// Rank known peers for display: trust first, then proximity, then a
    /// capped activity bonus. Stable sort, score descending.
    pub fn rank_peers(&self) -> Vec<RankedPeer> {
        let peers = self.peers.read();
        let trust = self.trust.read();

        let mut ranked: Vec<RankedPeer> = peers
            .values()
            .map(|device| {
                let id = &device.identity.device_id;
                let level = trust.get(id).copied().unwrap_or(TrustLevel::Discovered);

                let mut score = level.weight();
                score += Proximity::from_rssi(device.rssi).weight();
                if device.connected {
                    score += 15;
                }
                // Historical activity helps, but only so much — ten
                // sessions with the corner café shouldn't outrank the
                // trusted phone in front of you.
                score += (device.connect_count.min(10)) as i32;
                score += (device.message_count / 10).min(10) as i32;

                RankedPeer {
                    device_id: id.clone(),
                    score,
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.score.cmp(&a.score));
        ranked
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn load_persisted(&self) {
        let mut trust = self.trust.write();
        for (key, level) in [(KEY_TRUSTED, TrustLevel::Trusted), (KEY_BLOCKED, TrustLevel::Blocked)]
        {
            match self.store.get(key) {
                Ok(Some(blob)) => {
                    if let Some(ids) = blob.as_array() {
                        for id in ids.iter().filter_map(|v| v.as_str()) {
                            trust.insert(DeviceId::from_string(id.to_string()), level);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "failed to load trust set, starting empty"),
            }
        }
    }

    fn persist(&self) {
        let trust = self.trust.read();
        let collect = |level: TrustLevel| -> serde_json::Value {
            json!(trust
                .iter()
                .filter(|(_, l)| **l == level)
                .map(|(id, _)| id.as_str())
                .collect::<Vec<_>>())
        };

        for (key, level) in [(KEY_TRUSTED, TrustLevel::Trusted), (KEY_BLOCKED, TrustLevel::Blocked)]
        {
            if let Err(e) = self.store.put(key, &collect(level)) {
                warn!(key, error = %e, "failed to persist trust set, continuing in memory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::crypto::signer::{DeviceSigner, SoftwareSigner};
    use crate::store::{MemoryTrustStore, StoreError};

    fn identity(name: &str) -> PeerIdentity {
        let key = SoftwareSigner::generate().public_key();
        PeerIdentity::new(key, [1u8; 32], name.into())
    }

    fn sighting(identity: &PeerIdentity, rssi: i16) -> DiscoveredPeer {
        DiscoveredPeer {
            identity: identity.clone(),
            rssi,
            seen_at_ms: config::unix_millis(),
        }
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Arc::new(MemoryTrustStore::new()))
    }

    #[test]
    fn first_sighting_inserts_and_emits() {
        let reg = registry();
        let mut events = reg.subscribe();
        let peer = identity("maria");

        reg.observe(&sighting(&peer, -55));
        assert_eq!(reg.peers().len(), 1);
        assert_eq!(reg.trust_level(&peer.device_id), TrustLevel::Discovered);
        assert!(matches!(
            events.try_recv().unwrap(),
            DiscoveryEvent::PeerDiscovered(_)
        ));
    }

    #[test]
    fn repeat_sighting_updates_in_place() {
        let reg = registry();
        let peer = identity("maria");
        reg.observe(&sighting(&peer, -55));
        reg.observe(&sighting(&peer, -42));

        assert_eq!(reg.peers().len(), 1);
        let device = reg.peer(&peer.device_id).unwrap();
        assert_eq!(device.rssi, -42);
    }

    #[test]
    fn trust_progression_and_guards() {
        let reg = registry();
        let peer = identity("maria");
        reg.observe(&sighting(&peer, -55));

        // Straight to Trusted is not allowed.
        assert!(matches!(
            reg.trust(&peer.device_id),
            Err(TrustError::InvalidTransition { .. })
        ));

        reg.mark_pending(&peer.device_id).unwrap();
        reg.trust(&peer.device_id).unwrap();
        assert_eq!(reg.trust_level(&peer.device_id), TrustLevel::Trusted);
    }

    #[test]
    fn blocking_removes_and_silences_the_peer() {
        let reg = registry();
        let mut events = reg.subscribe();
        let peer = identity("spammer");
        reg.observe(&sighting(&peer, -55));
        let _ = events.try_recv();

        reg.block(&peer.device_id);
        assert_eq!(reg.peers().len(), 0);
        assert_eq!(reg.trust_level(&peer.device_id), TrustLevel::Blocked);
        assert!(matches!(
            events.try_recv().unwrap(),
            DiscoveryEvent::PeerBlocked(_)
        ));

        // Further sightings vanish without events.
        reg.observe(&sighting(&peer, -40));
        assert_eq!(reg.peers().len(), 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn unblock_restarts_from_discovered() {
        let reg = registry();
        let peer = identity("forgiven");
        reg.observe(&sighting(&peer, -55));
        reg.block(&peer.device_id);

        reg.unblock(&peer.device_id).unwrap();
        assert_eq!(reg.trust_level(&peer.device_id), TrustLevel::Discovered);
        reg.observe(&sighting(&peer, -55));
        assert_eq!(reg.peers().len(), 1);
    }

    #[test]
    fn unblock_requires_blocked() {
        let reg = registry();
        let peer = identity("innocent");
        reg.observe(&sighting(&peer, -55));
        assert!(reg.unblock(&peer.device_id).is_err());
    }

    #[test]
    fn ranking_prefers_trust_then_proximity_then_activity() {
        let reg = registry();

        let trusted_far = identity("trusted-far");
        reg.observe(&sighting(&trusted_far, -85));
        reg.mark_pending(&trusted_far.device_id).unwrap();
        reg.trust(&trusted_far.device_id).unwrap();

        let discovered_close = identity("discovered-close");
        reg.observe(&sighting(&discovered_close, -45));

        let pending_near = identity("pending-near");
        reg.observe(&sighting(&pending_near, -60));
        reg.mark_pending(&pending_near.device_id).unwrap();

        // trusted-far: 40 + 10 = 50; pending-near: 20 + 20 = 40;
        // discovered-close: 10 + 30 = 40 — ties keep insertion stability.
        let ranked = reg.rank_peers();
        assert_eq!(ranked[0].device_id, trusted_far.device_id);
        assert_eq!(ranked[0].score, 50);

        // A live connection pushes discovered-close past the trusted peer:
        // 10 + 30 + 15 (connected) + 1 (connect_count) = 56.
        reg.note_connected(&discovered_close.device_id, true);
        let ranked = reg.rank_peers();
        assert_eq!(ranked[0].device_id, discovered_close.device_id);
        assert_eq!(ranked[0].score, 56);
        assert_eq!(ranked[1].device_id, trusted_far.device_id);
    }

    #[test]
    fn activity_bonus_is_capped() {
        let reg = registry();
        let busy = identity("busy");
        reg.observe(&sighting(&busy, -95)); // OutOfRange: no proximity points

        for _ in 0..50 {
            reg.note_connected(&busy.device_id, true);
        }
        for _ in 0..10_000 {
            reg.note_message(&busy.device_id);
        }

        let ranked = reg.rank_peers();
        // 10 (discovered) + 0 + 15 (connected) + 10 + 10 capped bonuses.
        assert_eq!(ranked[0].score, 45);
    }

    #[test]
    fn trust_sets_survive_restart() {
        let store: Arc<MemoryTrustStore> = Arc::new(MemoryTrustStore::new());
        let peer = identity("keeper");
        let banned = identity("banned");

        {
            let reg = PeerRegistry::new(store.clone());
            reg.observe(&sighting(&peer, -50));
            reg.mark_pending(&peer.device_id).unwrap();
            reg.trust(&peer.device_id).unwrap();
            reg.block(&banned.device_id);
        }

        let reg = PeerRegistry::new(store);
        assert_eq!(reg.trust_level(&peer.device_id), TrustLevel::Trusted);
        assert_eq!(reg.trust_level(&banned.device_id), TrustLevel::Blocked);
    }

    /// A store that always fails, to prove persistence is non-fatal.
    struct BrokenStore;

    impl TrustStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<serde_json::Value>, StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }
        fn put(&self, _key: &str, _value: &serde_json::Value) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }
    }

    #[test]
    fn broken_store_is_not_fatal() {
        let reg = PeerRegistry::new(Arc::new(BrokenStore));
        let peer = identity("maria");
        reg.observe(&sighting(&peer, -50));
        reg.mark_pending(&peer.device_id).unwrap();
        reg.trust(&peer.device_id).unwrap(); // persists fail, trust sticks
        assert_eq!(reg.trust_level(&peer.device_id), TrustLevel::Trusted);
        reg.block(&peer.device_id);
        assert_eq!(reg.trust_level(&peer.device_id), TrustLevel::Blocked);
    }

    #[test]
    fn proximity_buckets() {
        assert_eq!(Proximity::from_rssi(-30), Proximity::Immediate);
        assert_eq!(Proximity::from_rssi(-50), Proximity::Immediate);
        assert_eq!(Proximity::from_rssi(-51), Proximity::Near);
        assert_eq!(Proximity::from_rssi(-70), Proximity::Near);
        assert_eq!(Proximity::from_rssi(-89), Proximity::Far);
        assert_eq!(Proximity::from_rssi(-91), Proximity::OutOfRange);
    }
}
