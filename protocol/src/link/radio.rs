//! # Radio Transport Boundary
//!
//! The protocol core never issues platform radio calls directly. It talks
//! to this pair of traits, and the host wires in whatever short-range
//! stack the platform provides (BLE central/peripheral, AWDL, a test
//! harness). Keeping the transport behind a seam is what makes the whole
//! engine testable without radio hardware — transport is the caller's
//! problem.
//!
//! [`MemoryHub`] is the in-process implementation used by tests and the
//! simulator: registered devices discover each other and exchange frames
//! over paired unbounded channels. Frames written before the receiving
//! side attaches its pump are buffered, not dropped, which mirrors how a
//! real stack queues notifications during connection setup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config;
use crate::identity::{DeviceId, PeerIdentity};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced by the underlying radio stack.
#[derive(Debug, Error)]
pub enum RadioError {
    /// The peer could not be reached or refused the connection.
    #[error("radio connect failed: {0}")]
    ConnectFailed(String),

    /// A frame write failed mid-flight.
    #[error("radio write failed: {0}")]
    WriteFailed(String),

    /// The link is closed; no further writes will succeed.
    #[error("radio link closed")]
    LinkClosed,

    /// The scanner could not be started.
    #[error("radio scan failed: {0}")]
    ScanFailed(String),
}

// ---------------------------------------------------------------------------
// Discovery & Connection Types
// ---------------------------------------------------------------------------

/// Constraints applied while scanning for nearby devices.
#[derive(Clone, Debug, Default)]
pub struct ScanFilter {
    /// Ignore advertisements weaker than this signal strength, in dBm.
    pub min_rssi: Option<i16>,
}

/// A raw sighting of a nearby device, as reported by the radio.
#[derive(Clone, Debug)]
pub struct DiscoveredPeer {
    /// The identity the device advertises.
    pub identity: PeerIdentity,
    /// Received signal strength, in dBm. More negative = farther away.
    pub rssi: i16,
    /// Unix milliseconds when the advertisement was heard.
    pub seen_at_ms: u64,
}

/// A connection initiated by a remote peer.
pub struct IncomingConnection {
    /// The identity of the connecting peer.
    pub peer: PeerIdentity,
    /// The live link to that peer.
    pub link: Arc<dyn RadioLink>,
}

// ---------------------------------------------------------------------------
// Transport Traits
// ---------------------------------------------------------------------------

/// Abstract short-range radio: scan for peers, dial out, accept dial-ins.
#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Start scanning. Sightings stream through the returned channel until
    /// the receiver is dropped.
    async fn scan(
        &self,
        filter: ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveredPeer>, RadioError>;

    /// Dial a nearby device by id.
    async fn connect(&self, peer: &DeviceId) -> Result<Arc<dyn RadioLink>, RadioError>;

    /// Wait for the next inbound connection. Cancellation-safe; the engine
    /// runs this in a dedicated accept loop.
    async fn next_incoming(&self) -> Result<IncomingConnection, RadioError>;
}

/// One live bidirectional link to a peer.
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Write one frame. The frame must already respect the link MTU —
    /// fragmentation happens above this layer.
    async fn write(&self, frame: &[u8]) -> Result<(), RadioError>;

    /// Take the inbound frame stream. Single-consumer: the first caller
    /// gets the receiver, later callers get `None`. The delivery layer
    /// claims it once when the session is wired up.
    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>>;

    /// Close the link. Idempotent.
    async fn close(&self) -> Result<(), RadioError>;
}

// ---------------------------------------------------------------------------
// In-Memory Transport
// ---------------------------------------------------------------------------

struct Endpoint {
    identity: PeerIdentity,
    rssi: i16,
    incoming_tx: mpsc::UnboundedSender<IncomingConnection>,
}

struct HubInner {
    endpoints: DashMap<DeviceId, Endpoint>,
}

/// An in-process radio shared by every [`MemoryRadio`] joined to it.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                endpoints: DashMap::new(),
            }),
        }
    }

    /// Register a device on the hub and get its transport handle.
    ///
    /// `rssi` is the signal strength every *other* device perceives for
    /// this one — the knob tests turn to simulate distance.
    pub fn join(&self, identity: PeerIdentity, rssi: i16) -> Arc<MemoryRadio> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        self.inner.endpoints.insert(
            identity.device_id.clone(),
            Endpoint {
                identity: identity.clone(),
                rssi,
                incoming_tx,
            },
        );
        Arc::new(MemoryRadio {
            hub: Arc::clone(&self.inner),
            local: identity,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        })
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One device's view of the [`MemoryHub`].
pub struct MemoryRadio {
    hub: Arc<HubInner>,
    local: PeerIdentity,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingConnection>>,
}

#[async_trait]
impl RadioTransport for MemoryRadio {
    async fn scan(
        &self,
        filter: ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveredPeer>, RadioError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = config::unix_millis();
        for entry in self.hub.endpoints.iter() {
            if entry.identity.device_id == self.local.device_id {
                continue;
            }
            if let Some(min) = filter.min_rssi {
                if entry.rssi < min {
                    continue;
                }
            }
            let _ = tx.send(DiscoveredPeer {
                identity: entry.identity.clone(),
                rssi: entry.rssi,
                seen_at_ms: now,
            });
        }
        Ok(rx)
    }

    async fn connect(&self, peer: &DeviceId) -> Result<Arc<dyn RadioLink>, RadioError> {
        let endpoint = self
            .hub
            .endpoints
            .get(peer)
            .ok_or_else(|| RadioError::ConnectFailed(format!("no such device: {}", peer)))?;

        let (ours, theirs) = MemoryLink::pair();
        endpoint
            .incoming_tx
            .send(IncomingConnection {
                peer: self.local.clone(),
                link: theirs,
            })
            .map_err(|_| RadioError::ConnectFailed("peer radio shut down".into()))?;
        Ok(ours)
    }

    async fn next_incoming(&self) -> Result<IncomingConnection, RadioError> {
        self.incoming_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(RadioError::LinkClosed)
    }
}

/// One side of a paired in-memory link.
pub struct MemoryLink {
    peer_tx: mpsc::UnboundedSender<Vec<u8>>,
    local_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    closed: AtomicBool,
}

impl MemoryLink {
    /// Build a cross-wired pair: frames written on one side pop out of
    /// the other side's notification stream.
    pub fn pair() -> (Arc<MemoryLink>, Arc<MemoryLink>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(MemoryLink {
            peer_tx: b_tx,
            local_rx: parking_lot::Mutex::new(Some(a_rx)),
            closed: AtomicBool::new(false),
        });
        let b = Arc::new(MemoryLink {
            peer_tx: a_tx,
            local_rx: parking_lot::Mutex::new(Some(b_rx)),
            closed: AtomicBool::new(false),
        });
        (a, b)
    }
}

#[async_trait]
impl RadioLink for MemoryLink {
    async fn write(&self, frame: &[u8]) -> Result<(), RadioError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RadioError::LinkClosed);
        }
        self.peer_tx
            .send(frame.to_vec())
            .map_err(|_| RadioError::LinkClosed)
    }

    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.local_rx.lock().take()
    }

    async fn close(&self) -> Result<(), RadioError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
