//! # Link Layer
//!
//! The radio transport boundary and the connection lifecycle manager that
//! sits on top of it. One authenticated session per peer, a bounded number
//! of peers, traffic-as-heartbeat liveness, and bounded reconnection.

pub mod manager;
pub mod radio;

pub use manager::{
    ConnectionHealth, LinkConfig, LinkError, LinkEvent, LinkManager, SessionState,
};
pub use radio::{
    DiscoveredPeer, IncomingConnection, MemoryHub, MemoryLink, MemoryRadio, RadioError, RadioLink,
    RadioTransport, ScanFilter,
};
