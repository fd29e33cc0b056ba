//! Signaling and peer connectivity.
//!
//! This module provides the relay signaling client and wire types, an
//! in-process and TCP relay, and the connection manager that turns signaling
//! into encrypted peer transports.

pub mod peers;
pub mod relay;
pub mod signaling;

pub use peers::{PeerCommand, PeerConnectionManager, PeerEvent, PeerHandle, PeerState};
pub use relay::Relay;
pub use signaling::{Signal, SignalEvent, SignalingClient};
