//! # Ratchet Messenger
//!
//! The core of a peer-to-peer encrypted messenger: per-peer ratchet sessions,
//! relay signaling with connect race resolution, sequential task queues and
//! throttled encrypted file streams.
//!
//! ## Features
//!
//! - **Message Ratchet**: X25519 DH ratchet plus an HMAC-SHA256 chain, with a
//!   forced DH step after a configurable number of messages
//! - **Signed Sessions**: every session key and message envelope is signed
//!   with the sender's long-term Ed25519 key
//! - **Relay Signaling**: connect requests, accepts and transport negotiation
//!   routed through an in-process or TCP relay
//! - **File Streaming**: ChaCha20 + HMAC stream cipher behind a throttle
//! - **Pluggable Transports**: peers connect through any [`transport::PeerTransport`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ratchet_messenger::{Keyring, MemoryHub, MemoryTransportFactory, Messenger, MessengerConfig, Relay, UserProfile};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = Relay::new();
//!     let hub = MemoryHub::new();
//!
//!     let keyring = Keyring::new(UserProfile::new("alice".to_string()));
//!     let (signaling, signals) = relay.register(&keyring.profile().identity.id);
//!     let mut messenger = Messenger::start(
//!         MessengerConfig::default(),
//!         keyring,
//!         signaling,
//!         signals,
//!         Arc::new(MemoryTransportFactory::new(hub)),
//!     );
//!
//!     messenger.request_chat("<hex public key of a peer>").await?;
//!     while let Some(event) = messenger.next_event().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//!
//! - [`crypto`]: Long-term identities, fingerprints and the key ring
//! - [`session`]: Ratchet sessions, message and stream encryption
//! - [`queue`]: Sequential async task queue
//! - [`network`]: Signaling, relay and the peer connection manager
//! - [`transport`]: Peer wire protocol, transports and file pipelines
//! - [`utils`]: Configuration and error handling
//! - [`app`]: The [`Messenger`] composition root

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod network;
pub mod queue;
pub mod session;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::Messenger;
pub use crypto::{Identity, IdentityKeyPair, IdentityProvider, Keyring, UserProfile};
pub use network::{PeerEvent, PeerState, Relay, SignalingClient};
pub use queue::TaskQueue;
pub use session::SessionCrypto;
pub use transport::{ChatMessage, ContentType, MemoryHub, MemoryTransportFactory};
pub use utils::{MessengerConfig, MessengerError, Result};

/// Version information for the messenger protocol
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Default configuration values
pub mod defaults {
    /// Default relay address
    pub const DEFAULT_RELAY_ADDRESS: &str = "127.0.0.1:7000";

    /// Messages per sending chain before a forced DH ratchet step
    pub const DEFAULT_RATCHET_THRESHOLD: u32 = 10;

    /// Bytes written to a data channel per throttle period (16KB)
    pub const MESSAGE_CHUNK_SIZE: usize = 16 * 1024;

    /// Throttle period in milliseconds
    pub const MESSAGE_STREAM_PERIOD_MS: u64 = 50;
}
