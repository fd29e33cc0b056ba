//! Peer transport layer.
//!
//! This module defines the wire protocol spoken between peers, the
//! [`PeerTransport`] abstraction a connection manager drives, in-process and
//! TCP transports and the throttled file pipelines.

pub mod memory;
pub mod protocol;
pub mod tcp;
pub mod throttle;

pub use memory::{MemoryHub, MemoryTransportFactory};
pub use protocol::*;
pub use tcp::TcpTransportFactory;
pub use throttle::Throttle;

use crate::utils::{NetworkError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Write half of a data channel
pub type DataChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of a data channel
pub type DataChannelReader = Box<dyn AsyncRead + Send + Unpin>;

/// Which side opens the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Creates the offer
    Initiator,
    /// Answers the offer
    Receiver,
}

/// Something a transport reports to its owner
pub enum TransportEvent {
    /// Negotiation data to relay to the peer
    Signal(serde_json::Value),
    /// The transport is usable
    Connect,
    /// The transport closed
    Close,
    /// The transport failed
    Error(String),
    /// A message on the main channel
    Data(Vec<u8>),
    /// The peer opened a data channel
    DataChannel {
        /// Channel label chosen by the opener
        label: String,
        /// Incoming bytes
        reader: DataChannelReader,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(data) => f.debug_tuple("Signal").field(data).finish(),
            Self::Connect => f.write_str("Connect"),
            Self::Close => f.write_str("Close"),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Self::Data(data) => write!(f, "Data({} bytes)", data.len()),
            Self::DataChannel { label, .. } => {
                f.debug_struct("DataChannel").field("label", label).finish()
            }
        }
    }
}

/// Origin of a transport event: the peer and the link generation the
/// transport was created for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTag {
    /// Remote peer
    pub peer_id: String,
    /// Generation of the link, unique per manager
    pub link: u64,
}

/// Sending half of a transport event channel
pub type TransportEventSender = mpsc::UnboundedSender<(LinkTag, TransportEvent)>;

/// Event sink handed to a transport, tagging every event with its origin
#[derive(Debug, Clone)]
pub struct TransportEvents {
    tag: LinkTag,
    tx: TransportEventSender,
}

impl TransportEvents {
    /// Sink for the transport of link `link` to `peer_id`
    pub fn new(peer_id: impl Into<String>, link: u64, tx: TransportEventSender) -> Self {
        Self {
            tag: LinkTag {
                peer_id: peer_id.into(),
                link,
            },
            tx,
        }
    }

    /// Peer the events are about
    pub fn peer_id(&self) -> &str {
        &self.tag.peer_id
    }

    /// Deliver an event. Returns an error once the owner has gone away.
    pub fn emit(&self, event: TransportEvent) -> Result<()> {
        self.tx.send((self.tag.clone(), event)).map_err(|_| {
            NetworkError::ChannelClosed {
                name: format!("transport events for {}", self.tag.peer_id),
            }
            .into()
        })
    }
}

/// A direct connection to one peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Feed negotiation data received from the peer through signaling
    fn signal(&self, data: serde_json::Value) -> Result<()>;

    /// Send a message on the main channel
    async fn send(&self, data: Vec<u8>) -> Result<()>;

    /// Open a data channel labelled `label`
    async fn create_data_channel(&self, label: &str) -> Result<DataChannelWriter>;

    /// Close the connection
    fn destroy(&self);
}

/// Creates transports for a connection manager
pub trait PeerTransportFactory: Send + Sync {
    /// Create a transport to `peer_id`. An initiator starts negotiating
    /// immediately by emitting [`TransportEvent::Signal`].
    fn create(
        &self,
        peer_id: &str,
        role: PeerRole,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>>;
}
