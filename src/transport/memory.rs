//! In-process peer transport.
//!
//! Peers sharing a [`MemoryHub`] connect through the same offer/answer dance a
//! network transport would use: the initiator publishes an offer token that
//! travels over signaling, the receiver claims it and answers. Both ends are
//! connected the moment the offer is claimed. Data channels are
//! `tokio::io::duplex` pipes.

use super::{
    DataChannelWriter, PeerRole, PeerTransport, PeerTransportFactory, TransportEvent,
    TransportEvents,
};
use crate::utils::{NetworkError, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Buffer size of a data channel pipe
const CHANNEL_BUFFER: usize = 64 * 1024;

type Link = Arc<Mutex<Option<TransportEvents>>>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Negotiation {
    Offer { token: String },
    Answer { token: String },
}

struct Offer {
    initiator_events: TransportEvents,
    initiator_link: Link,
}

/// Rendezvous point for in-process transports
#[derive(Default)]
pub struct MemoryHub {
    offers: Mutex<HashMap<String, Offer>>,
    next_token: AtomicU64,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of offers not yet answered
    pub fn pending_offers(&self) -> usize {
        locked(&self.offers).len()
    }
}

/// Factory producing [`MemoryTransport`]s on one hub
#[derive(Clone)]
pub struct MemoryTransportFactory {
    hub: Arc<MemoryHub>,
}

impl MemoryTransportFactory {
    /// Factory bound to `hub`
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }
}

impl PeerTransportFactory for MemoryTransportFactory {
    fn create(
        &self,
        peer_id: &str,
        role: PeerRole,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = MemoryTransport {
            hub: Arc::clone(&self.hub),
            role,
            events,
            remote: Arc::new(Mutex::new(None)),
            token: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        };

        if role == PeerRole::Initiator {
            let token = format!(
                "offer-{}",
                self.hub.next_token.fetch_add(1, Ordering::Relaxed)
            );
            locked(&self.hub.offers).insert(
                token.clone(),
                Offer {
                    initiator_events: transport.events.clone(),
                    initiator_link: Arc::clone(&transport.remote),
                },
            );
            *locked(&transport.token) = Some(token.clone());
            debug!("Published offer {token} for {peer_id}");
            transport.events.emit(TransportEvent::Signal(serde_json::to_value(
                Negotiation::Offer { token },
            )?))?;
        }

        Ok(Arc::new(transport))
    }
}

/// One end of an in-process connection
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    role: PeerRole,
    events: TransportEvents,
    remote: Link,
    token: Mutex<Option<String>>,
    destroyed: AtomicBool,
}

impl MemoryTransport {
    fn remote(&self) -> Result<TransportEvents> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(self.not_connected());
        }
        locked(&self.remote).clone().ok_or_else(|| self.not_connected())
    }

    fn not_connected(&self) -> crate::MessengerError {
        NetworkError::NotConnected {
            peer_id: self.events.peer_id().to_string(),
        }
        .into()
    }

    fn answer(&self, token: String) -> Result<()> {
        let offer = locked(&self.hub.offers)
            .remove(&token)
            .ok_or_else(|| NetworkError::Transport {
                reason: format!("unknown offer {token}"),
            })?;

        *locked(&offer.initiator_link) = Some(self.events.clone());
        *locked(&self.remote) = Some(offer.initiator_events.clone());

        self.events.emit(TransportEvent::Signal(serde_json::to_value(
            Negotiation::Answer { token },
        )?))?;
        // Each side must see Connect before any data from the other side.
        self.events.emit(TransportEvent::Connect)?;
        offer.initiator_events.emit(TransportEvent::Connect)
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn signal(&self, data: serde_json::Value) -> Result<()> {
        let negotiation: Negotiation =
            serde_json::from_value(data).map_err(|e| NetworkError::Transport {
                reason: format!("bad negotiation payload: {e}"),
            })?;

        match (self.role, negotiation) {
            (PeerRole::Receiver, Negotiation::Offer { token }) => self.answer(token),
            (PeerRole::Initiator, Negotiation::Answer { token }) => {
                locked(&self.token).take();
                if locked(&self.remote).is_none() {
                    return Err(NetworkError::Transport {
                        reason: format!("answer {token} without a linked peer"),
                    }
                    .into());
                }
                debug!("Offer {token} answered");
                Ok(())
            }
            (role, negotiation) => {
                warn!("Ignoring {negotiation:?} as {role:?}");
                Ok(())
            }
        }
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.remote()?.emit(TransportEvent::Data(data))
    }

    async fn create_data_channel(&self, label: &str) -> Result<DataChannelWriter> {
        let remote = self.remote()?;
        let (writer, reader) = tokio::io::duplex(CHANNEL_BUFFER);
        remote.emit(TransportEvent::DataChannel {
            label: label.to_string(),
            reader: Box::new(reader),
        })?;
        Ok(Box::new(writer))
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(token) = locked(&self.token).take() {
            locked(&self.hub.offers).remove(&token);
        }
        if let Some(remote) = locked(&self.remote).take() {
            let _ = remote.emit(TransportEvent::Close);
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LinkTag;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    type Inbox = mpsc::UnboundedReceiver<(LinkTag, TransportEvent)>;

    fn sink(peer_id: &str) -> (TransportEvents, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportEvents::new(peer_id, 0, tx), rx)
    }

    /// Link alice (initiator) and bob (receiver) by relaying signals by hand
    async fn linked() -> (Arc<dyn PeerTransport>, Inbox, Arc<dyn PeerTransport>, Inbox) {
        let factory = MemoryTransportFactory::new(MemoryHub::new());
        let (alice_events, mut alice_rx) = sink("bob");
        let (bob_events, mut bob_rx) = sink("alice");

        let alice = factory.create("bob", PeerRole::Initiator, alice_events).unwrap();
        let bob = factory.create("alice", PeerRole::Receiver, bob_events).unwrap();

        let Some((_, TransportEvent::Signal(offer))) = alice_rx.recv().await else {
            panic!("expected offer");
        };
        bob.signal(offer).unwrap();
        let Some((_, TransportEvent::Signal(answer))) = bob_rx.recv().await else {
            panic!("expected answer");
        };
        assert!(matches!(bob_rx.recv().await, Some((_, TransportEvent::Connect))));
        assert!(matches!(alice_rx.recv().await, Some((_, TransportEvent::Connect))));
        alice.signal(answer).unwrap();
        assert!(alice_rx.try_recv().is_err());

        (alice, alice_rx, bob, bob_rx)
    }

    #[tokio::test]
    async fn test_messages_are_tagged_with_sender_as_seen_by_receiver() {
        let (alice, _alice_rx, bob, mut bob_rx) = linked().await;
        alice.send(b"ping".to_vec()).await.unwrap();

        let (peer, event) = bob_rx.recv().await.unwrap();
        assert_eq!(peer.peer_id, "alice");
        assert!(matches!(event, TransportEvent::Data(ref d) if d == b"ping"));
        drop(bob);
    }

    #[tokio::test]
    async fn test_data_channel_carries_label_and_bytes() {
        let (alice, _alice_rx, _bob, mut bob_rx) = linked().await;

        let mut writer = alice.create_data_channel("label-json").await.unwrap();
        let Some((_, TransportEvent::DataChannel { label, mut reader })) = bob_rx.recv().await
        else {
            panic!("expected data channel");
        };
        assert_eq!(label, "label-json");

        writer.write_all(b"chunk").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"chunk");
    }

    #[tokio::test]
    async fn test_destroy_closes_remote_and_blocks_sends() {
        let (alice, _alice_rx, _bob, mut bob_rx) = linked().await;
        alice.destroy();

        assert!(matches!(bob_rx.recv().await, Some((_, TransportEvent::Close))));
        assert!(alice.send(b"late".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_unanswered_offer_is_withdrawn_on_destroy() {
        let hub = MemoryHub::new();
        let factory = MemoryTransportFactory::new(Arc::clone(&hub));
        let (events, _rx) = sink("bob");
        let alice = factory.create("bob", PeerRole::Initiator, events).unwrap();

        assert_eq!(hub.pending_offers(), 1);
        assert!(alice.send(b"early".to_vec()).await.is_err());
        alice.destroy();
        assert_eq!(hub.pending_offers(), 0);
    }

    #[tokio::test]
    async fn test_bad_negotiation_payload() {
        let factory = MemoryTransportFactory::new(MemoryHub::new());
        let (events, _rx) = sink("alice");
        let bob = factory.create("alice", PeerRole::Receiver, events).unwrap();

        assert!(bob.signal(serde_json::json!({"sdp": 1})).is_err());
        assert!(bob
            .signal(serde_json::json!({"type": "offer", "token": "missing"}))
            .is_err());
    }
}
