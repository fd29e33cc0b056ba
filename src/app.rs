//! Messenger composition root.
//!
//! [`Messenger`] wires a [`SessionCrypto`], a [`SignalingClient`] and a
//! [`PeerConnectionManager`] together and performs the chat bootstrap: a
//! `chat-request` carries the sender's long-term key, the receiver imports it
//! and answers with `chat-accept`, and the requester then connects.

use crate::{
    crypto::{fingerprint, short_id, AuthRequest, IdentityProvider, Keyring},
    network::{
        signaling::ChatBootstrap, PeerConnectionManager, PeerEvent, PeerHandle, PeerState, Signal,
        SignalEvent, SignalingClient,
    },
    session::SessionCrypto,
    transport::{ChatMessage, ContentType, PeerTransportFactory},
    utils::{CryptoError, MessengerConfig, Result},
};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One running messenger instance
pub struct Messenger {
    id: String,
    public_key: String,
    config: MessengerConfig,
    signaling: SignalingClient,
    crypto: Arc<Mutex<SessionCrypto>>,
    peers: PeerHandle,
    events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl Messenger {
    /// Assemble a messenger on an existing signaling connection
    ///
    /// # Arguments
    ///
    /// * `config` - Ratchet, transfer and storage settings
    /// * `keyring` - Local identity and known contacts
    /// * `signaling` - Client registered with a relay
    /// * `signals` - Events the relay delivers to this client
    /// * `factory` - Creates peer transports
    pub fn start(
        config: MessengerConfig,
        keyring: Keyring,
        signaling: SignalingClient,
        signals: mpsc::UnboundedReceiver<SignalEvent>,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> Self {
        let id = keyring.id().to_string();
        let public_key = hex::encode(keyring.public_key());
        let crypto = Arc::new(Mutex::new(SessionCrypto::new(
            Box::new(keyring),
            config.crypto.ratchet_threshold,
        )));

        let (events_tx, events) = mpsc::unbounded_channel();
        let manager = PeerConnectionManager::new(
            signaling.clone(),
            factory,
            Arc::clone(&crypto),
            &config,
            events_tx,
        );
        let peers = manager.spawn(signals);
        info!("Messenger {} started", short_id(&id));

        Self {
            id,
            public_key,
            config,
            signaling,
            crypto,
            peers,
            events,
        }
    }

    /// Connect to the TCP relay named in the configuration and start
    pub async fn connect_relay(
        config: MessengerConfig,
        keyring: Keyring,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> Result<Self> {
        let (signaling, signals) =
            SignalingClient::connect(&config.signaling.relay_address, AuthRequest::new(&keyring))
                .await?;
        Ok(Self::start(config, keyring, signaling, signals, factory))
    }

    /// Own fingerprint
    pub fn local_id(&self) -> &str {
        &self.id
    }

    /// Own long-term public key as hex
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Configuration the messenger runs with
    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    /// Import a contact key and ask that peer to start a chat. Returns the
    /// peer's fingerprint.
    pub async fn request_chat(&self, public_key_hex: &str) -> Result<String> {
        let peer_id = self.import_key(public_key_hex).await?;
        self.signaling.send(Signal::ChatRequest(ChatBootstrap {
            receiver_id: peer_id.clone(),
            sender_public_key: self.public_key.clone(),
        }))?;
        info!("Chat requested with {}", short_id(&peer_id));
        Ok(peer_id)
    }

    /// Send a text message
    pub fn send_text(&self, peer_id: &str, text: &str) -> Result<ChatMessage> {
        let message = ChatMessage::text(&self.id, text)?;
        self.peers.send(peer_id, message.clone(), None)?;
        Ok(message)
    }

    /// Stream a file
    pub async fn send_file(
        &self,
        peer_id: &str,
        path: &Path,
        content_type: ContentType,
    ) -> Result<ChatMessage> {
        let message = ChatMessage::file(&self.id, path, content_type).await?;
        self.peers
            .send(peer_id, message.clone(), Some(path.to_path_buf()))?;
        Ok(message)
    }

    /// Start connecting to a known peer
    pub fn connect(&self, peer_id: &str) -> Result<()> {
        self.peers.connect(peer_id)
    }

    /// Tear down the connection to a peer
    pub fn disconnect(&self, peer_id: &str) -> Result<()> {
        self.peers.disconnect(peer_id)
    }

    /// Connection state of a peer
    pub async fn state(&self, peer_id: &str) -> Result<PeerState> {
        self.peers.state(peer_id).await
    }

    /// Disconnect, drop the ratchet session and forget the peer's key
    pub async fn delete_chat(&self, peer_id: &str) -> Result<bool> {
        self.peers.disconnect(peer_id)?;
        let mut crypto = self.crypto.lock().await;
        crypto.remove_session(peer_id);
        Ok(crypto.identity_mut().remove_peer(peer_id))
    }

    /// Next event from the connection manager. Chat requests and accepts are
    /// answered before they are returned.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        let event = self.events.recv().await?;
        match &event {
            PeerEvent::ChatRequest {
                sender_id,
                sender_public_key,
            } => {
                if let Err(e) = self.accept_chat(sender_id, sender_public_key).await {
                    warn!("Chat request from {sender_id} refused: {e}");
                }
            }
            PeerEvent::ChatAccept {
                sender_id,
                sender_public_key,
            } => {
                let connected = match self.import_claimed_key(sender_id, sender_public_key).await {
                    Ok(()) => self.peers.connect(sender_id),
                    Err(e) => Err(e),
                };
                if let Err(e) = connected {
                    warn!("Chat accept from {sender_id} refused: {e}");
                }
            }
            _ => {}
        }
        Some(event)
    }

    async fn accept_chat(&self, sender_id: &str, sender_public_key: &str) -> Result<()> {
        self.import_claimed_key(sender_id, sender_public_key).await?;
        self.signaling.send(Signal::ChatAccept(ChatBootstrap {
            receiver_id: sender_id.to_string(),
            sender_public_key: self.public_key.clone(),
        }))?;
        info!("Chat accepted with {}", short_id(sender_id));
        Ok(())
    }

    async fn import_key(&self, public_key_hex: &str) -> Result<String> {
        let public_key = hex::decode(public_key_hex.trim())?;
        self.crypto
            .lock()
            .await
            .identity_mut()
            .add_peer(&public_key)
    }

    /// Import a key relayed on behalf of `sender_id`, which must be its
    /// fingerprint
    async fn import_claimed_key(&self, sender_id: &str, public_key_hex: &str) -> Result<()> {
        let public_key = hex::decode(public_key_hex)?;
        if fingerprint(&public_key) != sender_id {
            return Err(CryptoError::InvalidKey {
                reason: "public key does not match sender id".to_string(),
            }
            .into());
        }
        self.import_key(public_key_hex).await.map(|_| ())
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Relay;
    use crate::transport::{MemoryHub, MemoryTransportFactory};
    use crate::UserProfile;

    fn messenger(relay: &Arc<Relay>, hub: &Arc<MemoryHub>) -> Messenger {
        let keyring = Keyring::new(UserProfile::new("test".into()));
        let (signaling, signals) = relay.register(keyring.id());
        Messenger::start(
            MessengerConfig::default(),
            keyring,
            signaling,
            signals,
            Arc::new(MemoryTransportFactory::new(Arc::clone(hub))),
        )
    }

    #[tokio::test]
    async fn test_identity_accessors() {
        let m = messenger(&Relay::new(), &MemoryHub::new());
        assert_eq!(m.local_id().len(), 64);
        assert_eq!(
            fingerprint(&hex::decode(m.public_key()).unwrap()),
            m.local_id()
        );
    }

    #[tokio::test]
    async fn test_chat_request_to_offline_peer() {
        let relay = Relay::new();
        let mut alice = messenger(&relay, &MemoryHub::new());
        let stranger = UserProfile::new("offline".into());

        let peer_id = alice
            .request_chat(&hex::encode(stranger.identity.public_key))
            .await
            .unwrap();
        assert_eq!(peer_id, stranger.identity.id);

        match alice.next_event().await.unwrap() {
            PeerEvent::UnknownReceiver { receiver_id, kind } => {
                assert_eq!(receiver_id, peer_id);
                assert_eq!(kind.as_deref(), Some("chat-request"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_forged_chat_request_is_refused() {
        let relay = Relay::new();
        let mut alice = messenger(&relay, &MemoryHub::new());
        let (mallory, _rx) = relay.register("mallory");
        let victim = UserProfile::new("victim".into());

        mallory
            .send(Signal::ChatRequest(ChatBootstrap {
                receiver_id: alice.local_id().to_string(),
                sender_public_key: hex::encode(victim.identity.public_key),
            }))
            .unwrap();

        assert!(matches!(
            alice.next_event().await,
            Some(PeerEvent::ChatRequest { .. })
        ));
        assert!(!alice.crypto.lock().await.knows(&victim.identity.id));
        assert!(!alice.crypto.lock().await.knows("mallory"));
    }

    #[tokio::test]
    async fn test_delete_chat_forgets_key() {
        let m = messenger(&Relay::new(), &MemoryHub::new());
        let peer = UserProfile::new("peer".into());
        let peer_id = m.import_key(&hex::encode(peer.identity.public_key)).await.unwrap();

        assert!(m.delete_chat(&peer_id).await.unwrap());
        assert!(!m.delete_chat(&peer_id).await.unwrap());
    }
}
