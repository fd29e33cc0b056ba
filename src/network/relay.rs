//! Signaling relay.
//!
//! Routes [`OutboundSignal`]s to the client they are addressed to. Clients
//! either live in-process ([`Relay::register`]) or connect over TCP
//! ([`Relay::serve`]) and authenticate with a signed [`AuthRequest`].

use super::signaling::{
    read_frame, write_frame, OutboundSignal, SignalEvent, SignalingClient, UnknownReceiver,
};
use crate::crypto::{short_id, AuthRequest};
use crate::utils::{NetworkError, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

type EventSender = mpsc::UnboundedSender<SignalEvent>;

/// Message router between signaling clients
#[derive(Default)]
pub struct Relay {
    clients: Mutex<HashMap<String, EventSender>>,
}

impl Relay {
    /// Create a relay with no clients
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, EventSender>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach an in-process client. The client is detached once every clone
    /// of the returned [`SignalingClient`] is dropped.
    pub fn register(
        self: &Arc<Self>,
        id: &str,
    ) -> (SignalingClient, mpsc::UnboundedReceiver<SignalEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.clients().insert(id.to_string(), events_tx.clone());

        let (client, mut outbound) = SignalingClient::channel(id);
        let relay = Arc::clone(self);
        let client_id = id.to_string();
        tokio::spawn(async move {
            while let Some(signal) = outbound.recv().await {
                relay.route(signal);
            }
            relay.unregister_channel(&client_id, &events_tx);
        });

        debug!("Registered {id} with the relay");
        (client, events_rx)
    }

    /// Detach a client
    pub fn unregister(&self, id: &str) -> bool {
        self.clients().remove(id).is_some()
    }

    fn unregister_channel(&self, id: &str, events: &EventSender) {
        let mut clients = self.clients();
        if clients.get(id).is_some_and(|tx| tx.same_channel(events)) {
            clients.remove(id);
            debug!("Unregistered {id} from the relay");
        }
    }

    /// Returns true if `id` is attached
    pub fn is_registered(&self, id: &str) -> bool {
        self.clients().contains_key(id)
    }

    /// Number of attached clients
    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// Deliver `signal` to its receiver, or tell the sender the receiver is
    /// unknown
    pub fn route(&self, signal: OutboundSignal) {
        let sender_id = signal.sender_id.clone();
        let kind = signal.signal.kind();
        let (receiver_id, event) = signal.into_delivery();

        let mut clients = self.clients();
        if let Some(tx) = clients.get(&receiver_id) {
            if tx.send(event).is_ok() {
                return;
            }
            clients.remove(&receiver_id);
        }

        debug!("No client {receiver_id} for {kind} from {sender_id}");
        if let Some(tx) = clients.get(&sender_id) {
            let _ = tx.send(SignalEvent::UnknownReceiver(UnknownReceiver {
                receiver_id,
                kind: Some(kind.to_string()),
            }));
        }
    }

    /// Accept TCP clients until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            let relay = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(stream).await {
                    warn!("Relay connection {addr} ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let Some(frame) = read_frame(&mut reader).await? else {
            return Ok(());
        };
        let auth: AuthRequest = serde_json::from_slice(&frame)?;
        let id = auth.verify().map_err(|e| NetworkError::Authentication {
            reason: e.to_string(),
        })?;
        info!("Client {} authenticated", short_id(&id));

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SignalEvent>();
        if self.clients().insert(id.clone(), events_tx.clone()).is_some() {
            info!("Client {} replaced an older connection", short_id(&id));
        }

        let forward = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let sent = match serde_json::to_vec(&event) {
                    Ok(frame) => write_frame(&mut writer, &frame).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    warn!("Failed to deliver relay event: {e}");
                    break;
                }
            }
        });

        let result = async {
            while let Some(frame) = read_frame(&mut reader).await? {
                match serde_json::from_slice::<OutboundSignal>(&frame) {
                    Ok(mut signal) => {
                        // Clients cannot speak for anyone else.
                        signal.sender_id.clone_from(&id);
                        self.route(signal);
                    }
                    Err(e) => warn!("Dropping malformed signal from {}: {e}", short_id(&id)),
                }
            }
            Ok(())
        }
        .await;

        self.unregister_channel(&id, &events_tx);
        forward.abort();
        info!("Client {} disconnected", short_id(&id));
        result
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("clients", &self.client_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Keyring, UserProfile};
    use crate::network::signaling::{Signal, SignalAccept, SignalRequest};

    #[tokio::test]
    async fn test_in_process_delivery() {
        let relay = Relay::new();
        let (alice, _alice_rx) = relay.register("alice");
        let (_bob, mut bob_rx) = relay.register("bob");

        alice
            .send(Signal::SignalRequest(SignalRequest {
                receiver_id: "bob".into(),
                timestamp: "t".into(),
            }))
            .unwrap();

        match bob_rx.recv().await.unwrap() {
            SignalEvent::SignalRequest(request) => {
                assert_eq!(request.sender_id, "alice");
                assert_eq!(request.timestamp, "t");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_receiver_goes_back_to_sender() {
        let relay = Relay::new();
        let (alice, mut alice_rx) = relay.register("alice");

        alice
            .send(Signal::SignalAccept(SignalAccept {
                receiver_id: "nobody".into(),
            }))
            .unwrap();

        assert_eq!(
            alice_rx.recv().await.unwrap(),
            SignalEvent::UnknownReceiver(UnknownReceiver {
                receiver_id: "nobody".into(),
                kind: Some("signal-accept".into()),
            })
        );
    }

    #[tokio::test]
    async fn test_client_detached_when_dropped() {
        let relay = Relay::new();
        let (alice, _rx) = relay.register("alice");
        assert!(relay.is_registered("alice"));

        drop(alice);
        for _ in 0..100 {
            if !relay.is_registered("alice") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!relay.is_registered("alice"));
    }

    #[tokio::test]
    async fn test_tcp_clients_are_authenticated_and_routed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let relay = Relay::new();
        tokio::spawn(Arc::clone(&relay).serve(listener));

        let alice = Keyring::new(UserProfile::new("alice".into()));
        let bob = Keyring::new(UserProfile::new("bob".into()));

        let (alice_client, _alice_rx) =
            SignalingClient::connect(&address, AuthRequest::new(&alice)).await.unwrap();
        let (bob_client, mut bob_rx) =
            SignalingClient::connect(&address, AuthRequest::new(&bob)).await.unwrap();
        assert_eq!(bob_client.id(), bob.profile().identity.id);

        // Wait until both connections have been registered.
        for _ in 0..200 {
            if relay.client_count() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        alice_client
            .send(Signal::SignalAccept(SignalAccept {
                receiver_id: bob_client.id().to_string(),
            }))
            .unwrap();

        match bob_rx.recv().await.unwrap() {
            SignalEvent::SignalAccept(from) => assert_eq!(from.sender_id, alice_client.id()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
