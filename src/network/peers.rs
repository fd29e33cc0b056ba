//! Peer connection lifecycle.
//!
//! [`PeerConnectionManager`] owns every transport to a remote peer. It turns
//! signaling events into transports, resolves simultaneous connect requests,
//! sends the signed session key once a transport connects and runs the
//! encrypted send and receive pipelines on two [`TaskQueue`]s.
//!
//! The manager is an actor: [`PeerConnectionManager::spawn`] moves it onto a
//! task and returns a cloneable [`PeerHandle`]. Everything the manager
//! observes is reported as a [`PeerEvent`].
//!
//! # Connect races
//!
//! When both peers send `signal-request` before either sees the other's, the
//! request that is earlier by `(timestamp, sender id)` wins. The side whose
//! request lost accepts the winner and drops its own request; the winner waits
//! for that accept and becomes the initiator.

use super::signaling::{Signal, SignalAccept, SignalData, SignalEvent, SignalRequest, SignalingClient};
use crate::crypto::{hash_file, now_timestamp, short_id};
use crate::queue::TaskQueue;
use crate::session::{Decrypted, Encrypted, SessionCrypto};
use crate::transport::throttle::{receive_stream, send_stream};
use crate::transport::{
    ChatMessage, DataChannelReader, LinkTag, PeerMessage, PeerRole, PeerTransport,
    PeerTransportFactory, Throttle, TransportEvent, TransportEventSender, TransportEvents,
};
use crate::utils::{
    MessengerConfig, MessengerError, NetworkError, ProtocolError, Result, SessionError,
    TransferConfig,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

/// Connection state of one peer as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No request and no transport
    Idle,
    /// Own `signal-request` is waiting for an accept
    RequestSent,
    /// Transport created, negotiation in progress
    Connecting(PeerRole),
    /// Transport connected
    Connected(PeerRole),
}

/// Own outstanding connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConnectRequest {
    /// Peer the request went to
    pub receiver_id: String,
    /// RFC 3339 time the request was sent
    pub timestamp: String,
}

/// Everything the manager reports
#[derive(Debug)]
pub enum PeerEvent {
    /// Transport connected and the local session key was sent
    Connected {
        /// Remote peer
        peer_id: String,
        /// Local role in the negotiation
        role: PeerRole,
    },
    /// Transport closed
    Disconnected {
        /// Remote peer
        peer_id: String,
    },
    /// Transport failed and was torn down
    Error {
        /// Remote peer
        peer_id: String,
        /// Failure description
        error: String,
    },
    /// A message was received and decrypted
    Message {
        /// Remote peer
        peer_id: String,
        /// Plaintext message
        message: ChatMessage,
        /// Where a received file was written
        file: Option<PathBuf>,
    },
    /// A queued send failed
    SendError {
        /// Id of the message that failed
        task_id: Option<String>,
        /// What went wrong
        error: MessengerError,
    },
    /// Processing an incoming message failed
    ReceiveError {
        /// Id of the failed task, if any
        task_id: Option<String>,
        /// What went wrong
        error: MessengerError,
    },
    /// A peer asks to start a chat
    ChatRequest {
        /// Requesting peer
        sender_id: String,
        /// Hex long-term key of the requesting peer
        sender_public_key: String,
    },
    /// A peer accepted a chat request
    ChatAccept {
        /// Accepting peer
        sender_id: String,
        /// Hex long-term key of the accepting peer
        sender_public_key: String,
    },
    /// The relay could not deliver a signal
    UnknownReceiver {
        /// Peer the signal was addressed to
        receiver_id: String,
        /// Kind of the undelivered signal
        kind: Option<String>,
    },
    /// Input from a peer was refused
    Rejected {
        /// Offending peer
        peer_id: String,
        /// Why it was refused
        reason: String,
    },
}

/// Requests a [`PeerHandle`] sends to the manager
#[derive(Debug)]
pub enum PeerCommand {
    /// Start connecting to a peer
    Connect {
        /// Remote peer
        peer_id: String,
    },
    /// Tear down the connection to a peer
    Disconnect {
        /// Remote peer
        peer_id: String,
    },
    /// Queue a message
    Send {
        /// Remote peer
        peer_id: String,
        /// Message to encrypt
        message: ChatMessage,
        /// File to stream for file content
        content_path: Option<PathBuf>,
    },
    /// Report a peer's state
    State {
        /// Remote peer
        peer_id: String,
        /// Where to send the answer
        reply: oneshot::Sender<PeerState>,
    },
}

/// Cloneable handle to a running manager
#[derive(Debug, Clone)]
pub struct PeerHandle {
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    fn command(&self, command: PeerCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| {
            NetworkError::ChannelClosed {
                name: "peer manager".to_string(),
            }
            .into()
        })
    }

    /// Start connecting to `peer_id`
    pub fn connect(&self, peer_id: &str) -> Result<()> {
        self.command(PeerCommand::Connect {
            peer_id: peer_id.to_string(),
        })
    }

    /// Tear down the connection to `peer_id`
    pub fn disconnect(&self, peer_id: &str) -> Result<()> {
        self.command(PeerCommand::Disconnect {
            peer_id: peer_id.to_string(),
        })
    }

    /// Queue `message` for `peer_id`, streaming `content_path` for files
    pub fn send(
        &self,
        peer_id: &str,
        message: ChatMessage,
        content_path: Option<PathBuf>,
    ) -> Result<()> {
        self.command(PeerCommand::Send {
            peer_id: peer_id.to_string(),
            message,
            content_path,
        })
    }

    /// Current state of `peer_id`
    pub async fn state(&self, peer_id: &str) -> Result<PeerState> {
        let (reply, answer) = oneshot::channel();
        self.command(PeerCommand::State {
            peer_id: peer_id.to_string(),
            reply,
        })?;
        answer.await.map_err(|_| {
            NetworkError::ChannelClosed {
                name: "peer manager".to_string(),
            }
            .into()
        })
    }
}

/// Only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LinkState {
    Negotiating,
    Connected,
    /// The peer's session key has been applied
    Ready,
    Closed,
}

/// A send waiting for its link to become ready
struct Outgoing {
    message: ChatMessage,
    content_path: Option<PathBuf>,
}

#[derive(Clone)]
struct PeerLink {
    transport: Arc<dyn PeerTransport>,
    role: PeerRole,
    generation: u64,
    state: Arc<watch::Sender<LinkState>>,
    outbox: mpsc::UnboundedSender<Outgoing>,
}

impl PeerLink {
    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    fn set(&self, state: LinkState) {
        self.state.send_if_modified(|current| {
            if *current >= state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn close(&self) {
        if self.state.send_replace(LinkState::Closed) != LinkState::Closed {
            self.transport.destroy();
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state(), LinkState::Connected | LinkState::Ready)
    }
}

type Links = Arc<StdMutex<HashMap<String, PeerLink>>>;

fn locked(links: &Links) -> MutexGuard<'_, HashMap<String, PeerLink>> {
    links.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_connected(peer_id: &str) -> MessengerError {
    NetworkError::NotConnected {
        peer_id: peer_id.to_string(),
    }
    .into()
}

/// State shared with queued tasks
#[derive(Clone)]
struct Pipeline {
    crypto: Arc<Mutex<SessionCrypto>>,
    links: Links,
    events: mpsc::UnboundedSender<PeerEvent>,
    transfer: TransferConfig,
    media_dir: PathBuf,
}

impl Pipeline {
    fn emit(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            debug!("Peer event dropped, no listener");
        }
    }

    fn link(&self, peer_id: &str) -> Option<PeerLink> {
        locked(&self.links).get(peer_id).cloned()
    }

    async fn send(
        self,
        peer_id: String,
        message: ChatMessage,
        content_path: Option<PathBuf>,
    ) -> Result<()> {
        let link = self
            .link(&peer_id)
            .filter(|l| l.state() == LinkState::Ready)
            .ok_or_else(|| not_connected(&peer_id))?;

        // Open the file before a message key is spent on it.
        let file = match &content_path {
            Some(path) => Some(tokio::fs::File::open(path).await?),
            None => None,
        };

        let Encrypted {
            message: envelope,
            content_cipher,
        } = self
            .crypto
            .lock()
            .await
            .encrypt(&peer_id, &message, file.is_some())?;
        let payload = PeerMessage::Message(envelope).to_json()?;

        match (file, content_cipher) {
            (Some(file), Some(cipher)) => {
                let channel = link.transport.create_data_channel(&payload).await?;
                let mut throttle = Throttle::new(self.transfer.chunk_size, self.transfer.period());
                let sent = send_stream(file, cipher, channel, &mut throttle).await?;
                info!("Sent {} ({sent} bytes) to {}", message.content, short_id(&peer_id));
            }
            _ => {
                link.transport.send(payload.into_bytes()).await?;
                debug!("Sent message {} to {}", short_id(&message.id), short_id(&peer_id));
            }
        }
        Ok(())
    }

    async fn receive_data(self, peer_id: String, link: PeerLink, data: Vec<u8>) -> Result<()> {
        // Until the peer's session key is in, the only acceptable input is
        // that key.
        let handshake = link.state() < LinkState::Ready;
        let message = match PeerMessage::from_slice(&data) {
            Ok(message) => message,
            Err(e) if handshake => {
                self.reject(&peer_id, &link, "malformed session key");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        match message {
            PeerMessage::Key(key) => {
                let started = self.crypto.lock().await.start_session(&peer_id, &key);
                match started {
                    Ok(true) => link.set(LinkState::Ready),
                    Ok(false) => {
                        self.reject(&peer_id, &link, "session key signature did not verify");
                    }
                    Err(e) => {
                        self.reject(&peer_id, &link, "unusable session key");
                        return Err(e);
                    }
                }
            }
            PeerMessage::Message(_) if handshake => {
                self.reject(&peer_id, &link, "message before session key");
                return Err(SessionError::InvalidState {
                    state: "no session key from peer".to_string(),
                }
                .into());
            }
            PeerMessage::Message(envelope) => {
                if envelope.content_type.is_file() {
                    return Err(ProtocolError::InvalidMessage {
                        reason: format!("{} content outside a data channel", envelope.content_type),
                    }
                    .into());
                }
                let decrypted = self.crypto.lock().await.decrypt(&peer_id, &envelope, false)?;
                if let Some(Decrypted { message, .. }) = decrypted {
                    self.emit(PeerEvent::Message {
                        peer_id,
                        message,
                        file: None,
                    });
                }
            }
        }
        Ok(())
    }

    /// Drop `link` and report the peer as refused and disconnected
    fn reject(&self, peer_id: &str, link: &PeerLink, reason: &str) {
        warn!("Closing link to {}: {reason}", short_id(peer_id));
        {
            let mut links = locked(&self.links);
            if links
                .get(peer_id)
                .is_some_and(|current| current.generation == link.generation)
            {
                links.remove(peer_id);
            }
        }
        link.close();
        self.emit(PeerEvent::Rejected {
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
        });
        self.emit(PeerEvent::Disconnected {
            peer_id: peer_id.to_string(),
        });
    }

    async fn receive_file(
        self,
        peer_id: String,
        label: String,
        reader: DataChannelReader,
    ) -> Result<()> {
        let PeerMessage::Message(envelope) = PeerMessage::from_slice(label.as_bytes())? else {
            return Err(ProtocolError::InvalidMessageType {
                message_type: "key".to_string(),
            }
            .into());
        };

        let decrypted = self.crypto.lock().await.decrypt(&peer_id, &envelope, true)?;
        let Some(Decrypted {
            message,
            content_decipher: Some(decipher),
        }) = decrypted
        else {
            return Ok(());
        };

        let dir = self
            .media_dir
            .join(&peer_id)
            .join(message.content_type.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(sanitize_file_name(&message.content)?);

        let written = async {
            let file = tokio::fs::File::create(&path).await?;
            let bytes = receive_stream(reader, decipher, file).await?;
            if let Some(expected) = &message.content_hash {
                if hash_file(&path).await? != *expected {
                    return Err(ProtocolError::ChecksumMismatch.into());
                }
            }
            Ok::<_, MessengerError>(bytes)
        }
        .await;

        match written {
            Ok(bytes) => {
                info!("Received {} ({bytes} bytes) from {}", path.display(), short_id(&peer_id));
                self.emit(PeerEvent::Message {
                    peer_id,
                    message,
                    file: Some(path),
                });
                Ok(())
            }
            Err(e) => {
                if let Err(remove) = tokio::fs::remove_file(&path).await {
                    warn!("Could not remove partial file {}: {remove}", path.display());
                }
                Err(e)
            }
        }
    }
}

/// Reduce a received file name to a plain base name
fn sanitize_file_name(name: &str) -> Result<&str> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            ProtocolError::InvalidMessage {
                reason: format!("unusable file name {name:?}"),
            }
            .into()
        })
}

fn request_time(timestamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Hand a link's sends to the sending queue, in order, once the peer's
/// session key is in. Sends for a link that closes first fail with
/// `NotConnected`.
async fn forward_when_ready(
    pipeline: Pipeline,
    sending: TaskQueue,
    peer_id: String,
    mut state: watch::Receiver<LinkState>,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
) {
    let ready = state
        .wait_for(|s| matches!(s, LinkState::Ready | LinkState::Closed))
        .await
        .is_ok_and(|s| *s == LinkState::Ready);

    while let Some(Outgoing {
        message,
        content_path,
    }) = outbox.recv().await
    {
        let id = message.id.clone();
        if ready {
            let task = pipeline.clone().send(peer_id.clone(), message, content_path);
            sending.add(task, Some(id));
        } else {
            pipeline.emit(PeerEvent::SendError {
                task_id: Some(id),
                error: not_connected(&peer_id),
            });
        }
    }
}

/// Owner of all peer transports of one local identity
pub struct PeerConnectionManager {
    signaling: SignalingClient,
    factory: Arc<dyn PeerTransportFactory>,
    pipeline: Pipeline,
    pending: HashMap<String, PendingConnectRequest>,
    next_link: u64,
    transport_tx: TransportEventSender,
    transport_rx: mpsc::UnboundedReceiver<(LinkTag, TransportEvent)>,
    sending: TaskQueue,
    receiving: TaskQueue,
}

impl PeerConnectionManager {
    /// Create a manager
    ///
    /// # Arguments
    ///
    /// * `signaling` - Client used for every outgoing signal
    /// * `factory` - Creates the transports
    /// * `crypto` - Session table shared with the rest of the messenger
    /// * `config` - Transfer pacing and media directory
    /// * `events` - Where [`PeerEvent`]s go
    pub fn new(
        signaling: SignalingClient,
        factory: Arc<dyn PeerTransportFactory>,
        crypto: Arc<Mutex<SessionCrypto>>,
        config: &MessengerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let send_events = events.clone();
        let sending = TaskQueue::new("sending", move |failure| {
            let _ = send_events.send(PeerEvent::SendError {
                task_id: failure.id,
                error: failure.error,
            });
        });
        let receive_events = events.clone();
        let receiving = TaskQueue::new("receiving", move |failure| {
            let _ = receive_events.send(PeerEvent::ReceiveError {
                task_id: failure.id,
                error: failure.error,
            });
        });

        Self {
            signaling,
            factory,
            pipeline: Pipeline {
                crypto,
                links: Arc::new(StdMutex::new(HashMap::new())),
                events,
                transfer: config.transfer.clone(),
                media_dir: config.storage.media_dir.clone(),
            },
            pending: HashMap::new(),
            next_link: 0,
            transport_tx,
            transport_rx,
            sending,
            receiving,
        }
    }

    /// Run the manager on its own task
    pub fn spawn(self, signals: mpsc::UnboundedReceiver<SignalEvent>) -> PeerHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(signals, commands_rx));
        PeerHandle {
            commands: commands_tx,
        }
    }

    /// Process signaling events, transport events and commands until every
    /// [`PeerHandle`] is dropped
    pub async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<SignalEvent>,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) {
        info!("Peer manager for {} running", short_id(self.signaling.id()));
        loop {
            tokio::select! {
                Some(event) = signals.recv() => {
                    if let Err(e) = self.handle_signal_event(event).await {
                        warn!("Signal handling failed: {e}");
                    }
                }
                Some((tag, event)) = self.transport_rx.recv() => {
                    self.handle_transport_event(tag, event).await;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }
        self.shutdown();
    }

    async fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Connect { peer_id } => {
                if let Err(e) = self.connect(&peer_id) {
                    warn!("Connect to {} failed: {e}", short_id(&peer_id));
                }
            }
            PeerCommand::Disconnect { peer_id } => {
                self.disconnect(&peer_id);
            }
            PeerCommand::Send {
                peer_id,
                message,
                content_path,
            } => self.send(&peer_id, message, content_path),
            PeerCommand::State { peer_id, reply } => {
                let _ = reply.send(self.state(&peer_id));
            }
        }
    }

    /// Own fingerprint
    pub fn id(&self) -> &str {
        self.signaling.id()
    }

    /// Send a `signal-request` to `peer_id` unless a request or a transport
    /// already exists
    pub fn connect(&mut self, peer_id: &str) -> Result<()> {
        self.request(peer_id, now_timestamp())
    }

    fn request(&mut self, peer_id: &str, timestamp: String) -> Result<()> {
        if self.pending.contains_key(peer_id) || self.has_open_link(peer_id) {
            debug!("Already connecting to {}", short_id(peer_id));
            return Ok(());
        }

        self.pending.insert(
            peer_id.to_string(),
            PendingConnectRequest {
                receiver_id: peer_id.to_string(),
                timestamp: timestamp.clone(),
            },
        );
        self.signaling.send(Signal::SignalRequest(SignalRequest {
            receiver_id: peer_id.to_string(),
            timestamp,
        }))?;
        info!("Connecting with {}", short_id(peer_id));
        Ok(())
    }

    /// Destroy the transport to `peer_id` and forget any pending request.
    /// Returns true if a transport existed.
    pub fn disconnect(&mut self, peer_id: &str) -> bool {
        self.pending.remove(peer_id);
        let existed = self.teardown(peer_id);
        if existed {
            info!("Disconnected from {}", short_id(peer_id));
            self.pipeline.emit(PeerEvent::Disconnected {
                peer_id: peer_id.to_string(),
            });
        }
        existed
    }

    /// Queue `message` for `peer_id`. While a transport is negotiating the
    /// message waits on that link; without a transport it fails with
    /// `NotConnected`.
    pub fn send(&self, peer_id: &str, message: ChatMessage, content_path: Option<PathBuf>) {
        let outgoing = Outgoing {
            message,
            content_path,
        };
        let outgoing = match self.pipeline.link(peer_id) {
            Some(link) if link.state() != LinkState::Closed => match link.outbox.send(outgoing) {
                Ok(()) => return,
                Err(mpsc::error::SendError(outgoing)) => outgoing,
            },
            _ => outgoing,
        };

        let id = outgoing.message.id.clone();
        let task = self
            .pipeline
            .clone()
            .send(peer_id.to_string(), outgoing.message, outgoing.content_path);
        self.sending.add(task, Some(id));
    }

    /// Current state of `peer_id`
    pub fn state(&self, peer_id: &str) -> PeerState {
        if self.pending.contains_key(peer_id) {
            return PeerState::RequestSent;
        }
        match self.pipeline.link(peer_id) {
            Some(link) => match link.state() {
                LinkState::Negotiating => PeerState::Connecting(link.role),
                LinkState::Connected | LinkState::Ready => PeerState::Connected(link.role),
                LinkState::Closed => PeerState::Idle,
            },
            None => PeerState::Idle,
        }
    }

    /// Returns true if a transport to `peer_id` exists
    pub fn has(&self, peer_id: &str) -> bool {
        self.has_open_link(peer_id)
    }

    /// Returns true if the transport to `peer_id` is connected
    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.pipeline.link(peer_id).is_some_and(|l| l.is_open())
    }

    /// Outstanding own connect request to `peer_id`
    pub fn pending_request(&self, peer_id: &str) -> Option<&PendingConnectRequest> {
        self.pending.get(peer_id)
    }

    fn has_open_link(&self, peer_id: &str) -> bool {
        self.pipeline
            .link(peer_id)
            .is_some_and(|l| l.state() != LinkState::Closed)
    }

    /// React to one event from the relay
    pub async fn handle_signal_event(&mut self, event: SignalEvent) -> Result<()> {
        match event {
            SignalEvent::SignalRequest(request) => {
                self.on_signal_request(request.sender_id, &request.timestamp)
                    .await
            }
            SignalEvent::SignalAccept(accept) => {
                if self.pending.remove(&accept.sender_id).is_none() {
                    debug!("Ignoring accept from {} without a request", short_id(&accept.sender_id));
                    return Ok(());
                }
                info!("{} accepted, initiating", short_id(&accept.sender_id));
                self.add_peer(&accept.sender_id, PeerRole::Initiator)
            }
            SignalEvent::Signal(signal) => {
                let Some(link) = self.pipeline.link(&signal.sender_id) else {
                    warn!("Rejected signal from {}: no transport", short_id(&signal.sender_id));
                    return Ok(());
                };
                if let Err(e) = link.transport.signal(signal.data) {
                    self.fail(&signal.sender_id, &e);
                }
                Ok(())
            }
            SignalEvent::UnknownReceiver(unknown) => {
                if self.pending.remove(&unknown.receiver_id).is_some() {
                    info!("{} is offline", short_id(&unknown.receiver_id));
                }
                self.pipeline.emit(PeerEvent::UnknownReceiver {
                    receiver_id: unknown.receiver_id,
                    kind: unknown.kind,
                });
                Ok(())
            }
            SignalEvent::ChatRequest(chat) => {
                self.pipeline.emit(PeerEvent::ChatRequest {
                    sender_id: chat.sender_id,
                    sender_public_key: chat.sender_public_key,
                });
                Ok(())
            }
            SignalEvent::ChatAccept(chat) => {
                self.pipeline.emit(PeerEvent::ChatAccept {
                    sender_id: chat.sender_id,
                    sender_public_key: chat.sender_public_key,
                });
                Ok(())
            }
        }
    }

    async fn on_signal_request(&mut self, sender_id: String, timestamp: &str) -> Result<()> {
        if !self.pipeline.crypto.lock().await.knows(&sender_id) {
            warn!("Rejected signal request from unknown peer {}", short_id(&sender_id));
            self.pipeline.emit(PeerEvent::Rejected {
                peer_id: sender_id,
                reason: "no chat with this peer".to_string(),
            });
            return Ok(());
        }
        if self.has_open_link(&sender_id) {
            debug!("Ignoring signal request from {}: already connecting", short_id(&sender_id));
            return Ok(());
        }

        if let Some(own) = self.pending.get(&sender_id) {
            let (Some(theirs), Some(ours)) = (request_time(timestamp), request_time(&own.timestamp))
            else {
                warn!("Rejected signal request from {}: bad timestamp", short_id(&sender_id));
                return Ok(());
            };
            let remote_first = (theirs, sender_id.as_str()) < (ours, self.signaling.id());
            if !remote_first {
                debug!("Own request to {} was first, waiting for accept", short_id(&sender_id));
                return Ok(());
            }
            self.pending.remove(&sender_id);
            debug!("Request from {} was first, accepting", short_id(&sender_id));
        }

        self.add_peer(&sender_id, PeerRole::Receiver)?;
        self.signaling.send(Signal::SignalAccept(SignalAccept {
            receiver_id: sender_id,
        }))
    }

    fn add_peer(&mut self, peer_id: &str, role: PeerRole) -> Result<()> {
        self.next_link += 1;
        let generation = self.next_link;
        let events = TransportEvents::new(peer_id, generation, self.transport_tx.clone());
        let transport = self.factory.create(peer_id, role, events)?;

        let (state, state_rx) = watch::channel(LinkState::Negotiating);
        let (outbox, outgoing) = mpsc::unbounded_channel();
        tokio::spawn(forward_when_ready(
            self.pipeline.clone(),
            self.sending.clone(),
            peer_id.to_string(),
            state_rx,
            outgoing,
        ));

        let link = PeerLink {
            transport,
            role,
            generation,
            state: Arc::new(state),
            outbox,
        };
        let previous = locked(&self.pipeline.links).insert(peer_id.to_string(), link);
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(())
    }

    fn teardown(&mut self, peer_id: &str) -> bool {
        let link = locked(&self.pipeline.links).remove(peer_id);
        match link {
            Some(link) => {
                link.close();
                true
            }
            None => false,
        }
    }

    fn fail(&mut self, peer_id: &str, error: &dyn std::fmt::Display) {
        error!("Connection with {} failed: {error}", short_id(peer_id));
        self.teardown(peer_id);
        self.pipeline.emit(PeerEvent::Error {
            peer_id: peer_id.to_string(),
            error: error.to_string(),
        });
    }

    /// React to one event from a transport. Events from a transport that
    /// has since been replaced or removed are dropped.
    pub async fn handle_transport_event(&mut self, tag: LinkTag, event: TransportEvent) {
        let peer_id = tag.peer_id.as_str();
        let Some(link) = self
            .pipeline
            .link(peer_id)
            .filter(|l| l.generation == tag.link)
        else {
            debug!("Dropping {event:?} from {}: stale transport", short_id(peer_id));
            return;
        };

        match event {
            TransportEvent::Signal(data) => {
                let sent = self.signaling.send(Signal::Signal(SignalData {
                    receiver_id: peer_id.to_string(),
                    data,
                }));
                if let Err(e) = sent {
                    self.fail(peer_id, &e);
                }
            }
            TransportEvent::Connect => {
                if let Err(e) = self.on_connect(peer_id, &link).await {
                    self.fail(peer_id, &e);
                }
            }
            TransportEvent::Close => {
                self.teardown(peer_id);
                info!("{} disconnected", short_id(peer_id));
                self.pipeline.emit(PeerEvent::Disconnected {
                    peer_id: peer_id.to_string(),
                });
            }
            TransportEvent::Error(e) => self.fail(peer_id, &e),
            TransportEvent::Data(data) => {
                let task = self
                    .pipeline
                    .clone()
                    .receive_data(peer_id.to_string(), link, data);
                self.receiving.add(task, None);
            }
            TransportEvent::DataChannel { label, reader } => {
                let task = self
                    .pipeline
                    .clone()
                    .receive_file(peer_id.to_string(), label, reader);
                self.receiving.add(task, None);
            }
        }
    }

    async fn on_connect(&mut self, peer_id: &str, link: &PeerLink) -> Result<()> {
        let key = self.pipeline.crypto.lock().await.init_session(peer_id)?;
        link.transport
            .send(PeerMessage::Key(key).to_json()?.into_bytes())
            .await?;
        link.set(LinkState::Connected);

        info!("Connected with {} as {:?}", short_id(peer_id), link.role);
        self.pipeline.emit(PeerEvent::Connected {
            peer_id: peer_id.to_string(),
            role: link.role,
        });
        Ok(())
    }

    fn shutdown(&mut self) {
        let links: Vec<PeerLink> = locked(&self.pipeline.links).drain().map(|(_, l)| l).collect();
        for link in links {
            link.close();
        }
        self.pending.clear();
        debug!("Peer manager stopped");
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("id", &self.signaling.id())
            .field("pending", &self.pending.len())
            .field("links", &locked(&self.pipeline.links).len())
            .finish()
    }
}
