//! Relay signaling.
//!
//! Clients send `{"type": <kind>, "senderId": <id>, ...payload}` frames to a
//! relay; the relay delivers `{"event": <kind>, "data": {...}}` frames to the
//! addressed client, or answers the sender with `unknown-receiver`. Over TCP
//! each frame is a 4-byte little-endian length followed by JSON, and the first
//! client frame is a signed [`AuthRequest`].

use crate::crypto::{short_id, AuthRequest};
use crate::utils::{NetworkError, ProtocolError, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Largest signaling frame accepted (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Connect request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    /// Addressed peer
    pub receiver_id: String,
    /// RFC 3339 time the request was issued
    pub timestamp: String,
}

/// Connect accept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalAccept {
    /// Addressed peer
    pub receiver_id: String,
}

/// Opaque transport negotiation data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalData {
    /// Addressed peer
    pub receiver_id: String,
    /// Transport specific payload
    pub data: serde_json::Value,
}

/// Chat bootstrap carrying the sender's long-term key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBootstrap {
    /// Addressed peer
    pub receiver_id: String,
    /// Hex long-term public key of the sender
    pub sender_public_key: String,
}

/// Envelope a client asks the relay to deliver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    /// Ask to open a transport
    SignalRequest(SignalRequest),
    /// Agree to open a transport
    SignalAccept(SignalAccept),
    /// Transport negotiation
    Signal(SignalData),
    /// Ask to start a chat
    ChatRequest(ChatBootstrap),
    /// Agree to start a chat
    ChatAccept(ChatBootstrap),
}

impl Signal {
    /// Wire name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignalRequest(_) => "signal-request",
            Self::SignalAccept(_) => "signal-accept",
            Self::Signal(_) => "signal",
            Self::ChatRequest(_) => "chat-request",
            Self::ChatAccept(_) => "chat-accept",
        }
    }

    /// Addressed peer
    pub fn receiver_id(&self) -> &str {
        match self {
            Self::SignalRequest(s) => &s.receiver_id,
            Self::SignalAccept(s) => &s.receiver_id,
            Self::Signal(s) => &s.receiver_id,
            Self::ChatRequest(s) | Self::ChatAccept(s) => &s.receiver_id,
        }
    }
}

/// [`Signal`] stamped with its sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundSignal {
    /// Fingerprint of the sending client
    #[serde(rename = "senderId")]
    pub sender_id: String,
    /// Payload
    #[serde(flatten)]
    pub signal: Signal,
}

impl OutboundSignal {
    /// Convert into the event the addressed client receives
    pub fn into_delivery(self) -> (String, SignalEvent) {
        let sender_id = self.sender_id;
        match self.signal {
            Signal::SignalRequest(s) => (
                s.receiver_id,
                SignalEvent::SignalRequest(IncomingRequest {
                    sender_id,
                    timestamp: s.timestamp,
                }),
            ),
            Signal::SignalAccept(s) => (
                s.receiver_id,
                SignalEvent::SignalAccept(FromPeer { sender_id }),
            ),
            Signal::Signal(s) => (
                s.receiver_id,
                SignalEvent::Signal(IncomingSignal {
                    sender_id,
                    data: s.data,
                }),
            ),
            Signal::ChatRequest(s) => (
                s.receiver_id,
                SignalEvent::ChatRequest(IncomingChat {
                    sender_id,
                    sender_public_key: s.sender_public_key,
                }),
            ),
            Signal::ChatAccept(s) => (
                s.receiver_id,
                SignalEvent::ChatAccept(IncomingChat {
                    sender_id,
                    sender_public_key: s.sender_public_key,
                }),
            ),
        }
    }
}

/// Delivered connect request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingRequest {
    /// Requesting peer
    pub sender_id: String,
    /// RFC 3339 time the peer issued the request
    pub timestamp: String,
}

/// Delivered event that only names its sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromPeer {
    /// Sending peer
    pub sender_id: String,
}

/// Delivered negotiation data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingSignal {
    /// Sending peer
    pub sender_id: String,
    /// Transport specific payload
    pub data: serde_json::Value,
}

/// Delivered chat bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingChat {
    /// Sending peer
    pub sender_id: String,
    /// Hex long-term public key of the sender
    pub sender_public_key: String,
}

/// The relay could not deliver a signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnknownReceiver {
    /// Peer that is not connected to the relay
    pub receiver_id: String,
    /// Kind of the undelivered signal
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Event delivered by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SignalEvent {
    /// A peer asks to open a transport
    SignalRequest(IncomingRequest),
    /// A peer agreed to open a transport
    SignalAccept(FromPeer),
    /// Transport negotiation from a peer
    Signal(IncomingSignal),
    /// A signal could not be delivered
    UnknownReceiver(UnknownReceiver),
    /// A peer asks to start a chat
    ChatRequest(IncomingChat),
    /// A peer agreed to start a chat
    ChatAccept(IncomingChat),
}

/// Handle for sending signals through a relay connection
#[derive(Debug, Clone)]
pub struct SignalingClient {
    id: String,
    outbound: mpsc::UnboundedSender<OutboundSignal>,
}

impl SignalingClient {
    /// Client that hands every signal to `outbound`
    pub fn new(id: impl Into<String>, outbound: mpsc::UnboundedSender<OutboundSignal>) -> Self {
        Self {
            id: id.into(),
            outbound,
        }
    }

    /// Client plus the receiving end of its outbound signals
    pub fn channel(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<OutboundSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(id, tx), rx)
    }

    /// Connect to a TCP relay and authenticate
    ///
    /// # Arguments
    ///
    /// * `address` - `host:port` of the relay
    /// * `auth` - Signed auth request; the client id is its fingerprint
    ///
    /// # Returns
    ///
    /// The client and the stream of events the relay delivers. The stream
    /// ends when the relay connection closes.
    pub async fn connect(
        address: &str,
        auth: AuthRequest,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalEvent>)> {
        let id = auth.verify()?;
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                peer: address.to_string(),
                reason: e.to_string(),
            })?;
        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &serde_json::to_vec(&auth)?).await?;
        info!("Connected to relay {address} as {}", short_id(&id));

        let (client, mut outbound) = Self::channel(id);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(signal) = outbound.recv().await {
                let sent = match serde_json::to_vec(&signal) {
                    Ok(frame) => write_frame(&mut writer, &frame).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    warn!("Failed to send {} to relay: {e}", signal.signal.kind());
                    break;
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => match serde_json::from_slice::<SignalEvent>(&frame) {
                        Ok(event) => {
                            if events_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping malformed relay frame: {e}"),
                    },
                    Ok(None) => {
                        info!("Relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Relay read failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok((client, events_rx))
    }

    /// Own fingerprint, stamped on every outgoing signal
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a signal for the relay
    pub fn send(&self, signal: Signal) -> Result<()> {
        debug!("-> {} to {}", signal.kind(), short_id(signal.receiver_id()));
        self.outbound
            .send(OutboundSignal {
                sender_id: self.id.clone(),
                signal,
            })
            .map_err(|_| {
                NetworkError::ChannelClosed {
                    name: "relay".to_string(),
                }
                .into()
            })
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        }
        .into());
    }
    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on a clean end of stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        }
        .into());
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_wire_shape() {
        let signal = OutboundSignal {
            sender_id: "alice".into(),
            signal: Signal::SignalRequest(SignalRequest {
                receiver_id: "bob".into(),
                timestamp: "2024-01-01T00:00:00.100Z".into(),
            }),
        };
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "signal-request",
                "senderId": "alice",
                "receiverId": "bob",
                "timestamp": "2024-01-01T00:00:00.100Z"
            })
        );
        assert_eq!(serde_json::from_value::<OutboundSignal>(value).unwrap(), signal);
    }

    #[test]
    fn test_inbound_wire_shape() {
        let event: SignalEvent = serde_json::from_value(json!({
            "event": "unknown-receiver",
            "data": {"receiverId": "bob", "type": "signal-request"}
        }))
        .unwrap();
        assert_eq!(
            event,
            SignalEvent::UnknownReceiver(UnknownReceiver {
                receiver_id: "bob".into(),
                kind: Some("signal-request".into()),
            })
        );

        let event: SignalEvent = serde_json::from_value(json!({
            "event": "chat-accept",
            "data": {"senderId": "bob", "senderPublicKey": "ab"}
        }))
        .unwrap();
        assert!(matches!(event, SignalEvent::ChatAccept(ref c) if c.sender_id == "bob"));
    }

    #[test]
    fn test_delivery_swaps_addressing() {
        let signal = OutboundSignal {
            sender_id: "alice".into(),
            signal: Signal::Signal(SignalData {
                receiver_id: "bob".into(),
                data: json!({"type": "offer"}),
            }),
        };
        let (receiver, event) = signal.into_delivery();
        assert_eq!(receiver, "bob");
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({"event": "signal", "data": {"senderId": "alice", "data": {"type": "offer"}}})
        );
    }

    #[tokio::test]
    async fn test_client_stamps_sender() {
        let (client, mut outbound) = SignalingClient::channel("alice");
        client
            .send(Signal::SignalAccept(SignalAccept {
                receiver_id: "bob".into(),
            }))
            .unwrap();

        let signal = outbound.recv().await.unwrap();
        assert_eq!(signal.sender_id, "alice");
        assert_eq!(signal.signal.kind(), "signal-accept");

        drop(outbound);
        assert!(client
            .send(Signal::SignalAccept(SignalAccept {
                receiver_id: "bob".into(),
            }))
            .is_err());
    }

    #[tokio::test]
    async fn test_frames_on_the_wire() {
        let payload = br#"{"event":"signal-accept","data":{"senderId":"x"}}"#;
        let len = (payload.len() as u32).to_le_bytes();

        let mut writer = tokio_test::io::Builder::new()
            .write(&len)
            .write(payload)
            .build();
        write_frame(&mut writer, payload).await.unwrap();

        let mut reader = tokio_test::io::Builder::new().read(&len).read(payload).build();
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), payload.to_vec());
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        let mut reader = tokio_test::io::Builder::new().read(&len).build();
        assert!(read_frame(&mut reader).await.is_err());
    }
}
