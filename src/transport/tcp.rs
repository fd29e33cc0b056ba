//! TCP peer transport.
//!
//! The initiator listens on an ephemeral port and offers the address over
//! signaling; the receiver dials it. A single stream carries the main channel
//! and every data channel as tagged frames:
//! `[kind u8][channel u32 LE][len u32 LE][payload]`.

use super::{
    DataChannelWriter, PeerRole, PeerTransport, PeerTransportFactory, TransportEvent,
    TransportEvents, MAX_PAYLOAD_SIZE,
};
use crate::utils::{NetworkError, ProtocolError, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const FRAME_MESSAGE: u8 = 0;
const FRAME_OPEN: u8 = 1;
const FRAME_DATA: u8 = 2;
const FRAME_END: u8 = 3;

/// Buffer of a data channel pipe, also the largest data frame
const CHANNEL_BUFFER: usize = 64 * 1024;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Negotiation {
    Offer { address: String },
}

#[derive(Debug)]
struct Frame {
    kind: u8,
    channel: u32,
    payload: Vec<u8>,
}

impl Frame {
    async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut header = [0u8; 9];
        header[0] = self.kind;
        header[1..5].copy_from_slice(&self.channel.to_le_bytes());
        header[5..9].copy_from_slice(&(self.payload.len() as u32).to_le_bytes());
        writer.write_all(&header).await?;
        writer.write_all(&self.payload).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let mut header = [0u8; 9];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let channel = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        let len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Some(Self {
            kind: header[0],
            channel,
            payload,
        }))
    }
}

/// Factory producing [`TcpTransport`]s
#[derive(Debug, Clone)]
pub struct TcpTransportFactory {
    host: IpAddr,
}

impl TcpTransportFactory {
    /// Initiators listen on `host`, which peers must be able to reach
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }
}

impl PeerTransportFactory for TcpTransportFactory {
    fn create(
        &self,
        peer_id: &str,
        role: PeerRole,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = TcpTransport {
            role,
            shared: Arc::new(Shared {
                events,
                writer: Mutex::new(None),
                next_channel: AtomicU32::new(1),
                tasks: Mutex::new(Vec::new()),
                destroyed: AtomicBool::new(false),
            }),
        };

        if role == PeerRole::Initiator {
            let listener = std::net::TcpListener::bind((self.host, 0))?;
            listener.set_nonblocking(true)?;
            let address = listener.local_addr()?.to_string();
            let listener = TcpListener::from_std(listener)?;

            let shared = Arc::clone(&transport.shared);
            let accept = tokio::spawn(async move {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!("Accepted peer connection from {remote}");
                        Shared::attach(&shared, stream);
                    }
                    Err(e) => shared.fail(e.to_string()),
                }
            });
            transport.shared.track(accept);

            debug!("Listening for {peer_id} on {address}");
            transport
                .shared
                .events
                .emit(TransportEvent::Signal(serde_json::to_value(
                    Negotiation::Offer { address },
                )?))?;
        }

        Ok(Arc::new(transport))
    }
}

struct Shared {
    events: TransportEvents,
    writer: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    next_channel: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Shared {
    fn track(&self, task: JoinHandle<()>) {
        if self.destroyed.load(Ordering::Acquire) {
            task.abort();
        } else {
            locked(&self.tasks).push(task);
        }
    }

    fn fail(&self, error: String) {
        if !self.destroyed.load(Ordering::Acquire) {
            let _ = self.events.emit(TransportEvent::Error(error));
        }
    }

    fn writer(&self) -> Result<mpsc::UnboundedSender<Frame>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(self.not_connected());
        }
        locked(&self.writer)
            .clone()
            .ok_or_else(|| self.not_connected())
    }

    fn not_connected(&self) -> crate::MessengerError {
        NetworkError::NotConnected {
            peer_id: self.events.peer_id().to_string(),
        }
        .into()
    }

    /// Take over a connected stream and report `Connect`
    fn attach(shared: &Arc<Self>, stream: TcpStream) {
        if shared.destroyed.load(Ordering::Acquire) {
            return;
        }
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        *locked(&shared.writer) = Some(tx);

        let write_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = frame.write(&mut writer).await {
                    warn!("Peer write failed: {e}");
                    break;
                }
            }
        });
        shared.track(write_task);

        if shared.events.emit(TransportEvent::Connect).is_err() {
            return;
        }

        let reader_shared = Arc::clone(shared);
        let read_task = tokio::spawn(async move {
            reader_shared.read_loop(&mut reader).await;
        });
        shared.track(read_task);
    }

    async fn read_loop<R: AsyncRead + Unpin>(&self, reader: &mut R) {
        let mut channels: HashMap<u32, DuplexStream> = HashMap::new();
        loop {
            let frame = match Frame::read(reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if !self.destroyed.load(Ordering::Acquire) {
                        let _ = self.events.emit(TransportEvent::Close);
                    }
                    return;
                }
                Err(e) => {
                    self.fail(e.to_string());
                    return;
                }
            };

            let delivered = match frame.kind {
                FRAME_MESSAGE => self.events.emit(TransportEvent::Data(frame.payload)),
                FRAME_OPEN => {
                    let (writer, reader) = tokio::io::duplex(CHANNEL_BUFFER);
                    channels.insert(frame.channel, writer);
                    self.events.emit(TransportEvent::DataChannel {
                        label: String::from_utf8_lossy(&frame.payload).into_owned(),
                        reader: Box::new(reader),
                    })
                }
                FRAME_DATA => {
                    if let Some(writer) = channels.get_mut(&frame.channel) {
                        if writer.write_all(&frame.payload).await.is_err() {
                            debug!("Data channel {} dropped by reader", frame.channel);
                            channels.remove(&frame.channel);
                        }
                    }
                    Ok(())
                }
                FRAME_END => {
                    if let Some(mut writer) = channels.remove(&frame.channel) {
                        let _ = writer.shutdown().await;
                    }
                    Ok(())
                }
                other => {
                    warn!("Ignoring unknown frame kind {other}");
                    Ok(())
                }
            };
            if delivered.is_err() {
                return;
            }
        }
    }
}

/// One end of a TCP connection to a peer
pub struct TcpTransport {
    role: PeerRole,
    shared: Arc<Shared>,
}

#[async_trait]
impl PeerTransport for TcpTransport {
    fn signal(&self, data: serde_json::Value) -> Result<()> {
        let negotiation: Negotiation =
            serde_json::from_value(data).map_err(|e| NetworkError::Transport {
                reason: format!("bad negotiation payload: {e}"),
            })?;
        let Negotiation::Offer { address } = negotiation;

        if self.role != PeerRole::Receiver {
            warn!("Ignoring offer as initiator");
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let dial = tokio::spawn(async move {
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    info!("Connected to peer at {address}");
                    Shared::attach(&shared, stream);
                }
                Err(e) => shared.fail(format!("dial {address}: {e}")),
            }
        });
        self.shared.track(dial);
        Ok(())
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.shared
            .writer()?
            .send(Frame {
                kind: FRAME_MESSAGE,
                channel: 0,
                payload: data,
            })
            .map_err(|_| self.shared.not_connected())
    }

    async fn create_data_channel(&self, label: &str) -> Result<DataChannelWriter> {
        let tx = self.shared.writer()?;
        let channel = self.shared.next_channel.fetch_add(1, Ordering::Relaxed);
        tx.send(Frame {
            kind: FRAME_OPEN,
            channel,
            payload: label.as_bytes().to_vec(),
        })
        .map_err(|_| self.shared.not_connected())?;

        let (local, mut pump) = tokio::io::duplex(CHANNEL_BUFFER);
        let forward = tokio::spawn(async move {
            let mut buf = vec![0u8; CHANNEL_BUFFER];
            loop {
                let payload = match pump.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf[..n].to_vec(),
                };
                let frame = Frame {
                    kind: FRAME_DATA,
                    channel,
                    payload,
                };
                if tx.send(frame).is_err() {
                    return;
                }
            }
            let _ = tx.send(Frame {
                kind: FRAME_END,
                channel,
                payload: Vec::new(),
            });
        });
        self.shared.track(forward);

        Ok(Box::new(local))
    }

    fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        locked(&self.shared.writer).take();
        for task in locked(&self.shared.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LinkTag;
    use std::net::Ipv4Addr;

    type Inbox = mpsc::UnboundedReceiver<(LinkTag, TransportEvent)>;

    fn sink(peer_id: &str) -> (TransportEvents, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportEvents::new(peer_id, 0, tx), rx)
    }

    async fn linked() -> (Arc<dyn PeerTransport>, Inbox, Arc<dyn PeerTransport>, Inbox) {
        let factory = TcpTransportFactory::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let (alice_events, mut alice_rx) = sink("bob");
        let (bob_events, mut bob_rx) = sink("alice");

        let alice = factory.create("bob", PeerRole::Initiator, alice_events).unwrap();
        let bob = factory.create("alice", PeerRole::Receiver, bob_events).unwrap();

        let Some((_, TransportEvent::Signal(offer))) = alice_rx.recv().await else {
            panic!("expected offer");
        };
        bob.signal(offer).unwrap();

        assert!(matches!(bob_rx.recv().await, Some((_, TransportEvent::Connect))));
        assert!(matches!(alice_rx.recv().await, Some((_, TransportEvent::Connect))));
        (alice, alice_rx, bob, bob_rx)
    }

    #[tokio::test]
    async fn test_frame_layout() {
        let frame = Frame {
            kind: FRAME_DATA,
            channel: 7,
            payload: b"abc".to_vec(),
        };
        let mut out = Vec::new();
        frame.write(&mut out).await.unwrap();
        assert_eq!(out, [2, 7, 0, 0, 0, 3, 0, 0, 0, b'a', b'b', b'c']);

        let read = Frame::read(&mut &out[..]).await.unwrap().unwrap();
        assert_eq!((read.kind, read.channel, read.payload), (2, 7, b"abc".to_vec()));
    }

    #[tokio::test]
    async fn test_messages_both_ways() {
        let (alice, mut alice_rx, bob, mut bob_rx) = linked().await;

        alice.send(b"ping".to_vec()).await.unwrap();
        assert!(matches!(bob_rx.recv().await, Some((_, TransportEvent::Data(d))) if d == b"ping"));

        bob.send(b"pong".to_vec()).await.unwrap();
        assert!(matches!(alice_rx.recv().await, Some((_, TransportEvent::Data(d))) if d == b"pong"));
    }

    #[tokio::test]
    async fn test_data_channel() {
        let (alice, _alice_rx, _bob, mut bob_rx) = linked().await;
        let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let mut writer = alice.create_data_channel("{\"type\":\"message\"}").await.unwrap();
        let sender = {
            let body = body.clone();
            tokio::spawn(async move {
                writer.write_all(&body).await.unwrap();
                writer.shutdown().await.unwrap();
            })
        };

        let Some((_, TransportEvent::DataChannel { label, mut reader })) = bob_rx.recv().await
        else {
            panic!("expected data channel");
        };
        assert_eq!(label, "{\"type\":\"message\"}");

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        sender.await.unwrap();
        assert_eq!(received, body);
    }

    #[tokio::test]
    async fn test_destroy_closes_remote() {
        let (alice, _alice_rx, _bob, mut bob_rx) = linked().await;
        alice.destroy();

        assert!(matches!(bob_rx.recv().await, Some((_, TransportEvent::Close))));
        assert!(alice.send(b"late".to_vec()).await.is_err());
    }
}
