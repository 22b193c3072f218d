//! Session state machine and split connection halves

use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex, RwLock};

use super::cipher::{CipherReader, CipherWriter};
use super::codec::{self, Packet};
use super::packets::{self, PacketId};
use super::ProtocolError;

/// Lifecycle of one control-plane session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Plaintext; only the shared secret may arrive
    Initial,
    /// Cipher installed; handshake packets only
    AesReady,
    /// Mutually authenticated
    FullyReady,
    Closed,
}

/// Which end of the session is checking admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Node,
}

impl SessionState {
    /// Whether a packet with `id` may be dispatched in this state
    pub fn admits(self, role: Role, id: PacketId) -> bool {
        use PacketId::*;
        match (self, role) {
            (SessionState::Initial, Role::Master) => id == SharedSecret,
            (SessionState::Initial, Role::Node) => false,
            (SessionState::AesReady, Role::Master) => matches!(id, Login | ChallengeResult),
            (SessionState::AesReady, Role::Node) => matches!(id, ChallengeStart | ChallengeFinish),
            (SessionState::FullyReady, Role::Master) => {
                !matches!(
                    id,
                    SharedSecret | Login | ChallengeResult | ChallengeStart | ChallengeFinish
                )
            }
            (SessionState::FullyReady, Role::Node) => {
                !matches!(
                    id,
                    SharedSecret | Login | ChallengeResult | ChallengeStart | ChallengeFinish
                )
            }
            (SessionState::Closed, _) => false,
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of a session. Owned by the session task.
pub struct PacketReceiver {
    inner: CipherReader<BoxedReader>,
}

impl PacketReceiver {
    /// Next packet. A peer that closed cleanly between frames yields
    /// `ProtocolError::Closed`.
    pub async fn recv(&mut self) -> Result<Packet, ProtocolError> {
        match codec::read_packet(&mut self.inner).await {
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(ProtocolError::Closed)
            }
            other => other,
        }
    }

    pub fn enable_cipher(&mut self, secret: &[u8]) -> Result<(), ProtocolError> {
        self.inner.enable(secret)
    }
}

/// Write half of a session. Cloneable; frames are written whole under a lock
/// so concurrent senders never interleave.
#[derive(Clone)]
pub struct PacketSender {
    inner: Arc<Mutex<CipherWriter<BoxedWriter>>>,
}

impl PacketSender {
    pub async fn send(&self, packet: &Packet) -> Result<(), ProtocolError> {
        let frame = codec::encode_frame(packet)?;
        self.inner.lock().await.write_all(frame).await?;
        Ok(())
    }

    pub async fn send_payload<T: Serialize>(
        &self,
        id: PacketId,
        payload: &T,
    ) -> Result<(), ProtocolError> {
        self.send(&packets::encode_payload(id, payload)?).await
    }

    pub async fn enable_cipher(&self, secret: &[u8]) -> Result<(), ProtocolError> {
        self.inner.lock().await.enable(secret)
    }

    pub async fn close(&self) {
        let _ = self.inner.lock().await.shutdown().await;
    }
}

/// Split a byte stream into its packet halves
pub fn split<S>(stream: S) -> (PacketReceiver, PacketSender)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let reader: BoxedReader = Box::new(read);
    let writer: BoxedWriter = Box::new(write);
    (
        PacketReceiver {
            inner: CipherReader::new(reader),
        },
        PacketSender {
            inner: Arc::new(Mutex::new(CipherWriter::new(writer))),
        },
    )
}

/// The node's handle on its current master session, shared with the
/// replication forwarder. Empty while disconnected.
#[derive(Clone)]
pub struct MasterLink {
    sender: Arc<RwLock<Option<PacketSender>>>,
    connected: watch::Sender<bool>,
}

impl Default for MasterLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterLink {
    pub fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            sender: Arc::new(RwLock::new(None)),
            connected,
        }
    }

    pub async fn set(&self, sender: PacketSender) {
        *self.sender.write().await = Some(sender);
        self.connected.send_replace(true);
    }

    pub async fn clear(&self) {
        *self.sender.write().await = None;
        self.connected.send_replace(false);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until a fully authenticated session is installed
    pub async fn wait_connected(&self) {
        let mut rx = self.connected.subscribe();
        // Only fails if the sender is dropped, which `self` prevents
        let _ = rx.wait_for(|connected| *connected).await;
    }

    pub async fn send(&self, packet: &Packet) -> Result<(), ProtocolError> {
        let sender = self.sender.read().await.clone();
        match sender {
            Some(sender) => sender.send(packet).await,
            None => Err(ProtocolError::Closed),
        }
    }
}
