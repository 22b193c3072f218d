//! Master side of the control plane
//!
//! Accepts node sessions, runs the handshake, keeps the attached-node
//! registry and fans `EventTransmission` packets out to every other node.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::cipher::SECRET_LEN;
use super::codec::Packet;
use super::keys::KeyStore;
use super::packets::{
    decode_payload, ChallengeFinish, ChallengeResult, ChallengeStart, EventTransmission, Login,
    NodeAttached, NodeDetached, PacketId, Ping, Pong,
};
use super::session::{self, PacketReceiver, PacketSender, Role, SessionState};
use super::{AuthError, ProtocolError};
use crate::events::{now_millis, Event, EventBuses, EVENT_TRANSMISSION, EVENT_TRANSMISSION_BUS};
use crate::nodes::{NodeInfo, NodeRegistry};

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: SocketAddr,
    /// How long an issued challenge stays redeemable
    pub challenge_ttl: Duration,
    /// Per-packet deadline before the session is fully ready
    pub handshake_timeout: Duration,
    /// Silence after which a ready session is dropped
    pub idle_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 2000)),
            challenge_ttl: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

struct PendingChallenge {
    node: NodeInfo,
    session_id: u64,
    issued_at: Instant,
}

struct SessionHandle {
    session_id: u64,
    sender: PacketSender,
}

/// Handshake progress of one accepted connection
struct MasterSession {
    id: u64,
    peer: String,
    state: SessionState,
    key: Option<String>,
}

pub struct Master {
    config: MasterConfig,
    keys: Arc<KeyStore>,
    nodes: NodeRegistry,
    buses: EventBuses,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    pending: RwLock<HashMap<String, PendingChallenge>>,
    next_session: AtomicU64,
}

impl Master {
    pub fn new(config: MasterConfig, keys: Arc<KeyStore>, buses: EventBuses) -> Self {
        Self {
            config,
            keys,
            nodes: NodeRegistry::new(),
            buses,
            sessions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub async fn pending_challenges(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Accept sessions until `shutdown` flips to true, then close them all
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProtocolError> {
        info!("Master listening on {}", listener.local_addr()?);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed for {}: {}", addr, e);
                    }
                    let master = Arc::clone(&self);
                    tasks.spawn(async move {
                        master.serve_connection(stream, addr.to_string()).await;
                    });
                }
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Session task panicked: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Master shutting down, closing {} session(s)", tasks.len());
        let senders: Vec<PacketSender> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle.sender)
            .collect();
        for sender in senders {
            sender.close().await;
        }
        tasks.shutdown().await;
        Ok(())
    }

    /// Drive one node session to completion
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut rx, tx) = session::split(stream);
        let mut session = MasterSession {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            peer,
            state: SessionState::Initial,
            key: None,
        };
        debug!("Session {} opened from {}", session.id, session.peer);

        match self.session_loop(&mut session, &mut rx, &tx).await {
            Err(ProtocolError::Closed) => debug!("Session {} closed by peer", session.id),
            Err(e) => warn!("Session {} from {} ended: {}", session.id, session.peer, e),
            Ok(()) => {}
        }

        session.state = SessionState::Closed;
        tx.close().await;
        self.close_session(&session).await;
    }

    async fn session_loop(
        &self,
        session: &mut MasterSession,
        rx: &mut PacketReceiver,
        tx: &PacketSender,
    ) -> Result<(), ProtocolError> {
        loop {
            let deadline = if session.state == SessionState::FullyReady {
                self.config.idle_timeout
            } else {
                self.config.handshake_timeout
            };
            let packet = timeout(deadline, rx.recv())
                .await
                .map_err(|_| ProtocolError::Timeout)??;

            let id = PacketId::try_from(packet.id)?;
            if !session.state.admits(Role::Master, id) {
                return Err(ProtocolError::UnexpectedPacket {
                    id,
                    state: session.state,
                });
            }

            self.dispatch(session, id, &packet, rx, tx).await?;
        }
    }

    async fn dispatch(
        &self,
        session: &mut MasterSession,
        id: PacketId,
        packet: &Packet,
        rx: &mut PacketReceiver,
        tx: &PacketSender,
    ) -> Result<(), ProtocolError> {
        match id {
            PacketId::SharedSecret => {
                let secret = self.keys.decrypt(&packet.data).map_err(AuthError::from)?;
                if secret.len() != SECRET_LEN {
                    return Err(ProtocolError::Cipher(format!(
                        "shared secret of {} bytes",
                        secret.len()
                    )));
                }
                rx.enable_cipher(&secret)?;
                tx.enable_cipher(&secret).await?;
                session.state = SessionState::AesReady;
                debug!("Session {} encrypted", session.id);
            }
            PacketId::Login => {
                let info: Login = decode_payload(packet)?;
                if !self.keys.has_peer(&info.key) {
                    return Err(AuthError::MissingPublicKey(info.key).into());
                }
                debug!("Session {} login as '{}'", session.id, info.key);
                let challenge = self.issue_challenge(session.id, info).await;
                tx.send_payload(PacketId::ChallengeStart, &ChallengeStart { challenge })
                    .await?;
            }
            PacketId::ChallengeResult => {
                let result: ChallengeResult = decode_payload(packet)?;
                let node = self.verify_challenge_result(session.id, &result).await?;
                let signature = self
                    .keys
                    .sign(result.mutual_challenge.as_bytes())
                    .map_err(AuthError::from)?;

                let key = node.key.clone();
                self.attach(session.id, node, tx.clone()).await;
                session.key = Some(key.clone());
                session.state = SessionState::FullyReady;

                let finish = ChallengeFinish {
                    challenge: result.mutual_challenge,
                    result: signature,
                    nodes: self.nodes.snapshot().await,
                };
                tx.send_payload(PacketId::ChallengeFinish, &finish).await?;
                info!("Node '{}' attached from {}", key, session.peer);
            }
            PacketId::EventTransmission => {
                let transmission: EventTransmission = decode_payload(packet)?;
                self.relay(session, packet, transmission).await;
            }
            PacketId::Ping => {
                let ping: Ping = decode_payload(packet)?;
                tx.send_payload(PacketId::Pong, &Pong { nonce: ping.nonce }).await?;
            }
            PacketId::Pong => {}
            other => {
                debug!("Session {} ignoring packet {:?}", session.id, other);
            }
        }
        Ok(())
    }

    /// Record a fresh challenge for the node logging in on `session_id`
    pub async fn issue_challenge(&self, session_id: u64, node: NodeInfo) -> String {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let challenge = format!("{}-{}-{}", node.key, now_millis(), nonce);

        self.pending.write().await.insert(
            challenge.clone(),
            PendingChallenge {
                node,
                session_id,
                issued_at: Instant::now(),
            },
        );
        challenge
    }

    /// Redeem a pending challenge. The entry is consumed whether or not the
    /// signature checks out.
    pub async fn verify_challenge_result(
        &self,
        session_id: u64,
        result: &ChallengeResult,
    ) -> Result<NodeInfo, AuthError> {
        let pending = self
            .pending
            .write()
            .await
            .remove(&result.challenge)
            .ok_or(AuthError::UnknownChallenge)?;

        if pending.session_id != session_id
            || pending.issued_at.elapsed() > self.config.challenge_ttl
        {
            return Err(AuthError::UnknownChallenge);
        }
        if pending.node.key != result.key {
            return Err(AuthError::KeyMismatch {
                expected: pending.node.key,
                claimed: result.key.clone(),
            });
        }

        self.keys
            .verify_with(&result.key, result.challenge.as_bytes(), &result.result)?;
        Ok(pending.node)
    }

    async fn attach(&self, session_id: u64, node: NodeInfo, sender: PacketSender) {
        let key = node.key.clone();
        self.sessions
            .write()
            .await
            .insert(key.clone(), SessionHandle { session_id, sender });
        self.nodes.attach(node.clone()).await;
        self.broadcast(PacketId::NodeAttached, &NodeAttached { node }, Some(&key))
            .await;
    }

    /// Forward an event to every other node and publish it locally
    async fn relay(
        &self,
        session: &MasterSession,
        packet: &Packet,
        transmission: EventTransmission,
    ) {
        let origin = session.key.as_deref();
        debug!(
            "Relaying event type {} on '{}' from {:?}",
            transmission.event.event_type, transmission.event_bus_name, origin
        );

        for (key, sender) in self.senders_except(origin).await {
            if let Err(e) = sender.send(packet).await {
                debug!("Relay to '{}' failed: {}", key, e);
            }
        }

        match Event::new(EVENT_TRANSMISSION, origin.unwrap_or_default(), &transmission) {
            Ok(event) => {
                self.buses.bus(EVENT_TRANSMISSION_BUS).publish(event).await;
            }
            Err(e) => warn!("Failed to wrap relayed event: {}", e),
        }
    }

    async fn broadcast<T: Serialize>(&self, id: PacketId, payload: &T, except: Option<&str>) {
        let packet = match super::packets::encode_payload(id, payload) {
            Ok(packet) => packet,
            Err(e) => {
                error!("Failed to encode {:?}: {}", id, e);
                return;
            }
        };
        for (key, sender) in self.senders_except(except).await {
            if let Err(e) = sender.send(&packet).await {
                debug!("Broadcast of {:?} to '{}' failed: {}", id, key, e);
            }
        }
    }

    async fn senders_except(&self, except: Option<&str>) -> Vec<(String, PacketSender)> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(key, _)| Some(key.as_str()) != except)
            .map(|(key, handle)| (key.clone(), handle.sender.clone()))
            .collect()
    }

    async fn close_session(&self, session: &MasterSession) {
        self.pending
            .write()
            .await
            .retain(|_, p| p.session_id != session.id);

        let Some(key) = &session.key else {
            return;
        };

        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(key) {
                Some(handle) if handle.session_id == session.id => sessions.remove(key),
                _ => None,
            }
        };

        // A newer session for the same key keeps the node attached
        if removed.is_some() {
            self.nodes.detach(key).await;
            self.broadcast(PacketId::NodeDetached, &NodeDetached { key: key.clone() }, None)
                .await;
            info!("Node '{}' detached", key);
        }
    }
}
