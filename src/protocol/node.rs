//! Node side of the control plane
//!
//! Dials the master, performs the handshake, then mirrors the master's view
//! of attached nodes and hands inbound events to the local buses. The
//! authenticated sender is published through [`MasterLink`] so the
//! replication forwarder can reach the master.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::cipher::SECRET_LEN;
use super::codec::Packet;
use super::keys::{KeyError, KeyStore, MASTER_KEY_NAME};
use super::packets::{
    decode_payload, ChallengeFinish, ChallengeResult, ChallengeStart, EventTransmission,
    NodeAttached, NodeDetached, PacketId, Ping, Pong,
};
use super::session::{self, MasterLink, PacketReceiver, PacketSender, Role, SessionState};
use super::{AuthError, ProtocolError};
use crate::dns::geo_resolver::GeoResolver;
use crate::events::{Event, EventBuses, EVENT_TRANSMISSION, EVENT_TRANSMISSION_BUS};
use crate::nodes::{NodeInfo, NodeRegistry};

#[derive(Debug, Clone)]
pub struct NodeClientConfig {
    /// `host:port` of the master
    pub master_addr: String,
    /// Identity sent at login
    pub info: NodeInfo,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    /// Silence after which a ready session is considered dead
    pub read_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl NodeClientConfig {
    pub fn new(master_addr: impl Into<String>, info: NodeInfo) -> Self {
        Self {
            master_addr: master_addr.into(),
            info,
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(40),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct NodeClient {
    config: NodeClientConfig,
    keys: Arc<KeyStore>,
    nodes: NodeRegistry,
    geo: Arc<GeoResolver>,
    buses: EventBuses,
    link: MasterLink,
}

impl NodeClient {
    pub fn new(
        config: NodeClientConfig,
        keys: Arc<KeyStore>,
        geo: Arc<GeoResolver>,
        buses: EventBuses,
    ) -> Self {
        Self {
            config,
            keys,
            nodes: NodeRegistry::new(),
            geo,
            buses,
            link: MasterLink::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.config.info.key
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// Handle on the current master session
    pub fn link(&self) -> MasterLink {
        self.link.clone()
    }

    /// Stay connected to the master. Only returns on a fatal error.
    pub async fn run(&self) -> Result<(), ProtocolError> {
        loop {
            match self.connect_once().await {
                Err(e) if e.is_fatal() => {
                    error!("Master session failed fatally: {}", e);
                    return Err(e);
                }
                Err(e) => warn!(
                    "Master session lost: {}; reconnecting in {:?}",
                    e, self.config.reconnect_delay
                ),
                Ok(()) => info!(
                    "Master session closed; reconnecting in {:?}",
                    self.config.reconnect_delay
                ),
            }
            sleep(self.config.reconnect_delay).await;
        }
    }

    /// One connection attempt, run until the session ends
    pub async fn connect_once(&self) -> Result<(), ProtocolError> {
        debug!("Connecting to master at {}", self.config.master_addr);
        let stream = TcpStream::connect(&self.config.master_addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        self.run_session(stream).await
    }

    /// Handshake and serve over an established stream
    pub async fn run_session<S>(&self, stream: S) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut rx, tx) = session::split(stream);
        let result = self.session_loop(&mut rx, &tx).await;
        self.link.clear().await;
        tx.close().await;
        result
    }

    async fn session_loop(
        &self,
        rx: &mut PacketReceiver,
        tx: &PacketSender,
    ) -> Result<(), ProtocolError> {
        let mut secret = [0u8; SECRET_LEN];
        rand::thread_rng().fill(&mut secret);
        let ciphertext = self
            .keys
            .encrypt_for(MASTER_KEY_NAME, &secret)
            .map_err(|e| match e {
                KeyError::NotFound(name) => AuthError::MissingPublicKey(name),
                other => AuthError::Key(other),
            })?;

        // Raw ciphertext, not CBOR
        tx.send(&Packet::new(PacketId::SharedSecret.as_u32(), ciphertext))
            .await?;
        rx.enable_cipher(&secret)?;
        tx.enable_cipher(&secret).await?;
        tx.send_payload(PacketId::Login, &self.config.info).await?;

        let mut state = SessionState::AesReady;
        let mut mutual_challenge: Option<String> = None;
        let mut _heartbeat: Option<AbortOnDrop> = None;

        loop {
            let deadline = if state == SessionState::FullyReady {
                self.config.read_timeout
            } else {
                self.config.handshake_timeout
            };
            let packet = timeout(deadline, rx.recv())
                .await
                .map_err(|_| ProtocolError::Timeout)??;

            let id = PacketId::try_from(packet.id)?;
            if !state.admits(Role::Node, id) {
                return Err(ProtocolError::UnexpectedPacket { id, state });
            }

            match id {
                PacketId::ChallengeStart => {
                    let start: ChallengeStart = decode_payload(&packet)?;
                    let signature = self
                        .keys
                        .sign(start.challenge.as_bytes())
                        .map_err(AuthError::from)?;
                    let mutual = random_challenge(self.key());
                    tx.send_payload(
                        PacketId::ChallengeResult,
                        &ChallengeResult {
                            key: self.key().to_string(),
                            challenge: start.challenge,
                            result: signature,
                            mutual_challenge: mutual.clone(),
                        },
                    )
                    .await?;
                    mutual_challenge = Some(mutual);
                }
                PacketId::ChallengeFinish => {
                    let finish: ChallengeFinish = decode_payload(&packet)?;
                    let expected = mutual_challenge.take().ok_or(AuthError::UnknownChallenge)?;
                    if finish.challenge != expected {
                        return Err(AuthError::SignatureInvalid.into());
                    }
                    self.keys
                        .verify_with(MASTER_KEY_NAME, expected.as_bytes(), &finish.result)?;

                    state = SessionState::FullyReady;
                    self.geo.reset(&finish.nodes).await;
                    self.nodes.reset(finish.nodes).await;
                    self.link.set(tx.clone()).await;
                    _heartbeat = Some(spawn_heartbeat(tx.clone(), self.config.ping_interval));
                    info!(
                        "Authenticated with master as '{}' ({} node(s) attached)",
                        self.key(),
                        self.nodes.len().await
                    );
                }
                PacketId::EventTransmission => {
                    let transmission: EventTransmission = decode_payload(&packet)?;
                    let fired_by = transmission.event.fired_by.clone();
                    match Event::new(EVENT_TRANSMISSION, &fired_by, &transmission) {
                        Ok(event) => {
                            self.buses.bus(EVENT_TRANSMISSION_BUS).publish(event).await;
                        }
                        Err(e) => warn!("Failed to wrap inbound event: {}", e),
                    }
                }
                PacketId::NodeAttached => {
                    let attached: NodeAttached = decode_payload(&packet)?;
                    debug!("Peer '{}' attached", attached.node.key);
                    self.geo.attach_node(&attached.node).await;
                    self.nodes.attach(attached.node).await;
                }
                PacketId::NodeDetached => {
                    let detached: NodeDetached = decode_payload(&packet)?;
                    debug!("Peer '{}' detached", detached.key);
                    self.nodes.detach(&detached.key).await;
                    self.geo.detach_node(&detached.key).await;
                }
                PacketId::Ping => {
                    let ping: Ping = decode_payload(&packet)?;
                    tx.send_payload(PacketId::Pong, &Pong { nonce: ping.nonce }).await?;
                }
                PacketId::Pong => {}
                other => debug!("Ignoring packet {:?}", other),
            }
        }
    }
}

fn random_challenge(key: &str) -> String {
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("{}-{}", key, nonce)
}

fn spawn_heartbeat(tx: PacketSender, interval: Duration) -> AbortOnDrop {
    AbortOnDrop(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut nonce = 0u64;
        loop {
            ticker.tick().await;
            nonce = nonce.wrapping_add(1);
            if let Err(e) = tx.send_payload(PacketId::Ping, &Ping { nonce }).await {
                debug!("Heartbeat stopped: {}", e);
                break;
            }
        }
    }))
}
