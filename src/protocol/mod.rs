//! Master/Node Control Plane
//!
//! Every node keeps one persistent TCP session to the master. The session
//! starts in plaintext, switches to AES-128-CFB8 once the node has delivered
//! its shared secret, and becomes fully ready after a mutual RSA
//! challenge/response.
//!
//! ```text
//! Node                                   Master
//!  | -- SharedSecret (RSA ciphertext) --> |   Initial -> AesReady
//!  | -- Login{NodeInfo} ----------------> |
//!  | <-------------- ChallengeStart ----- |
//!  | -- ChallengeResult ----------------> |   AesReady -> FullyReady
//!  | <-- ChallengeFinish{sig, nodes} ---- |   NodeAttached -> peers
//!  | <=========== EventTransmission ====> |
//! ```
//!
//! ## Components
//!
//! - `varint`: 7-bit continuation integers used in frame headers
//! - `codec`: `len | id | payload` framing
//! - `cipher`: AES-CFB8 reader/writer halves
//! - `keys`: per-principal RSA key pairs on disk
//! - `packets`: packet ids and CBOR payloads
//! - `session`: session state machine and split connection
//! - `master` / `node`: the two handler sets

pub mod cipher;
pub mod codec;
pub mod keys;
pub mod master;
pub mod node;
pub mod packets;
pub mod session;
pub mod varint;

pub use codec::Packet;
pub use keys::{KeyError, KeyStore};
pub use master::{Master, MasterConfig};
pub use node::{NodeClient, NodeClientConfig};
pub use packets::PacketId;
pub use session::SessionState;

/// Authentication failures. Never echoed back to an untrusted peer.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no public key on file for {0}")]
    MissingPublicKey(String),

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("unknown or expired challenge")]
    UnknownChallenge,

    #[error("challenge was issued to {expected}, result claims {claimed}")]
    KeyMismatch { expected: String, claimed: String },

    #[error("key store error: {0}")]
    Key(#[from] KeyError),
}

/// Errors surfaced by a control-plane session. Any of them closes the session.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed varint")]
    MalformedVarInt,

    #[error("truncated frame")]
    Truncated,

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("declared frame length {declared} disagrees with content length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown packet id {0}")]
    UnknownPacket(u32),

    #[error("packet {id:?} not admissible in state {state:?}")]
    UnexpectedPacket { id: PacketId, state: SessionState },

    #[error("payload decode failed: {0}")]
    Decode(String),

    #[error("payload encode failed: {0}")]
    Encode(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("session timed out")]
    Timeout,

    #[error("session closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Failures after which a node must stop instead of reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Auth(AuthError::SignatureInvalid)
                | ProtocolError::Auth(AuthError::MissingPublicKey(_))
                | ProtocolError::Auth(AuthError::Key(_))
        )
    }
}
