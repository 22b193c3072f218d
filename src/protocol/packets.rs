//! Packet ids and payloads
//!
//! Payloads are CBOR documents; the payload type is implied by the packet id.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::codec::Packet;
use super::ProtocolError;
use crate::events::Event;
use crate::nodes::NodeInfo;

/// Fixed packet ids. Id 6 is reserved and never sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketId {
    /// Node -> master, first packet of every session, sent in plaintext.
    ///
    /// The payload is NOT CBOR: it is the raw RSA PKCS#1 v1.5 ciphertext of
    /// the 16-byte AES secret, encrypted to the master's public key. Existing
    /// nodes depend on this exact layout.
    SharedSecret = 0,
    Login = 1,
    ChallengeStart = 2,
    ChallengeResult = 3,
    ChallengeFinish = 4,
    Config = 5,
    Ready = 7,
    Ping = 8,
    Pong = 9,
    Error = 10,
    BinaryData = 11,
    BinaryDataEnd = 12,
    EventTransmission = 13,
    NodeAttached = 14,
    NodeDetached = 15,
}

impl PacketId {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for PacketId {
    type Error = ProtocolError;

    fn try_from(id: u32) -> Result<Self, ProtocolError> {
        Ok(match id {
            0 => PacketId::SharedSecret,
            1 => PacketId::Login,
            2 => PacketId::ChallengeStart,
            3 => PacketId::ChallengeResult,
            4 => PacketId::ChallengeFinish,
            5 => PacketId::Config,
            7 => PacketId::Ready,
            8 => PacketId::Ping,
            9 => PacketId::Pong,
            10 => PacketId::Error,
            11 => PacketId::BinaryData,
            12 => PacketId::BinaryDataEnd,
            13 => PacketId::EventTransmission,
            14 => PacketId::NodeAttached,
            15 => PacketId::NodeDetached,
            other => return Err(ProtocolError::UnknownPacket(other)),
        })
    }
}

/// Login payload
pub type Login = NodeInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeStart {
    pub challenge: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResult {
    pub key: String,
    pub challenge: String,
    /// Node signature over `challenge`
    pub result: Vec<u8>,
    /// Challenge the master must sign back
    pub mutual_challenge: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeFinish {
    /// Echo of the node's mutual challenge
    pub challenge: String,
    /// Master signature over `challenge`
    pub result: Vec<u8>,
    /// Every attached node in attach order, the receiver included
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTransmission {
    pub event_bus_name: String,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttached {
    pub node: NodeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDetached {
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// CBOR-encode `payload` into a packet with the given id
pub fn encode_payload<T: Serialize>(id: PacketId, payload: &T) -> Result<Packet, ProtocolError> {
    let mut data = Vec::new();
    ciborium::into_writer(payload, &mut data).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(Packet::new(id.as_u32(), data))
}

/// Decode the CBOR payload of `packet`
pub fn decode_payload<T: DeserializeOwned>(packet: &Packet) -> Result<T, ProtocolError> {
    ciborium::from_reader(&packet.data[..]).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::Location;

    #[test]
    fn test_ids_are_fixed() {
        for raw in 0..=15u32 {
            match PacketId::try_from(raw) {
                Ok(id) => assert_eq!(id.as_u32(), raw),
                Err(ProtocolError::UnknownPacket(6)) => assert_eq!(raw, 6),
                Err(e) => panic!("unexpected error for {}: {}", raw, e),
            }
        }
        assert!(PacketId::try_from(16).is_err());
    }

    #[test]
    fn test_node_info_payload() {
        let info = NodeInfo::new("edge-a")
            .with_listeners(vec!["192.0.2.10".parse().unwrap(), "2001:db8::1".parse().unwrap()])
            .with_location(Location::new(52.52, 13.4));
        let packet = encode_payload(PacketId::Login, &info).unwrap();
        assert_eq!(packet.id, 1);
        let decoded: Login = decode_payload(&packet).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let packet = Packet::new(PacketId::ChallengeStart.as_u32(), vec![0xff, 0x00, 0x13]);
        assert!(matches!(
            decode_payload::<ChallengeStart>(&packet),
            Err(ProtocolError::Decode(_))
        ));
    }
}
