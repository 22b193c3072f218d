//! Frame codec
//!
//! ```text
//! packet := len:VarInt  id:VarInt  payload[len - |id|]
//! ```
//!
//! `len` counts the encoded id plus the payload. Frames are read through the
//! session cipher, so this layer never sees ciphertext.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::varint;
use super::ProtocolError;

/// Largest frame accepted from a peer (4 MiB). Certificate bundles are the
/// biggest payloads that cross the session.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// One framed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u32,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        Self { id, data }
    }
}

/// Serialize a packet into a complete frame
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    let body_len = varint::encoded_len(packet.id) + packet.data.len();
    if body_len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body_len));
    }

    let mut frame = Vec::with_capacity(varint::encoded_len(body_len as u32) + body_len);
    varint::encode(body_len as u32, &mut frame);
    varint::encode(packet.id, &mut frame);
    frame.extend_from_slice(&packet.data);
    Ok(frame)
}

/// Decode exactly one frame from `bytes`.
///
/// The declared length must match the bytes that follow the length prefix.
pub fn decode_frame(bytes: &[u8]) -> Result<Packet, ProtocolError> {
    let (declared, prefix_len) = varint::decode(bytes)?;
    let declared = declared as usize;
    if declared > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(declared));
    }

    let body = &bytes[prefix_len..];
    if body.len() != declared {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }

    let (id, id_len) = varint::decode(body).map_err(|e| match e {
        ProtocolError::Truncated => ProtocolError::LengthMismatch {
            declared,
            actual: body.len(),
        },
        other => other,
    })?;

    Ok(Packet {
        id,
        data: body[id_len..].to_vec(),
    })
}

/// Read the next frame from a stream
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = varint::read_varint(reader).await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        }
    })?;

    let (id, id_len) = varint::decode(&body).map_err(|_| ProtocolError::LengthMismatch {
        declared: len,
        actual: body.len(),
    })?;
    body.drain(..id_len);

    Ok(Packet { id, data: body })
}
