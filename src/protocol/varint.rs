//! Variable-length integers
//!
//! Little-endian groups of 7 bits; the high bit of each byte says another
//! byte follows. Values are limited to 32 bits, so at most 5 bytes are read
//! and a continuation bit on the fifth byte is a protocol error.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::ProtocolError;

/// Maximum encoded length of a 32-bit varint
pub const MAX_VARINT_LEN: usize = 5;

const SEGMENT_BITS: u8 = 0x7f;
const CONTINUE_BIT: u8 = 0x80;

/// Append the encoding of `value` to `buf`
pub fn encode(mut value: u32, buf: &mut Vec<u8>) {
    loop {
        if value & !(SEGMENT_BITS as u32) == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push((value as u8 & SEGMENT_BITS) | CONTINUE_BIT);
        value >>= 7;
    }
}

/// Number of bytes `encode` writes for `value`
pub fn encoded_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

/// Decode a varint from the front of `bytes`, returning the value and the
/// number of bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(u32, usize), ProtocolError> {
    let mut value: u32 = 0;
    for (i, byte) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= ((byte & SEGMENT_BITS) as u32) << (7 * i);
        if byte & CONTINUE_BIT == 0 {
            return Ok((value, i + 1));
        }
        if i == MAX_VARINT_LEN - 1 {
            return Err(ProtocolError::MalformedVarInt);
        }
    }
    Err(ProtocolError::Truncated)
}

/// Read one varint from an async stream
pub async fn read_varint<R>(reader: &mut R) -> Result<u32, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().await?;
        value |= ((byte & SEGMENT_BITS) as u32) << (7 * i);
        if byte & CONTINUE_BIT == 0 {
            return Ok(value);
        }
    }
    Err(ProtocolError::MalformedVarInt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_lengths() {
        let cases: [(u32, usize); 9] = [
            (0, 1),
            (1, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (268_435_455, 4),
        ];

        for (value, len) in cases {
            let mut buf = Vec::new();
            encode(value, &mut buf);
            assert_eq!(buf.len(), len, "encoded length of {}", value);
            assert_eq!(encoded_len(value), len);
            assert_eq!(decode(&buf).unwrap(), (value, len));
        }
    }

    #[test]
    fn test_max_value_uses_five_bytes() {
        let mut buf = Vec::new();
        encode(u32::MAX, &mut buf);
        assert_eq!(buf, vec![0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert_eq!(decode(&buf).unwrap(), (u32::MAX, 5));
    }

    #[test]
    fn test_continuation_on_fifth_byte_rejected() {
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!(matches!(decode(&bytes), Err(ProtocolError::MalformedVarInt)));
    }

    #[test]
    fn test_truncated_input() {
        assert!(matches!(decode(&[0x80, 0x80]), Err(ProtocolError::Truncated)));
        assert!(matches!(decode(&[]), Err(ProtocolError::Truncated)));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        assert_eq!(decode(&[0xac, 0x02, 0xff]).unwrap(), (300, 2));
    }

    #[tokio::test]
    async fn test_read_varint_from_stream() {
        let mut buf = Vec::new();
        encode(16_384, &mut buf);
        let mut reader = &buf[..];
        assert_eq!(read_varint(&mut reader).await.unwrap(), 16_384);
    }

    #[tokio::test]
    async fn test_read_varint_rejects_overlong() {
        let bytes = [0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        let mut reader = &bytes[..];
        assert!(matches!(
            read_varint(&mut reader).await,
            Err(ProtocolError::MalformedVarInt)
        ));
    }
}
