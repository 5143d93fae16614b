//! Framing: length-prefix (4 bytes LE) + bincode payload, and the coded units sent over a link.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{NetworkCode, WindowMessage};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a value into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(value).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a value into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the value and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let value = decode_payload(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((value, LEN_SIZE + len))
}

/// Payload length announced by a frame header. For stream readers that read header and payload separately.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode a frame payload (without its length header).
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameDecodeError> {
    bincode::deserialize(payload).map_err(FrameDecodeError::Decode)
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// A `WindowMessageTransfer` unit: code byte followed by the framed message.
pub fn encode_transfer(msg: &WindowMessage) -> Result<Vec<u8>, FrameEncodeError> {
    let frame = encode_frame(msg)?;
    let mut out = Vec::with_capacity(1 + frame.len());
    out.push(NetworkCode::WindowMessageTransfer as u8);
    out.extend_from_slice(&frame);
    Ok(out)
}

/// A bodiless unit (`KeepAlive` or `KeepAliveReply`).
pub fn encode_code(code: NetworkCode) -> Vec<u8> {
    vec![code as u8]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::WindowInfo;
    use crate::protocol::{Content, MessageCode};

    fn sample_message() -> WindowMessage {
        let a = WindowInfo::new(1, "lab");
        let b = WindowInfo::new(2, "lab");
        let mut msg = WindowMessage::new(a.clone(), Some(b.clone()), MessageCode::Text)
            .with_content(Content::Text("hello".into()));
        msg.route = vec![a.clone()];
        msg.sender = Some(a);
        msg
    }

    #[test]
    fn transfer_unit_layout() {
        let msg = sample_message();
        let unit = encode_transfer(&msg).unwrap();
        assert_eq!(unit[0], NetworkCode::WindowMessageTransfer as u8);
        let (decoded, n): (WindowMessage, usize) = decode_frame(&unit[1..]).unwrap();
        assert_eq!(n, unit.len() - 1);
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.route, msg.route);
        assert_eq!(decoded.text(), Some("hello"));
        assert_eq!(decoded.target, msg.target);
    }

    #[test]
    fn sender_is_not_serialized() {
        let msg = sample_message();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, _): (WindowMessage, usize) = decode_frame(&frame).unwrap();
        assert!(decoded.sender.is_none());
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_message()).unwrap();
        assert!(matches!(
            decode_frame::<WindowMessage>(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame::<WindowMessage>(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_header_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(header), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let result = decode_payload::<WindowMessage>(&[0xff; 3]);
        assert!(matches!(result, Err(FrameDecodeError::Decode(_))));
    }

    #[test]
    fn keep_alive_units_are_one_byte() {
        assert_eq!(encode_code(NetworkCode::KeepAlive), vec![0x02]);
        assert_eq!(encode_code(NetworkCode::KeepAliveReply), vec![0x03]);
    }
}
