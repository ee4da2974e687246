//! 패킷 코덱
//!
//! 고정 길이 헤더 + 가변 페이로드. 모든 정수는 네트워크 바이트 순서(big-endian).
//!
//! ```text
//! magic(2) | version(1) | type(1) | sequence(2) | ack_sequence(2) | ack_bitmap(4) | length(2) | payload
//! ```
//!
//! type 바이트: bit7 = reliable, bit6 = ack 필드 유효, bit0-5 = 종류 코드

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::{Message, MessageType, KIND_MASK};
use crate::sequence::Ack;
use crate::{HEADER_SIZE, MAGIC_NUMBER, PROTOCOL_VERSION};

/// type 바이트 플래그
pub mod flags {
    /// 신뢰성 메시지
    pub const RELIABLE: u8 = 0b1000_0000;
    /// ack_sequence/ack_bitmap 필드가 유효함
    pub const ACK: u8 = 0b0100_0000;
}

/// 잘못된 데이터그램. 로그 후 버려지며 애플리케이션에 전달되지 않는다.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("헤더보다 짧은 데이터그램: {len} bytes")]
    TooShort { len: usize },

    #[error("유효하지 않은 매직 넘버: expected {expected:04X}, got {got:04X}")]
    InvalidMagic { expected: u16, got: u16 },

    #[error("지원하지 않는 프로토콜 버전: expected {expected}, got {got}")]
    UnsupportedVersion { expected: u8, got: u8 },

    #[error("알 수 없는 메시지 타입 코드: {0}")]
    UnknownMessageType(u8),

    #[error("페이로드 길이 불일치: 선언 {declared}, 실제 {available}")]
    PayloadTruncated { declared: usize, available: usize },

    #[error("페이로드가 너무 큼: {0} bytes")]
    PayloadTooLarge(usize),
}

/// 메시지를 와이어 바이트로 인코딩
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let payload_len = message.payload.len();
    if payload_len > u16::MAX as usize {
        return Err(CodecError::PayloadTooLarge(payload_len));
    }

    let mut type_byte = message.msg_type.code();
    if message.reliable {
        type_byte |= flags::RELIABLE;
    }
    let ack = message.ack.unwrap_or(Ack { sequence: 0, bitmap: 0 });
    if message.ack.is_some() {
        type_byte |= flags::ACK;
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len);
    buf.put_u16(MAGIC_NUMBER);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(type_byte);
    buf.put_u16(message.sequence);
    buf.put_u16(ack.sequence);
    buf.put_u32(ack.bitmap);
    buf.put_u16(payload_len as u16);
    buf.put_slice(&message.payload);

    Ok(buf.freeze())
}

/// 와이어 바이트를 메시지로 디코딩 (부수효과 없음)
///
/// 선언된 길이 뒤의 잉여 바이트는 무시한다.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::TooShort { len: bytes.len() });
    }

    let mut header = &bytes[..HEADER_SIZE];
    let magic = header.get_u16();
    if magic != MAGIC_NUMBER {
        return Err(CodecError::InvalidMagic {
            expected: MAGIC_NUMBER,
            got: magic,
        });
    }

    let version = header.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion {
            expected: PROTOCOL_VERSION,
            got: version,
        });
    }

    let type_byte = header.get_u8();
    let msg_type = MessageType::from_code(type_byte & KIND_MASK)
        .ok_or(CodecError::UnknownMessageType(type_byte & KIND_MASK))?;

    let sequence = header.get_u16();
    let ack_sequence = header.get_u16();
    let ack_bitmap = header.get_u32();
    let declared = header.get_u16() as usize;

    let available = bytes.len() - HEADER_SIZE;
    if declared > available {
        return Err(CodecError::PayloadTruncated {
            declared,
            available,
        });
    }

    let ack = (type_byte & flags::ACK != 0).then_some(Ack {
        sequence: ack_sequence,
        bitmap: ack_bitmap,
    });

    Ok(Message {
        msg_type,
        sequence,
        ack,
        reliable: type_byte & flags::RELIABLE != 0,
        payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + declared]),
    })
}
