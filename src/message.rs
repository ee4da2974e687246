//! 프로토콜 메시지 정의
//!
//! - `MessageType`: 헤더 type 바이트의 종류 (컨트롤 + 애플리케이션 태그)
//! - `Message`: 디코딩된 데이터그램 하나
//! - 컨트롤 페이로드: bincode로 직렬화되는 핸드쉐이크/종료/디스커버리/판정 메시지

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::sequence::{Ack, Sequence};
use crate::{Error, Result};

/// 애플리케이션 태그 수 (type 코드 16..=63)
pub const TAG_COUNT: usize = 48;

/// 애플리케이션 태그가 시작하는 type 코드
const APPLICATION_BASE: u8 = 16;

/// type 바이트에서 종류 코드가 차지하는 비트
pub(crate) const KIND_MASK: u8 = 0b0011_1111;

/// 애플리케이션 메시지 태그 (0..=47)
///
/// 핸들러 레지스트리의 키로 사용된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageTag(u8);

impl MessageTag {
    pub const MAX: u8 = (TAG_COUNT - 1) as u8;

    /// 새 태그 생성 (범위 밖이면 에러)
    pub fn new(tag: u8) -> Result<Self> {
        if tag as usize >= TAG_COUNT {
            return Err(Error::InvalidTag(tag));
        }
        Ok(Self(tag))
    }

    /// 컴파일 타임 상수용 생성자 (범위 밖이면 MAX로 고정)
    pub const fn saturating(tag: u8) -> Self {
        if tag > Self::MAX {
            Self(Self::MAX)
        } else {
            Self(tag)
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// 연결 요청 (클라이언트 → 서버)
    HandshakeRequest,

    /// 연결 수락 (서버 → 클라이언트)
    HandshakeAccept,

    /// 연결 거부 (서버 → 클라이언트)
    HandshakeReject,

    /// Heartbeat (생존 확인, 페이로드 없음)
    Heartbeat,

    /// 단독 ack (페이로드 없음)
    Ack,

    /// 연결 종료 알림
    Disconnect,

    /// LAN 서버 탐색 요청
    Discover,

    /// LAN 서버 탐색 응답
    DiscoverReply,

    /// 서버의 이벤트 판정 (서버 → 클라이언트)
    Verdict,

    /// 애플리케이션 메시지
    Application(MessageTag),
}

impl MessageType {
    /// 헤더에 기록되는 종류 코드 (하위 6비트)
    pub fn code(self) -> u8 {
        match self {
            MessageType::HandshakeRequest => 1,
            MessageType::HandshakeAccept => 2,
            MessageType::HandshakeReject => 3,
            MessageType::Heartbeat => 4,
            MessageType::Ack => 5,
            MessageType::Disconnect => 6,
            MessageType::Discover => 7,
            MessageType::DiscoverReply => 8,
            MessageType::Verdict => 9,
            MessageType::Application(tag) => APPLICATION_BASE + tag.get(),
        }
    }

    /// 종류 코드에서 복원
    pub fn from_code(code: u8) -> Option<Self> {
        let msg_type = match code {
            1 => MessageType::HandshakeRequest,
            2 => MessageType::HandshakeAccept,
            3 => MessageType::HandshakeReject,
            4 => MessageType::Heartbeat,
            5 => MessageType::Ack,
            6 => MessageType::Disconnect,
            7 => MessageType::Discover,
            8 => MessageType::DiscoverReply,
            9 => MessageType::Verdict,
            c if (APPLICATION_BASE..=KIND_MASK).contains(&c) => {
                MessageType::Application(MessageTag(c - APPLICATION_BASE))
            }
            _ => return None,
        };
        Some(msg_type)
    }

    pub fn tag(self) -> Option<MessageTag> {
        match self {
            MessageType::Application(tag) => Some(tag),
            _ => None,
        }
    }

    pub fn is_application(self) -> bool {
        matches!(self, MessageType::Application(_))
    }
}

/// 디코딩된 메시지 (데이터그램 하나)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,

    /// 송신 시퀀스
    /// 비신뢰 애플리케이션 메시지는 다음 시퀀스를 정보로만 싣고,
    /// heartbeat/ack는 송신측의 가장 오래된 미확인 시퀀스(floor)를 싣는다
    pub sequence: Sequence,

    /// 피기백된 ack (수신 이력이 없으면 None)
    pub ack: Option<Ack>,

    /// 신뢰성 메시지 여부
    pub reliable: bool,

    pub payload: Bytes,
}

impl Message {
    /// ack/시퀀스 없는 비신뢰 메시지
    pub fn unreliable(msg_type: MessageType, payload: Bytes) -> Self {
        Self {
            msg_type,
            sequence: 0,
            ack: None,
            reliable: false,
            payload,
        }
    }

    /// 컨트롤 페이로드를 담은 비신뢰 메시지
    pub fn control<P: ControlPayload>(body: &P) -> Result<Self> {
        Ok(Self::unreliable(P::MESSAGE_TYPE, body.to_payload()?))
    }

    /// 페이로드를 컨트롤 메시지로 해석
    pub fn parse<P: ControlPayload>(&self) -> Result<P> {
        P::from_payload(&self.payload)
    }
}

/// bincode로 페이로드에 담기는 컨트롤 메시지
pub trait ControlPayload: Serialize + DeserializeOwned {
    const MESSAGE_TYPE: MessageType;

    fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    fn from_payload(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// 연결 요청
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// 클라이언트가 생성한 식별자
    pub client_id: u64,

    /// 클라이언트 애플리케이션 버전
    pub app_version: String,

    /// 페이로드 압축 사용 여부 (서버 설정과 같아야 함)
    pub compression: bool,
}

impl ControlPayload for HandshakeRequest {
    const MESSAGE_TYPE: MessageType = MessageType::HandshakeRequest;
}

/// 연결 수락
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAccept {
    /// 요청의 client_id 에코
    pub client_id: u64,

    pub server_name: Option<String>,

    /// 서버 heartbeat 간격 (참고용)
    pub heartbeat_interval_ms: u64,

    /// 서버 연결 타임아웃 (참고용)
    pub connection_timeout_ms: u64,
}

impl ControlPayload for HandshakeAccept {
    const MESSAGE_TYPE: MessageType = MessageType::HandshakeAccept;
}

/// 연결 거부 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// 애플리케이션 버전 불일치
    VersionMismatch,
    /// 최대 연결 수 도달
    ServerFull,
    /// 같은 주소에 다른 클라이언트가 이미 연결됨
    AddressInUse,
    /// 요청 페이로드 해석 실패
    Malformed,
    /// 페이로드 압축 설정 불일치
    CompressionMismatch,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::VersionMismatch => "version mismatch",
            RejectReason::ServerFull => "server full",
            RejectReason::AddressInUse => "address in use",
            RejectReason::Malformed => "malformed request",
            RejectReason::CompressionMismatch => "compression mismatch",
        };
        f.write_str(text)
    }
}

/// 연결 거부
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReject {
    pub client_id: u64,
    pub reason: RejectReason,
}

impl ControlPayload for HandshakeReject {
    const MESSAGE_TYPE: MessageType = MessageType::HandshakeReject;
}

/// 종료 알림 사유 (와이어)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectCode {
    /// 상대가 명시적으로 종료
    Closed,
    /// 엔드포인트 종료
    Shutdown,
    /// 등록되지 않은 주소에서 온 트래픽
    NotConnected,
}

/// 연결 종료 알림
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectNotice {
    pub code: DisconnectCode,
}

impl ControlPayload for DisconnectNotice {
    const MESSAGE_TYPE: MessageType = MessageType::Disconnect;
}

/// LAN 서버 탐색 요청
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub app_version: String,
}

impl ControlPayload for DiscoverRequest {
    const MESSAGE_TYPE: MessageType = MessageType::Discover;
}

/// LAN 서버 탐색 응답
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverReply {
    pub server_name: Option<String>,
    pub app_version: String,
    /// 요청한 클라이언트 버전과 호환 여부
    pub compatible: bool,
    pub connections: u32,
    pub capacity: u32,
}

impl ControlPayload for DiscoverReply {
    const MESSAGE_TYPE: MessageType = MessageType::DiscoverReply;
}

/// 서버 검증기의 판정
///
/// 신뢰성 메시지에만 보내며 `sequence`는 판정한 메시지의 시퀀스다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub sequence: Sequence,
    pub legal: bool,
}

impl ControlPayload for Verdict {
    const MESSAGE_TYPE: MessageType = MessageType::Verdict;
}
