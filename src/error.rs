//! 에러 타입 정의

use std::net::SocketAddr;

use thiserror::Error;

use crate::codec::CodecError;
use crate::message::RejectReason;

/// RDL 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("패킷 코덱 에러: {0}")]
    Codec(#[from] CodecError),

    #[error("핸드쉐이크 실패: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("워커 풀 생성 실패: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("페이로드 크기 초과: {size} bytes (최대 {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("유효하지 않은 메시지 태그: {0}")]
    InvalidTag(u8),

    #[error("연결되지 않음")]
    NotConnected,

    #[error("알 수 없는 피어: {peer}")]
    UnknownPeer { peer: SocketAddr },

    #[error("엔드포인트 종료됨")]
    EndpointClosed,

    #[error("소켓 장애로 엔드포인트 중단: {0}")]
    EndpointFailed(String),
}

/// `connect()` 호출자에게만 전달되는 핸드쉐이크 에러
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("서버가 연결을 거부함: {reason}")]
    Rejected { reason: RejectReason },

    #[error("핸드쉐이크 타임아웃 ({after_ms}ms)")]
    TimedOut { after_ms: u64 },

    #[error("잘못된 핸드쉐이크 메시지: {0}")]
    Malformed(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
