//! # RDL (Reliable Datagram Layer)
//!
//! UDP 위의 신뢰성/순서 보장 메시징 계층
//!
//! ## 핵심 특징
//! - **선택적 신뢰성**: 메시지마다 reliable/unreliable 선택
//! - **ACK 비트맵**: 최신 ack 시퀀스 + 이전 32개 수신 여부를 모든 송신에 피기백
//! - **지수 백오프 재전송**: 최대 재시도 초과 시 `DeliveryFailure` 보고
//! - **중복 제거 / 순서 보장**: strict 모드에서는 reorder 버퍼로 빈틈을 기다림
//! - **연결 관리**: 핸드쉐이크, heartbeat, 타임아웃 퇴출
//! - **태그 기반 디스패치**: 48개 애플리케이션 태그별 핸들러
//! - **LAN 탐색**: 브로드캐스트로 서버 검색
//! - **이벤트 검증**: 서버 검증기가 클라이언트 메시지를 판정하고 결과를 회신
//! - **선택적 압축**: zlib 페이로드 압축

pub mod client;
pub mod codec;
pub mod compression;
pub mod config;
pub mod connection;
pub mod dispatcher;
mod endpoint;
pub mod error;
pub mod interceptor;
pub mod logging;
pub mod message;
pub mod reliability;
pub mod sequence;
pub mod server;
pub mod session;
pub mod stats;

pub use client::{Client, ClientBuilder, DiscoveredServer};
pub use codec::{decode, encode, CodecError};
pub use config::Config;
pub use connection::{Connection, ConnectionState, PeerInfo};
pub use dispatcher::{Delivery, DisconnectReason, HandlerRegistry};
pub use endpoint::DeliveryFailure;
pub use error::{Error, HandshakeError, Result};
pub use interceptor::{Interceptor, PassThrough, RandomLoss};
pub use logging::{LogContext, LogLevel, LogSink, MemorySink, TracingSink};
pub use message::{Message, MessageTag, MessageType, RejectReason, Verdict};
pub use reliability::ReliabilityEngine;
pub use sequence::{Ack, Sequence};
pub use server::{Server, ServerBuilder};
pub use stats::{StatsSnapshot, TrafficStats};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 매직 넘버 (패킷 식별용)
pub const MAGIC_NUMBER: u16 = 0x5244; // "RD"

/// 고정 헤더 크기 (바이트)
pub const HEADER_SIZE: usize = 14;

/// 기본/최대 데이터그램 크기 (바이트)
pub const MAX_DATAGRAM_SIZE: usize = 10240; // 10KB

/// 기본 애플리케이션 버전
pub const DEFAULT_APP_VERSION: &str = "1.0";
