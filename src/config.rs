//! 프로토콜 설정

use std::time::Duration;

use crate::sequence::HALF_RANGE;
use crate::{Error, Result, DEFAULT_APP_VERSION, MAX_DATAGRAM_SIZE};

/// RDL 엔드포인트 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 첫 재전송 대기 시간 (밀리초)
    pub retry_timeout_base_ms: u64,

    /// 재전송마다 곱해지는 백오프 배수
    pub retry_backoff_factor: u32,

    /// 재전송 대기 시간 상한 (밀리초)
    pub retry_timeout_max_ms: u64,

    /// 최대 재전송 횟수 (초과 시 DeliveryFailure 보고)
    pub max_retries: u32,

    /// 송신이 없을 때 heartbeat 전송 간격 (밀리초)
    pub heartbeat_interval_ms: u64,

    /// 수신이 없을 때 연결 종료까지의 시간 (밀리초)
    pub connection_timeout_ms: u64,

    /// 타이머 루프 주기 (재전송/heartbeat/타임아웃 검사, 밀리초)
    pub sweep_interval_ms: u64,

    /// 기본 connect 타임아웃 (밀리초)
    pub handshake_timeout_ms: u64,

    /// 순서 보장 모드
    /// true면 앞선 시퀀스는 빈틈이 채워질 때까지 reorder 버퍼에 보관
    pub strict_ordering: bool,

    /// reorder 버퍼 최대 메시지 수 (초과분은 ack 없이 버림)
    pub reorder_buffer_limit: usize,

    /// 기대 시퀀스보다 앞서 받아들이는 최대 거리
    pub receive_window: u16,

    /// 서버 최대 동시 연결 수
    pub max_connections: usize,

    /// 최대 데이터그램 크기 (헤더 포함, 바이트)
    pub max_datagram_size: usize,

    /// 애플리케이션 버전 (핸드쉐이크/디스커버리에서 비교)
    pub app_version: String,

    /// 서버 이름 (accept/디스커버리 응답에 포함)
    pub server_name: Option<String>,

    /// 핸들러 워커 수 (0이면 수신 루프에서 동기 호출)
    pub dispatch_workers: usize,

    /// 애플리케이션 페이로드 zlib 압축 (양쪽 설정이 같아야 연결됨)
    pub compression: bool,

    /// 이 크기 이상의 페이로드만 압축 시도 (바이트)
    pub compression_threshold: usize,

    /// 전달 실패 큐 크기 (가득 차면 이후 보고는 경고 로그만 남김)
    pub failure_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_timeout_base_ms: 200,       // 200ms
            retry_backoff_factor: 2,
            retry_timeout_max_ms: 3200,       // 3.2초
            max_retries: 5,
            heartbeat_interval_ms: 1000,      // 1초
            connection_timeout_ms: 5000,      // 5초
            sweep_interval_ms: 20,
            handshake_timeout_ms: 5000,
            strict_ordering: false,
            reorder_buffer_limit: 64,
            receive_window: 1024,
            max_connections: 50,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            app_version: DEFAULT_APP_VERSION.to_string(),
            server_name: None,
            dispatch_workers: 0,
            compression: false,
            compression_threshold: 128,
            failure_queue_capacity: 1024,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// n번째 재전송 대기 시간: base × factor^n, 상한 적용
    pub fn retry_timeout(&self, retry_count: u32) -> Duration {
        let factor = u64::from(self.retry_backoff_factor.max(1));
        let multiplier = factor.saturating_pow(retry_count);
        let ms = self
            .retry_timeout_base_ms
            .saturating_mul(multiplier)
            .min(self.retry_timeout_max_ms.max(self.retry_timeout_base_ms));
        Duration::from_millis(ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// 설정 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.receive_window == 0 || self.receive_window >= HALF_RANGE {
            return Err(Error::InvalidConfig(format!(
                "receive_window는 1..{} 범위여야 함: {}",
                HALF_RANGE, self.receive_window
            )));
        }
        if self.strict_ordering && self.reorder_buffer_limit == 0 {
            return Err(Error::InvalidConfig(
                "strict_ordering 사용 시 reorder_buffer_limit > 0 필요".into(),
            ));
        }
        if self.failure_queue_capacity == 0 {
            return Err(Error::InvalidConfig("failure_queue_capacity는 0일 수 없음".into()));
        }
        if self.retry_timeout_base_ms == 0 {
            return Err(Error::InvalidConfig("retry_timeout_base_ms는 0일 수 없음".into()));
        }
        if self.heartbeat_interval_ms >= self.connection_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "heartbeat 간격({}ms)은 연결 타임아웃({}ms)보다 짧아야 함",
                self.heartbeat_interval_ms, self.connection_timeout_ms
            )));
        }
        if self.max_datagram_size <= crate::HEADER_SIZE || self.max_datagram_size > MAX_DATAGRAM_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_datagram_size는 {}..={} 범위여야 함: {}",
                crate::HEADER_SIZE + 1,
                MAX_DATAGRAM_SIZE,
                self.max_datagram_size
            )));
        }
        Ok(())
    }

    /// 데이터그램 하나에 실을 수 있는 최대 페이로드
    pub fn max_payload_size(&self) -> usize {
        self.max_datagram_size.saturating_sub(crate::HEADER_SIZE)
    }

    /// LAN용 설정 (짧은 재전송/타임아웃)
    pub fn lan() -> Self {
        Self {
            retry_timeout_base_ms: 50,
            retry_timeout_max_ms: 800,
            max_retries: 6,
            heartbeat_interval_ms: 500,
            connection_timeout_ms: 3000,
            sweep_interval_ms: 10,
            handshake_timeout_ms: 2000,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            retry_timeout_base_ms: 300,
            retry_timeout_max_ms: 6000,
            max_retries: 10,
            heartbeat_interval_ms: 1500,
            connection_timeout_ms: 15000,
            sweep_interval_ms: 30,
            handshake_timeout_ms: 10000,
            reorder_buffer_limit: 256,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_timeout_backoff_is_capped() {
        let config = Config {
            retry_timeout_base_ms: 100,
            retry_backoff_factor: 2,
            retry_timeout_max_ms: 1000,
            ..Config::default()
        };

        assert_eq!(config.retry_timeout(0), Duration::from_millis(100));
        assert_eq!(config.retry_timeout(1), Duration::from_millis(200));
        assert_eq!(config.retry_timeout(3), Duration::from_millis(800));
        assert_eq!(config.retry_timeout(4), Duration::from_millis(1000));
        // 오버플로우 없이 상한 유지
        assert_eq!(config.retry_timeout(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::lan().validate().is_ok());
        assert!(Config::unstable_network().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_window() {
        let config = Config {
            receive_window: HALF_RANGE,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = Config {
            heartbeat_interval_ms: 5000,
            connection_timeout_ms: 5000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
