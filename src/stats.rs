//! 트래픽 통계
//!
//! 엔드포인트의 모든 태스크가 공유하는 원자 카운터와 그 스냅샷.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 엔드포인트 트래픽 카운터
#[derive(Debug)]
pub struct TrafficStats {
    start_time: Instant,

    datagrams_sent: AtomicU64,
    bytes_sent: AtomicU64,
    datagrams_received: AtomicU64,
    bytes_received: AtomicU64,

    /// 재전송 횟수
    retransmissions: AtomicU64,

    /// 중복 수신 (페이로드 폐기)
    duplicates: AtomicU64,

    /// 애플리케이션에 전달된 메시지
    delivered: AtomicU64,

    /// 최대 재시도 초과
    delivery_failures: AtomicU64,

    /// 디코딩 실패
    malformed: AtomicU64,

    /// 인터셉터가 버린 데이터그램
    intercepted: AtomicU64,
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            datagrams_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            intercepted: AtomicU64::new(0),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, count: usize) {
        self.delivered.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_intercepted(&self) {
        self.intercepted.fetch_add(1, Ordering::Relaxed);
    }

    /// 현재 값 스냅샷
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            elapsed: self.start_time.elapsed(),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            intercepted: self.intercepted.load(Ordering::Relaxed),
        }
    }
}

/// 통계 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub elapsed: Duration,
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
    pub duplicates: u64,
    pub delivered: u64,
    pub delivery_failures: u64,
    pub malformed: u64,
    pub intercepted: u64,
}

impl StatsSnapshot {
    /// 송신 처리율 (KiB/s)
    pub fn send_rate_kbps(&self) -> f64 {
        kib_per_sec(self.bytes_sent, self.elapsed)
    }

    /// 수신 처리율 (KiB/s)
    pub fn receive_rate_kbps(&self) -> f64 {
        kib_per_sec(self.bytes_received, self.elapsed)
    }

    /// 송신 데이터그램 중 재전송 비율
    pub fn retransmission_ratio(&self) -> f64 {
        if self.datagrams_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.datagrams_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} ({} B, {:.2} KiB/s) | Recv: {} ({} B, {:.2} KiB/s) | Delivered: {} | Retx: {} | Dup: {} | Failed: {} | Malformed: {}",
            self.elapsed.as_secs_f64(),
            self.datagrams_sent,
            self.bytes_sent,
            self.send_rate_kbps(),
            self.datagrams_received,
            self.bytes_received,
            self.receive_rate_kbps(),
            self.delivered,
            self.retransmissions,
            self.duplicates,
            self.delivery_failures,
            self.malformed,
        )
    }
}

fn kib_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 / 1024.0 / secs
}
