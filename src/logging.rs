//! 로그 싱크
//!
//! 라이브러리는 전역 로거 대신 엔드포인트마다 주입된 `LogSink`로만 기록한다.
//! 기본 구현 `TracingSink`는 `tracing` 이벤트로 전달한다.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::sequence::Sequence;

/// 로그 레벨
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(text)
    }
}

/// 로그 레코드에 붙는 구조화 필드
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogContext {
    pub peer: Option<SocketAddr>,
    pub client_id: Option<u64>,
    pub sequence: Option<Sequence>,
}

impl LogContext {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn peer(peer: SocketAddr) -> Self {
        Self {
            peer: Some(peer),
            ..Self::default()
        }
    }

    pub fn with_client(mut self, client_id: u64) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// 로그 출력 대상
pub trait LogSink: Send + Sync {
    fn emit(&self, level: LogLevel, message: &str, context: &LogContext);
}

/// 엔드포인트가 공유하는 싱크 핸들
pub type SharedSink = Arc<dyn LogSink>;

impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    fn emit(&self, level: LogLevel, message: &str, context: &LogContext) {
        (**self).emit(level, message, context);
    }
}

/// `tracing`으로 전달하는 기본 싱크
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, level: LogLevel, message: &str, context: &LogContext) {
        let peer = context.peer.map(|addr| addr.to_string());
        let peer = peer.as_deref().unwrap_or("-");
        match level {
            LogLevel::Trace => trace!(peer, client_id = ?context.client_id, sequence = ?context.sequence, "{}", message),
            LogLevel::Debug => debug!(peer, client_id = ?context.client_id, sequence = ?context.sequence, "{}", message),
            LogLevel::Info => info!(peer, client_id = ?context.client_id, sequence = ?context.sequence, "{}", message),
            LogLevel::Warn => warn!(peer, client_id = ?context.client_id, sequence = ?context.sequence, "{}", message),
            LogLevel::Error => error!(peer, client_id = ?context.client_id, sequence = ?context.sequence, "{}", message),
        }
    }
}

/// 메모리에 보관된 로그 레코드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub context: LogContext,
}

/// 레코드를 메모리에 모으는 싱크 (테스트/진단용)
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// 해당 레벨 이상이며 `needle`을 포함하는 레코드 수
    pub fn count(&self, min_level: LogLevel, needle: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|record| record.level >= min_level && record.message.contains(needle))
            .count()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, level: LogLevel, message: &str, context: &LogContext) {
        self.records.lock().push(LogRecord {
            level,
            message: message.to_string(),
            context: *context,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let context = LogContext::peer(addr).with_client(7).with_sequence(42);

        assert_eq!(context.peer, Some(addr));
        assert_eq!(context.client_id, Some(7));
        assert_eq!(context.sequence, Some(42));
        assert_eq!(LogContext::none(), LogContext::default());
    }

    #[test]
    fn test_memory_sink_filters_by_level() {
        let sink = MemorySink::new();
        sink.emit(LogLevel::Debug, "duplicate dropped", &LogContext::none());
        sink.emit(LogLevel::Warn, "delivery failed", &LogContext::none());
        sink.emit(LogLevel::Error, "delivery failed twice", &LogContext::none());

        assert_eq!(sink.records().len(), 3);
        assert_eq!(sink.count(LogLevel::Warn, "delivery"), 2);
        assert_eq!(sink.count(LogLevel::Trace, "duplicate"), 1);
        assert!(LogLevel::Error > LogLevel::Info);
    }

    #[test]
    fn test_tracing_sink_without_subscriber() {
        // 구독자가 없어도 패닉 없이 동작
        TracingSink.emit(LogLevel::Info, "hello", &LogContext::none());
    }
}
