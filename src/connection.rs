//! 연결 상태
//!
//! 연결 하나의 시퀀스 카운터, 미확인 송신 목록, 수신 윈도우, 생존 시간.
//! 소유자는 세션 테이블(서버) 또는 클라이언트이며, 신뢰성 엔진은
//! `&mut Connection`으로만 접근한다.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::message::{Message, MessageTag};
use crate::sequence::{ReceiveWindow, Sequence};

/// 여러 태스크가 공유하는 연결 핸들
pub type SharedConnection = Arc<Mutex<Connection>>;

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// 종료 (되돌릴 수 없음)
    Disconnected,
}

/// 확인 대기 중인 신뢰성 송신
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub tag: MessageTag,
    pub payload: Bytes,

    /// 마지막 (재)전송 시간
    pub send_time: Instant,

    /// 최초 전송 시간
    pub first_sent: Instant,

    pub retry_count: u32,
}

/// 전달 실패 뒤 새 송신 floor를 다시 알리는 일정
///
/// floor는 heartbeat로 전해지며 신뢰성 메시지와 같은 백오프로 반복된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FloorNotice {
    pub remaining: u32,
    pub attempt: u32,
    pub next_at: Instant,
}

/// 피어 정보 (콜백/조회용 스냅샷)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub client_id: u64,
}

/// 연결 하나의 상태
#[derive(Debug)]
pub struct Connection {
    pub peer_addr: SocketAddr,
    pub client_id: u64,
    state: ConnectionState,

    /// 다음 송신 시퀀스
    pub(crate) outgoing_seq: Sequence,

    /// 상대 신뢰성 메시지 수신 이력
    pub(crate) window: ReceiveWindow,

    /// 확인 대기 중인 송신 (시퀀스 순)
    pub(crate) pending_sends: BTreeMap<Sequence, PendingSend>,

    /// 순서 보장 모드에서 빈틈을 기다리는 메시지
    pub(crate) reorder_buffer: HashMap<Sequence, Message>,

    /// 남은 floor 재공지
    pub(crate) floor_notice: Option<FloorNotice>,

    /// 마지막 수신 시간
    pub last_seen: Instant,

    /// 마지막 송신 시간 (heartbeat 판단용)
    pub last_sent: Instant,

    pub created_at: Instant,
}

impl Connection {
    /// Connecting 상태의 새 연결
    pub fn new(peer_addr: SocketAddr, client_id: u64, receive_window: u16, now: Instant) -> Self {
        Self {
            peer_addr,
            client_id,
            state: ConnectionState::Connecting,
            outgoing_seq: 0,
            window: ReceiveWindow::new(receive_window),
            pending_sends: BTreeMap::new(),
            reorder_buffer: HashMap::new(),
            floor_notice: None,
            last_seen: now,
            last_sent: now,
            created_at: now,
        }
    }

    pub fn into_shared(self) -> SharedConnection {
        Arc::new(Mutex::new(self))
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn peer(&self) -> PeerInfo {
        PeerInfo {
            addr: self.peer_addr,
            client_id: self.client_id,
        }
    }

    /// Connecting → Connected. 다른 상태에서는 false
    pub fn establish(&mut self) -> bool {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    /// 종료 상태로 전이. 처음 종료될 때만 true
    ///
    /// 미확인 송신과 reorder 버퍼는 재전송 없이 폐기된다.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Disconnected {
            return false;
        }
        self.state = ConnectionState::Disconnected;
        self.pending_sends.clear();
        self.reorder_buffer.clear();
        self.floor_notice = None;
        true
    }

    /// 수신 시 생존 시간 갱신
    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    /// 마지막 수신 이후 경과 시간
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// 송신 없이 heartbeat 간격이 지났는지
    pub fn needs_heartbeat(&self, now: Instant, interval: Duration) -> bool {
        self.is_connected() && now.saturating_duration_since(self.last_sent) >= interval
    }

    /// 다음에 할당될 송신 시퀀스
    pub fn outgoing_seq(&self) -> Sequence {
        self.outgoing_seq
    }

    /// 연속으로 받아들인 가장 높은 수신 시퀀스
    pub fn incoming_seq(&self) -> Option<Sequence> {
        self.window.incoming_seq()
    }

    /// 가장 오래된 미확인 송신 시퀀스 (없으면 다음 송신 시퀀스)
    ///
    /// 이보다 앞선 시퀀스는 확인되었거나 실패로 보고되어 다시 보내지 않는다.
    pub fn send_floor(&self) -> Sequence {
        // outgoing_seq 이상의 키는 wrap 이전에 보낸 것이라 더 오래됨
        self.pending_sends
            .range(self.outgoing_seq..)
            .next()
            .or_else(|| self.pending_sends.iter().next())
            .map_or(self.outgoing_seq, |(&sequence, _)| sequence)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_sends.len()
    }

    pub fn is_pending(&self, sequence: Sequence) -> bool {
        self.pending_sends.contains_key(&sequence)
    }

    pub fn pending(&self, sequence: Sequence) -> Option<&PendingSend> {
        self.pending_sends.get(&sequence)
    }

    pub fn buffered_count(&self) -> usize {
        self.reorder_buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_state_machine_transitions() {
        let now = Instant::now();
        let mut conn = Connection::new(addr(), 7, 64, now);
        assert_eq!(conn.state(), ConnectionState::Connecting);

        assert!(conn.establish());
        assert!(conn.is_connected());
        assert!(!conn.establish());

        assert!(conn.close());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        // 종료는 한 번만
        assert!(!conn.close());
        assert!(!conn.establish());
    }

    #[test]
    fn test_connecting_can_be_discarded() {
        let mut conn = Connection::new(addr(), 1, 64, Instant::now());
        assert!(conn.close());
        assert!(!conn.establish());
    }

    fn pending(now: Instant) -> PendingSend {
        PendingSend {
            tag: MessageTag::saturating(0),
            payload: Bytes::new(),
            send_time: now,
            first_sent: now,
            retry_count: 0,
        }
    }

    #[test]
    fn test_send_floor_tracks_oldest_pending() {
        let now = Instant::now();
        let mut conn = Connection::new(addr(), 1, 64, now);
        assert_eq!(conn.send_floor(), 0);

        conn.outgoing_seq = 10;
        assert_eq!(conn.send_floor(), 10);

        conn.pending_sends.insert(4, pending(now));
        conn.pending_sends.insert(7, pending(now));
        assert_eq!(conn.send_floor(), 4);

        conn.pending_sends.remove(&4);
        assert_eq!(conn.send_floor(), 7);
    }

    #[test]
    fn test_send_floor_across_wrap() {
        let now = Instant::now();
        let mut conn = Connection::new(addr(), 1, 64, now);
        conn.outgoing_seq = 3;
        for seq in [65534u16, 65535, 0, 1, 2] {
            conn.pending_sends.insert(seq, pending(now));
        }
        assert_eq!(conn.send_floor(), 65534);

        conn.pending_sends.remove(&65534);
        conn.pending_sends.remove(&65535);
        assert_eq!(conn.send_floor(), 0);
    }

    #[test]
    fn test_liveness_and_heartbeat_timing() {
        let now = Instant::now();
        let mut conn = Connection::new(addr(), 1, 64, now);
        conn.establish();

        let later = now + Duration::from_millis(300);
        assert_eq!(conn.idle_for(later), Duration::from_millis(300));
        assert!(conn.needs_heartbeat(later, Duration::from_millis(250)));
        assert!(!conn.needs_heartbeat(later, Duration::from_millis(500)));

        conn.touch(later);
        assert_eq!(conn.idle_for(later), Duration::ZERO);
    }
}
