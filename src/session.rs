//! 서버 세션 테이블
//!
//! 주소별 연결을 `DashMap`에 보관한다. 각 연결은 자체 mutex로 보호되며
//! 테이블 락을 잡은 채 연결 락을 오래 유지하지 않는다.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::connection::{Connection, PeerInfo, SharedConnection};
use crate::message::{HandshakeRequest, RejectReason};
use crate::Config;

/// 핸드쉐이크 요청 처리 결과
#[derive(Debug)]
pub enum Admission {
    /// 새 연결 등록 (Connected)
    Accepted(SharedConnection),

    /// 같은 클라이언트의 재요청 (accept 유실), accept만 다시 보낸다
    Existing(SharedConnection),

    /// 거부, 아무 것도 생성하지 않음
    Rejected(RejectReason),
}

/// 주소 → 연결 테이블
pub struct SessionTable {
    sessions: DashMap<SocketAddr, SharedConnection>,
    max_connections: usize,
    receive_window: u16,
    app_version: String,
    compression: bool,
}

impl SessionTable {
    pub fn new(config: &Config) -> Self {
        Self {
            sessions: DashMap::new(),
            max_connections: config.max_connections,
            receive_window: config.receive_window,
            app_version: config.app_version.clone(),
            compression: config.compression,
        }
    }

    /// 핸드쉐이크 요청 심사 및 등록
    ///
    /// 수신 루프 하나에서만 호출된다.
    pub fn admit(&self, peer: SocketAddr, request: &HandshakeRequest, now: Instant) -> Admission {
        if request.app_version != self.app_version {
            return Admission::Rejected(RejectReason::VersionMismatch);
        }
        if request.compression != self.compression {
            return Admission::Rejected(RejectReason::CompressionMismatch);
        }

        if let Some(existing) = self.get(&peer) {
            let same_client = existing.lock().client_id == request.client_id;
            return if same_client {
                Admission::Existing(existing)
            } else {
                Admission::Rejected(RejectReason::AddressInUse)
            };
        }

        if self.sessions.len() >= self.max_connections {
            return Admission::Rejected(RejectReason::ServerFull);
        }

        let mut connection = Connection::new(peer, request.client_id, self.receive_window, now);
        connection.establish();
        let shared = connection.into_shared();
        self.sessions.insert(peer, shared.clone());
        Admission::Accepted(shared)
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<SharedConnection> {
        self.sessions.get(peer).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.sessions.contains_key(peer)
    }

    /// 연결 제거 및 종료
    ///
    /// 실제로 제거하고 처음 종료시킨 호출만 `Some`을 받는다.
    /// 호출자는 연결 락을 잡지 않은 상태여야 한다.
    pub fn remove(&self, peer: &SocketAddr) -> Option<PeerInfo> {
        let (_, connection) = self.sessions.remove(peer)?;
        let mut guard = connection.lock();
        guard.close().then(|| guard.peer())
    }

    /// 모든 연결 제거 (종료 시)
    pub fn drain(&self) -> Vec<PeerInfo> {
        let addrs: Vec<SocketAddr> = self.sessions.iter().map(|entry| *entry.key()).collect();
        addrs.iter().filter_map(|addr| self.remove(addr)).collect()
    }

    /// `timeout` 이상 수신이 없는 연결 주소
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().lock().idle_for(now) > timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    /// 연결 목록 스냅샷 (타이머/브로드캐스트용)
    pub fn connections(&self) -> Vec<SharedConnection> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.sessions.iter().map(|entry| entry.value().lock().peer()).collect()
    }

    pub fn find_by_client_id(&self, client_id: u64) -> Option<SharedConnection> {
        self.sessions
            .iter()
            .find(|entry| entry.value().lock().client_id == client_id)
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn request(client_id: u64) -> HandshakeRequest {
        HandshakeRequest {
            client_id,
            app_version: crate::DEFAULT_APP_VERSION.into(),
            compression: false,
        }
    }

    fn table(max_connections: usize) -> SessionTable {
        SessionTable::new(&Config {
            max_connections,
            ..Config::default()
        })
    }

    #[test]
    fn test_admit_creates_connected_session() {
        let table = table(4);
        let now = Instant::now();

        match table.admit(addr(1000), &request(9), now) {
            Admission::Accepted(conn) => {
                let conn = conn.lock();
                assert!(conn.is_connected());
                assert_eq!(conn.client_id, 9);
            }
            other => panic!("accept 기대: {:?}", other),
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.peers(), vec![PeerInfo { addr: addr(1000), client_id: 9 }]);
    }

    #[test]
    fn test_repeated_request_reuses_session() {
        let table = table(4);
        let now = Instant::now();
        table.admit(addr(1000), &request(9), now);

        assert!(matches!(table.admit(addr(1000), &request(9), now), Admission::Existing(_)));
        assert!(matches!(
            table.admit(addr(1000), &request(10), now),
            Admission::Rejected(RejectReason::AddressInUse)
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rejects_version_mismatch_and_full() {
        let table = table(1);
        let now = Instant::now();

        let old = HandshakeRequest {
            client_id: 1,
            app_version: "0.9".into(),
            compression: false,
        };
        assert!(matches!(
            table.admit(addr(1000), &old, now),
            Admission::Rejected(RejectReason::VersionMismatch)
        ));
        assert!(table.is_empty());

        table.admit(addr(1000), &request(1), now);
        assert!(matches!(
            table.admit(addr(1001), &request(2), now),
            Admission::Rejected(RejectReason::ServerFull)
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rejects_compression_mismatch() {
        let table = table(4);
        let compressed = HandshakeRequest {
            compression: true,
            ..request(3)
        };
        assert!(matches!(
            table.admit(addr(1000), &compressed, Instant::now()),
            Admission::Rejected(RejectReason::CompressionMismatch)
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_reports_once() {
        let table = table(4);
        let now = Instant::now();
        table.admit(addr(1000), &request(3), now);

        let removed = table.remove(&addr(1000)).unwrap();
        assert_eq!(removed.client_id, 3);
        assert!(table.remove(&addr(1000)).is_none());
        assert!(!table.contains(&addr(1000)));
    }

    #[test]
    fn test_expired_and_lookup() {
        let table = table(4);
        let now = Instant::now();
        table.admit(addr(1000), &request(1), now);
        table.admit(addr(1001), &request(2), now);

        let later = now + Duration::from_secs(3);
        table.get(&addr(1001)).unwrap().lock().touch(later);

        let expired = table.expired(later, Duration::from_secs(2));
        assert_eq!(expired, vec![addr(1000)]);

        let found = table.find_by_client_id(2).unwrap();
        assert_eq!(found.lock().peer_addr, addr(1001));

        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
    }
}
