//! 콜백 디스패처
//!
//! 태그별 핸들러 테이블(48칸)은 빌더에서 채워지고 시작 이후에는 바뀌지 않는다.
//! 기본은 수신 루프에서 동기 호출, `dispatch_workers > 0`이면 rayon 풀에서 호출한다.
//! 핸들러 패닉은 잡아서 로그만 남긴다.
//!
//! 서버에 검증기가 있으면 핸들러 호출 전에 메시지를 판정한다. 부적합 판정을
//! 받은 메시지는 핸들러에 전달되지 않는다.

use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;

use crate::connection::PeerInfo;
use crate::logging::{LogContext, LogLevel, SharedSink};
use crate::message::{MessageTag, Verdict, TAG_COUNT};
use crate::sequence::Sequence;
use crate::Result;

/// 애플리케이션에 전달되는 메시지
#[derive(Debug, Clone)]
pub struct Delivery {
    pub peer: SocketAddr,
    pub client_id: u64,
    pub tag: MessageTag,
    pub sequence: Sequence,
    pub reliable: bool,
    pub payload: Bytes,
}

/// 연결 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// 상대가 Disconnect 알림을 보냄
    Remote,
    /// `connection_timeout` 동안 수신 없음
    Timeout,
    /// 로컬 엔드포인트 종료
    Shutdown,
    /// 로컬에서 해당 연결만 종료
    Local,
    /// 소켓 장애
    SocketError,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Remote => "remote",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::Local => "local",
            DisconnectReason::SocketError => "socket error",
        };
        f.write_str(text)
    }
}

pub type Handler = Arc<dyn Fn(&Delivery) + Send + Sync>;
pub type ConnectHook = Arc<dyn Fn(&PeerInfo) + Send + Sync>;
pub type DisconnectHook = Arc<dyn Fn(&PeerInfo, DisconnectReason) + Send + Sync>;
pub type Validator = Arc<dyn Fn(&Delivery) -> bool + Send + Sync>;
pub type VerdictHook = Arc<dyn Fn(&PeerInfo, &Verdict) + Send + Sync>;

/// 시작 전 핸들러 등록 테이블
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Option<Handler>>,
    on_connect: Option<ConnectHook>,
    on_disconnect: Option<DisconnectHook>,
    validator: Option<Validator>,
    on_verdict: Option<VerdictHook>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: vec![None; TAG_COUNT],
            on_connect: None,
            on_disconnect: None,
            validator: None,
            on_verdict: None,
        }
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 태그 핸들러 등록 (같은 태그는 덮어씀)
    pub fn register<F>(&mut self, tag: MessageTag, handler: F)
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        self.handlers[tag.index()] = Some(Arc::new(handler));
    }

    pub fn set_on_connect<F>(&mut self, hook: F)
    where
        F: Fn(&PeerInfo) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
    }

    pub fn set_on_disconnect<F>(&mut self, hook: F)
    where
        F: Fn(&PeerInfo, DisconnectReason) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(hook));
    }

    /// 핸들러 호출 전 판정 (true = 적합)
    pub fn set_validator<F>(&mut self, validator: F)
    where
        F: Fn(&Delivery) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
    }

    pub fn set_on_verdict<F>(&mut self, hook: F)
    where
        F: Fn(&PeerInfo, &Verdict) + Send + Sync + 'static,
    {
        self.on_verdict = Some(Arc::new(hook));
    }

    pub fn is_registered(&self, tag: MessageTag) -> bool {
        self.handlers[tag.index()].is_some()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<usize> = self
            .handlers
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.as_ref().map(|_| i))
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("tags", &tags)
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("validator", &self.validator.is_some())
            .field("on_verdict", &self.on_verdict.is_some())
            .finish()
    }
}

/// 고정된 핸들러 테이블로 메시지/이벤트를 전달
pub struct Dispatcher {
    registry: HandlerRegistry,
    pool: Option<rayon::ThreadPool>,
    sink: SharedSink,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, workers: usize, sink: SharedSink) -> Result<Self> {
        let pool = if workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|i| format!("rdl-dispatch-{}", i))
                    .build()?,
            )
        } else {
            None
        };

        Ok(Self { registry, pool, sink })
    }

    /// 메시지 전달. 핸들러가 없으면 false (메시지는 버려짐)
    pub fn dispatch(&self, delivery: Delivery) -> bool {
        let handler = match &self.registry.handlers[delivery.tag.index()] {
            Some(handler) => handler.clone(),
            None => {
                self.sink.emit(
                    LogLevel::Debug,
                    &format!("핸들러 없는 태그 {}, 메시지 폐기", delivery.tag),
                    &LogContext::peer(delivery.peer)
                        .with_client(delivery.client_id)
                        .with_sequence(delivery.sequence),
                );
                return false;
            }
        };

        match &self.pool {
            Some(pool) => {
                let sink = self.sink.clone();
                pool.spawn(move || invoke(&handler, &delivery, &sink));
            }
            None => invoke(&handler, &delivery, &self.sink),
        }
        true
    }

    /// 검증기 판정. 검증기가 없으면 None
    ///
    /// 검증기가 패닉하면 부적합으로 본다.
    pub fn judge(&self, delivery: &Delivery) -> Option<bool> {
        let validator = self.registry.validator.as_ref()?;
        match catch_unwind(AssertUnwindSafe(|| validator(delivery))) {
            Ok(legal) => Some(legal),
            Err(_) => {
                self.sink.emit(
                    LogLevel::Error,
                    &format!("태그 {} 검증기 패닉, 부적합 처리", delivery.tag),
                    &LogContext::peer(delivery.peer)
                        .with_client(delivery.client_id)
                        .with_sequence(delivery.sequence),
                );
                Some(false)
            }
        }
    }

    pub fn verdict(&self, peer: &PeerInfo, verdict: &Verdict) {
        if let Some(hook) = &self.registry.on_verdict {
            self.guard(peer, "on_verdict", || hook(peer, verdict));
        }
    }

    pub fn connected(&self, peer: &PeerInfo) {
        if let Some(hook) = &self.registry.on_connect {
            self.guard(peer, "on_connect", || hook(peer));
        }
    }

    pub fn disconnected(&self, peer: &PeerInfo, reason: DisconnectReason) {
        if let Some(hook) = &self.registry.on_disconnect {
            self.guard(peer, "on_disconnect", || hook(peer, reason));
        }
    }

    fn guard(&self, peer: &PeerInfo, name: &str, call: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(call)).is_err() {
            self.sink.emit(
                LogLevel::Error,
                &format!("{} 콜백 패닉", name),
                &LogContext::peer(peer.addr).with_client(peer.client_id),
            );
        }
    }
}

fn invoke(handler: &Handler, delivery: &Delivery, sink: &SharedSink) {
    if catch_unwind(AssertUnwindSafe(|| handler(delivery))).is_err() {
        sink.emit(
            LogLevel::Error,
            &format!("태그 {} 핸들러 패닉", delivery.tag),
            &LogContext::peer(delivery.peer)
                .with_client(delivery.client_id)
                .with_sequence(delivery.sequence),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::logging::MemorySink;

    fn delivery(tag: u8) -> Delivery {
        Delivery {
            peer: "127.0.0.1:6000".parse().unwrap(),
            client_id: 1,
            tag: MessageTag::saturating(tag),
            sequence: 0,
            reliable: true,
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn test_dispatch_routes_by_tag() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = hits.clone();
        registry.register(MessageTag::saturating(5), move |d| {
            assert_eq!(d.payload, Bytes::from_static(b"payload"));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let sink = Arc::new(MemorySink::new());
        let dispatcher = Dispatcher::new(registry, 0, sink.clone()).unwrap();

        assert!(dispatcher.dispatch(delivery(5)));
        assert!(!dispatcher.dispatch(delivery(6)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(LogLevel::Debug, "핸들러 없는 태그"), 1);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let mut registry = HandlerRegistry::new();
        registry.register(MessageTag::saturating(0), |_| panic!("boom"));
        registry.set_on_connect(|_| panic!("boom"));

        let sink = Arc::new(MemorySink::new());
        let dispatcher = Dispatcher::new(registry, 0, sink.clone()).unwrap();

        assert!(dispatcher.dispatch(delivery(0)));
        dispatcher.connected(&PeerInfo {
            addr: "127.0.0.1:1".parse().unwrap(),
            client_id: 2,
        });
        assert_eq!(sink.count(LogLevel::Error, "패닉"), 2);
    }

    #[test]
    fn test_lifecycle_hooks() {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        let log = events.clone();
        registry.set_on_disconnect(move |peer, reason| log.lock().push((peer.client_id, reason)));

        let dispatcher = Dispatcher::new(registry, 0, Arc::new(MemorySink::new())).unwrap();
        let peer = PeerInfo {
            addr: "127.0.0.1:1".parse().unwrap(),
            client_id: 4,
        };
        dispatcher.connected(&peer);
        dispatcher.disconnected(&peer, DisconnectReason::Timeout);

        assert_eq!(*events.lock(), vec![(4, DisconnectReason::Timeout)]);
    }

    #[test]
    fn test_validator_judges_and_contains_panic() {
        let mut registry = HandlerRegistry::new();
        registry.set_validator(|d| match d.payload.as_ref() {
            b"boom" => panic!("validator"),
            payload => payload != b"cheat",
        });

        let sink = Arc::new(MemorySink::new());
        let dispatcher = Dispatcher::new(registry, 0, sink.clone()).unwrap();

        assert_eq!(dispatcher.judge(&delivery(0)), Some(true));

        let mut cheat = delivery(0);
        cheat.payload = Bytes::from_static(b"cheat");
        assert_eq!(dispatcher.judge(&cheat), Some(false));

        let mut boom = delivery(0);
        boom.payload = Bytes::from_static(b"boom");
        assert_eq!(dispatcher.judge(&boom), Some(false));
        assert_eq!(sink.count(LogLevel::Error, "검증기 패닉"), 1);

        let plain = Dispatcher::new(HandlerRegistry::new(), 0, sink).unwrap();
        assert_eq!(plain.judge(&delivery(0)), None);
    }

    #[test]
    fn test_verdict_hook() {
        let verdicts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        let log = verdicts.clone();
        registry.set_on_verdict(move |_, verdict| log.lock().push(*verdict));

        let dispatcher = Dispatcher::new(registry, 0, Arc::new(MemorySink::new())).unwrap();
        let peer = PeerInfo {
            addr: "127.0.0.1:1".parse().unwrap(),
            client_id: 4,
        };
        dispatcher.verdict(&peer, &Verdict { sequence: 3, legal: false });

        assert_eq!(*verdicts.lock(), vec![Verdict { sequence: 3, legal: false }]);
    }

    #[test]
    fn test_worker_pool_dispatch() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut registry = HandlerRegistry::new();
        registry.register(MessageTag::saturating(1), move |d| {
            let _ = tx.send(d.sequence);
        });

        let dispatcher = Dispatcher::new(registry, 2, Arc::new(MemorySink::new())).unwrap();
        for seq in 0..10u16 {
            let mut d = delivery(1);
            d.sequence = seq;
            dispatcher.dispatch(d);
        }

        let mut got: Vec<u16> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }
}
