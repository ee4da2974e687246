//! 엔드포인트 공통 코어
//!
//! 클라이언트와 서버가 공유하는 소켓 송수신, 신뢰성 처리, 디스패치,
//! 장애/종료 신호. 연결 mutex는 `.await` 전에 항상 해제한다.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::codec;
use crate::compression;
use crate::connection::{PeerInfo, SharedConnection};
use crate::dispatcher::{Delivery, DisconnectReason, Dispatcher};
use crate::interceptor::SharedInterceptor;
use crate::logging::{LogContext, LogLevel, SharedSink};
use crate::message::{ControlPayload, Message, MessageTag, MessageType, Verdict};
use crate::reliability::{ReceiveOutcome, ReliabilityEngine};
use crate::sequence::Sequence;
use crate::stats::TrafficStats;
use crate::{Config, Error, Result};

/// 최대 재시도를 넘겨 전달에 실패한 신뢰성 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub peer: SocketAddr,
    pub client_id: u64,
    pub sequence: Sequence,
    pub tag: MessageTag,
    pub payload: Bytes,
    /// 최초 전송 포함 총 전송 횟수
    pub attempts: u32,
}

/// ICMP port unreachable 등으로 인한 일시적 에러
pub(crate) fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

pub(crate) struct EndpointCore {
    pub socket: UdpSocket,
    pub local_addr: SocketAddr,
    pub config: Config,
    pub engine: ReliabilityEngine,
    pub dispatcher: Dispatcher,
    pub sink: SharedSink,
    pub interceptor: SharedInterceptor,
    pub stats: TrafficStats,
    failures_tx: Sender<DeliveryFailure>,
    failures_rx: Receiver<DeliveryFailure>,
    running: AtomicBool,
    fault: Mutex<Option<String>>,
    shutdown_tx: watch::Sender<bool>,
}

impl EndpointCore {
    pub fn new(
        socket: UdpSocket,
        config: Config,
        dispatcher: Dispatcher,
        sink: SharedSink,
        interceptor: SharedInterceptor,
    ) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        let (failures_tx, failures_rx) = crossbeam_channel::bounded(config.failure_queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            socket,
            local_addr,
            engine: ReliabilityEngine::new(config.clone()),
            config,
            dispatcher,
            sink,
            interceptor,
            stats: TrafficStats::new(),
            failures_tx,
            failures_rx,
            running: AtomicBool::new(true),
            fault: Mutex::new(None),
            shutdown_tx,
        })
    }

    pub fn log(&self, level: LogLevel, message: &str, context: LogContext) {
        self.sink.emit(level, message, &context);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// 새 API 호출 가능 여부
    pub fn ensure_running(&self) -> Result<()> {
        if let Some(reason) = self.fault() {
            return Err(Error::EndpointFailed(reason));
        }
        if !self.is_running() {
            return Err(Error::EndpointClosed);
        }
        Ok(())
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// 태스크 종료 신호. 처음 호출일 때만 true
    pub fn signal_shutdown(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
        was_running
    }

    /// 소켓 장애로 엔드포인트 중단
    pub fn fail(&self, reason: String) {
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(reason.clone());
            }
        }
        self.log(LogLevel::Error, &format!("소켓 장애, 엔드포인트 중단: {}", reason), LogContext::none());
        self.signal_shutdown();
    }

    pub fn failures(&self) -> Receiver<DeliveryFailure> {
        self.failures_rx.clone()
    }

    /// 실패 보고를 큐에 넣는다. 큐가 가득 차면 보고를 버리고 경고
    fn report_failure(&self, failure: DeliveryFailure) {
        let context = LogContext::peer(failure.peer)
            .with_client(failure.client_id)
            .with_sequence(failure.sequence);
        match self.failures_tx.try_send(failure) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.log(LogLevel::Warn, "전달 실패 큐가 가득 차 보고를 버림", context);
            }
        }
    }

    /// 데이터그램 송신 (인터셉터 적용)
    pub async fn transmit(&self, peer: SocketAddr, datagram: &[u8]) -> Result<()> {
        if !self.interceptor.on_send(peer, datagram) {
            self.stats.record_intercepted();
            return Ok(());
        }

        match self.socket.send_to(datagram, peer).await {
            Ok(_) => {
                self.stats.record_sent(datagram.len());
                Ok(())
            }
            Err(e) if is_transient(&e) => {
                self.log(
                    LogLevel::Debug,
                    &format!("일시적 송신 에러 무시: {}", e),
                    LogContext::peer(peer),
                );
                Ok(())
            }
            Err(e) => {
                let reason = format!("send_to {} 실패: {}", peer, e);
                self.fail(reason.clone());
                Err(Error::EndpointFailed(reason))
            }
        }
    }

    /// 연결 없이 보내는 컨트롤 메시지 (핸드쉐이크/거부/디스커버리)
    pub async fn send_unconnected<P: ControlPayload>(&self, peer: SocketAddr, body: &P) -> Result<()> {
        let datagram = codec::encode(&Message::control(body)?)?;
        self.transmit(peer, &datagram).await
    }

    /// 연결에 컨트롤 메시지 송신 (ack 피기백)
    pub async fn send_control<P: ControlPayload>(&self, conn: &SharedConnection, body: &P) -> Result<()> {
        let payload = body.to_payload()?;
        let (peer, datagram) = {
            let mut guard = conn.lock();
            let datagram = self
                .engine
                .control(&mut guard, P::MESSAGE_TYPE, payload, Instant::now())?;
            (guard.peer_addr, datagram)
        };
        self.transmit(peer, &datagram).await
    }

    /// 애플리케이션 메시지 송신
    pub async fn send_message(
        &self,
        conn: &SharedConnection,
        tag: MessageTag,
        payload: Bytes,
        reliable: bool,
    ) -> Result<Sequence> {
        self.ensure_running()?;

        let payload = if self.config.compression {
            compression::compress(&payload, self.config.compression_threshold)?
        } else {
            payload
        };

        let max = self.config.max_payload_size();
        if payload.len() > max {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let (peer, outgoing) = {
            let mut guard = conn.lock();
            if !guard.is_connected() {
                return Err(Error::NotConnected);
            }
            let outgoing = self
                .engine
                .send(&mut guard, tag, payload, reliable, Instant::now())?;
            (guard.peer_addr, outgoing)
        };

        self.transmit(peer, &outgoing.datagram).await?;
        Ok(outgoing.sequence)
    }

    /// 수신 데이터그램 전처리: 통계, 인터셉터, 디코딩
    ///
    /// 잘못된 데이터그램은 로그 후 `None`.
    pub fn accept_datagram(&self, peer: SocketAddr, bytes: &[u8]) -> Option<Message> {
        self.stats.record_received(bytes.len());

        if !self.interceptor.on_receive(peer, bytes) {
            self.stats.record_intercepted();
            return None;
        }

        match codec::decode(bytes) {
            Ok(message) => Some(message),
            Err(e) => {
                self.stats.record_malformed();
                self.log(
                    LogLevel::Debug,
                    &format!("잘못된 데이터그램 폐기: {}", e),
                    LogContext::peer(peer),
                );
                None
            }
        }
    }

    /// 연결된 피어의 메시지를 신뢰성 처리 후 디스패치
    pub async fn process(&self, conn: &SharedConnection, message: Message) -> Result<()> {
        let sequence = message.sequence;
        let verdict = (message.msg_type == MessageType::Verdict).then(|| message.parse::<Verdict>());
        let (info, inbound) = {
            let mut guard = conn.lock();
            let now = Instant::now();
            guard.touch(now);
            let inbound = self.engine.receive(&mut guard, message, now);
            (guard.peer(), inbound)
        };

        match inbound.outcome {
            ReceiveOutcome::Duplicate => {
                self.stats.record_duplicate();
                self.log(
                    LogLevel::Trace,
                    "중복 수신, 페이로드 폐기",
                    LogContext::peer(info.addr).with_client(info.client_id).with_sequence(sequence),
                );
            }
            ReceiveOutcome::Dropped => {
                self.log(
                    LogLevel::Debug,
                    "윈도우/버퍼 초과로 폐기",
                    LogContext::peer(info.addr).with_client(info.client_id).with_sequence(sequence),
                );
            }
            _ => {}
        }

        // ack 송신이 실패해도 이미 표시한 메시지는 전달한다
        let replied = match inbound.reply {
            Some(reply) => self.transmit(info.addr, &reply).await,
            None => Ok(()),
        };

        match verdict {
            Some(Ok(verdict)) => self.dispatcher.verdict(&info, &verdict),
            Some(Err(e)) => self.log(
                LogLevel::Debug,
                &format!("잘못된 판정 메시지: {}", e),
                LogContext::peer(info.addr).with_client(info.client_id),
            ),
            None => {}
        }

        self.stats.record_delivered(inbound.deliver.len());
        let mut verdicts = Vec::new();
        for message in inbound.deliver {
            let Some(tag) = message.msg_type.tag() else {
                continue;
            };
            let context = LogContext::peer(info.addr)
                .with_client(info.client_id)
                .with_sequence(message.sequence);

            let payload = if self.config.compression {
                match compression::decompress(&message.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        self.stats.record_malformed();
                        self.log(LogLevel::Debug, &format!("압축 해제 실패, 메시지 폐기: {}", e), context);
                        continue;
                    }
                }
            } else {
                message.payload
            };

            let delivery = Delivery {
                peer: info.addr,
                client_id: info.client_id,
                tag,
                sequence: message.sequence,
                reliable: message.reliable,
                payload,
            };

            if let Some(legal) = self.dispatcher.judge(&delivery) {
                if delivery.reliable {
                    verdicts.push(Verdict {
                        sequence: delivery.sequence,
                        legal,
                    });
                }
                if !legal {
                    self.log(LogLevel::Debug, "부적합 판정, 핸들러 호출 생략", context);
                    continue;
                }
            }
            self.dispatcher.dispatch(delivery);
        }

        for verdict in verdicts {
            self.send_control(conn, &verdict).await?;
        }
        replied
    }

    /// 재전송 검사와 heartbeat
    pub async fn sweep(&self, conn: &SharedConnection) -> Result<()> {
        let (info, sweep, heartbeat) = {
            let mut guard = conn.lock();
            if !guard.is_connected() {
                return Ok(());
            }
            let now = Instant::now();
            let sweep = self.engine.sweep(&mut guard, now);
            let heartbeat = self.engine.heartbeat(&mut guard, now);
            (guard.peer(), sweep, heartbeat)
        };

        for failed in sweep.failed {
            self.stats.record_failure();
            self.log(
                LogLevel::Warn,
                &format!("신뢰성 메시지 전달 실패 ({}회 전송)", failed.attempts),
                LogContext::peer(info.addr)
                    .with_client(info.client_id)
                    .with_sequence(failed.sequence),
            );
            self.report_failure(DeliveryFailure {
                peer: info.addr,
                client_id: info.client_id,
                sequence: failed.sequence,
                tag: failed.tag,
                payload: failed.payload,
                attempts: failed.attempts,
            });
        }

        for resend in sweep.resend {
            self.stats.record_retransmission();
            self.log(
                LogLevel::Trace,
                "재전송",
                LogContext::peer(info.addr)
                    .with_client(info.client_id)
                    .with_sequence(resend.sequence),
            );
            self.transmit(info.addr, &resend.datagram).await?;
        }

        if let Some(notice) = sweep.notice {
            self.transmit(info.addr, &notice).await?;
        }

        if let Some(heartbeat) = heartbeat {
            self.transmit(info.addr, &heartbeat).await?;
        }
        Ok(())
    }

    pub fn notify_disconnected(&self, peer: &PeerInfo, reason: DisconnectReason) {
        self.log(
            LogLevel::Info,
            &format!("Peer disconnected ({})", reason),
            LogContext::peer(peer.addr).with_client(peer.client_id),
        );
        self.dispatcher.disconnected(peer, reason);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::connection::Connection;
    use crate::dispatcher::HandlerRegistry;
    use crate::interceptor::{PassThrough, RandomLoss};
    use crate::logging::MemorySink;

    async fn core(interceptor: SharedInterceptor, sink: Arc<MemorySink>) -> EndpointCore {
        core_with(Config::default(), HandlerRegistry::new(), interceptor, sink).await
    }

    async fn core_with(
        config: Config,
        registry: HandlerRegistry,
        interceptor: SharedInterceptor,
        sink: Arc<MemorySink>,
    ) -> EndpointCore {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dispatcher = Dispatcher::new(registry, 0, sink.clone()).unwrap();
        EndpointCore::new(socket, config, dispatcher, sink, interceptor).unwrap()
    }

    fn reliable(tag: MessageTag, sequence: Sequence, payload: &'static [u8]) -> Message {
        Message {
            msg_type: MessageType::Application(tag),
            sequence,
            ack: None,
            reliable: true,
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_counted_and_dropped() {
        let sink = Arc::new(MemorySink::new());
        let core = core(Arc::new(PassThrough), sink.clone()).await;

        assert!(core.accept_datagram(core.local_addr, &[1, 2, 3]).is_none());
        let snap = core.stats.snapshot();
        assert_eq!(snap.malformed, 1);
        assert_eq!(snap.datagrams_received, 1);
        assert_eq!(sink.count(LogLevel::Debug, "잘못된 데이터그램"), 1);
    }

    #[tokio::test]
    async fn test_interceptor_drop_is_counted() {
        let sink = Arc::new(MemorySink::new());
        let core = core(Arc::new(RandomLoss::new(1.0, 0)), sink).await;

        core.transmit(core.local_addr, b"dropped").await.unwrap();
        let snap = core.stats.snapshot();
        assert_eq!(snap.intercepted, 1);
        assert_eq!(snap.datagrams_sent, 0);
    }

    #[tokio::test]
    async fn test_send_requires_connected_and_size_limit() {
        let sink = Arc::new(MemorySink::new());
        let core = core(Arc::new(PassThrough), sink).await;
        let conn = Connection::new(core.local_addr, 1, 64, Instant::now()).into_shared();
        let tag = MessageTag::saturating(0);

        let err = core.send_message(&conn, tag, Bytes::new(), true).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));

        conn.lock().establish();
        let too_big = Bytes::from(vec![0u8; core.config.max_payload_size() + 1]);
        let err = core.send_message(&conn, tag, too_big, true).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));

        assert_eq!(core.send_message(&conn, tag, Bytes::from_static(b"ok"), true).await.unwrap(), 0);
        assert_eq!(conn.lock().pending_count(), 1);
    }

    #[tokio::test]
    async fn test_delivery_survives_failed_ack_reply() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let tag = MessageTag::saturating(2);
        let mut registry = HandlerRegistry::new();
        registry.register(tag, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let sink = Arc::new(MemorySink::new());
        let core = core_with(Config::default(), registry, Arc::new(PassThrough), sink).await;

        // IPv4 소켓은 IPv6 주소로 보낼 수 없어 ack 송신이 실패한다
        let conn = Connection::new("[::1]:9".parse().unwrap(), 1, 64, Instant::now()).into_shared();
        conn.lock().establish();

        assert!(core.process(&conn, reliable(tag, 0, b"x")).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(conn.lock().incoming_seq(), Some(0));
    }

    #[tokio::test]
    async fn test_failure_queue_is_bounded() {
        let sink = Arc::new(MemorySink::new());
        let config = Config {
            max_retries: 0,
            retry_timeout_base_ms: 5,
            failure_queue_capacity: 2,
            ..Config::default()
        };
        let core = core_with(config, HandlerRegistry::new(), Arc::new(RandomLoss::new(1.0, 0)), sink.clone()).await;
        let conn = Connection::new(core.local_addr, 1, 64, Instant::now()).into_shared();
        conn.lock().establish();

        for _ in 0..3 {
            core.send_message(&conn, MessageTag::saturating(0), Bytes::new(), true)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        core.sweep(&conn).await.unwrap();

        assert_eq!(core.failures().len(), 2);
        assert_eq!(core.stats.snapshot().delivery_failures, 3);
        assert_eq!(sink.count(LogLevel::Warn, "큐가 가득"), 1);
    }

    #[tokio::test]
    async fn test_validator_verdicts_and_compression() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let tag = MessageTag::saturating(3);
        let mut registry = HandlerRegistry::new();
        registry.register(tag, move |d| {
            assert_eq!(d.payload, Bytes::from(vec![b'm'; 300]));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        registry.set_validator(|d| d.sequence != 1);

        let config = Config {
            compression: true,
            ..Config::default()
        };
        let sink = Arc::new(MemorySink::new());
        let core = core_with(config, registry, Arc::new(PassThrough), sink).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::new(peer.local_addr().unwrap(), 1, 64, Instant::now()).into_shared();
        conn.lock().establish();

        let framed = compression::compress(&[b'm'; 300], 16).unwrap();
        for sequence in 0..2u16 {
            let message = Message {
                payload: framed.clone(),
                ..reliable(tag, sequence, b"")
            };
            core.process(&conn, message).await.unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // ack 두 개와 판정 두 개
        let mut verdicts = Vec::new();
        let mut buf = [0u8; 2048];
        while verdicts.len() < 2 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let message = codec::decode(&buf[..len]).unwrap();
            if message.msg_type == MessageType::Verdict {
                verdicts.push(message.parse::<Verdict>().unwrap());
            }
        }
        assert_eq!(
            verdicts,
            vec![
                Verdict { sequence: 0, legal: true },
                Verdict { sequence: 1, legal: false },
            ]
        );

        // 압축 표시가 없는 페이로드는 폐기
        let garbage = Message {
            payload: Bytes::from_static(&[9, 9]),
            ..reliable(tag, 2, b"")
        };
        core.process(&conn, garbage).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(core.stats.snapshot().malformed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_blocks_new_sends() {
        let sink = Arc::new(MemorySink::new());
        let core = core(Arc::new(PassThrough), sink).await;
        let mut signal = core.shutdown_signal();

        assert!(core.signal_shutdown());
        assert!(!core.signal_shutdown());
        assert!(*signal.borrow_and_update());
        assert!(matches!(core.ensure_running(), Err(Error::EndpointClosed)));

        core.fail("test".into());
        assert!(matches!(core.ensure_running(), Err(Error::EndpointFailed(_))));
    }
}
