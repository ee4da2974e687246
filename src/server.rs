//! 서버 엔드포인트
//!
//! - 핸드쉐이크 심사 및 세션 등록
//! - 수신 루프: 주소별 세션으로 라우팅, 미등록 주소에는 NotConnected 알림
//! - 타이머 루프: 타임아웃 퇴출, 재전송, heartbeat
//! - 브로드캐스트/지정 송신, LAN 탐색 응답
//! - 선택적 검증기: 클라이언트 메시지 판정 후 결과 회신

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::connection::{PeerInfo, SharedConnection};
use crate::dispatcher::{Delivery, DisconnectReason, Dispatcher, HandlerRegistry};
use crate::endpoint::{is_transient, DeliveryFailure, EndpointCore};
use crate::interceptor::{Interceptor, PassThrough, SharedInterceptor};
use crate::logging::{LogContext, LogLevel, LogSink, SharedSink, TracingSink};
use crate::message::{
    DisconnectCode, DisconnectNotice, DiscoverReply, DiscoverRequest, HandshakeAccept,
    HandshakeReject, HandshakeRequest, Message, MessageTag, MessageType, RejectReason,
};
use crate::sequence::Sequence;
use crate::session::{Admission, SessionTable};
use crate::stats::StatsSnapshot;
use crate::{Config, Error, Result};

/// 서버 빌더
pub struct ServerBuilder {
    config: Config,
    registry: HandlerRegistry,
    sink: SharedSink,
    interceptor: SharedInterceptor,
}

impl ServerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            sink: Arc::new(TracingSink),
            interceptor: Arc::new(PassThrough),
        }
    }

    /// 태그 핸들러 등록
    pub fn handler<F>(mut self, tag: MessageTag, handler: F) -> Self
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        self.registry.register(tag, handler);
        self
    }

    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PeerInfo) + Send + Sync + 'static,
    {
        self.registry.set_on_connect(hook);
        self
    }

    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PeerInfo, DisconnectReason) + Send + Sync + 'static,
    {
        self.registry.set_on_disconnect(hook);
        self
    }

    /// 클라이언트 메시지 검증기
    ///
    /// 핸들러 호출 전에 판정하며 부적합 메시지는 핸들러에 전달되지 않는다.
    /// 신뢰성 메시지에는 판정 결과(`Verdict`)를 회신한다.
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Delivery) -> bool + Send + Sync + 'static,
    {
        self.registry.set_validator(validator);
        self
    }

    pub fn logger(mut self, sink: impl LogSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptor = Arc::new(interceptor);
        self
    }

    /// 바인드 후 수신/타이머 태스크 시작
    pub async fn start(self, bind_addr: SocketAddr) -> Result<Server> {
        self.config.validate()?;

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;

        let sessions = SessionTable::new(&self.config);
        let dispatcher = Dispatcher::new(self.registry, self.config.dispatch_workers, self.sink.clone())?;
        let core = EndpointCore::new(socket, self.config, dispatcher, self.sink, self.interceptor)?;

        core.log(
            LogLevel::Info,
            &format!(
                "RDL server started on {} (max {} connections)",
                core.local_addr, core.config.max_connections
            ),
            LogContext::none(),
        );

        let inner = Arc::new(ServerInner {
            core,
            sessions,
            tasks: Mutex::new(Vec::new()),
        });

        let recv_task = tokio::spawn(receive_loop(inner.clone()));
        let timer_task = tokio::spawn(timer_loop(inner.clone()));
        inner.tasks.lock().extend([recv_task, timer_task]);

        Ok(Server { inner })
    }
}

struct ServerInner {
    core: EndpointCore,
    sessions: SessionTable,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerInner {
    /// 세션 제거 및 on_disconnect (제거한 호출만)
    fn evict(&self, peer: &SocketAddr, reason: DisconnectReason) {
        if let Some(info) = self.sessions.remove(peer) {
            self.core.notify_disconnected(&info, reason);
        }
    }

    fn evict_all(&self, reason: DisconnectReason) {
        for info in self.sessions.drain() {
            self.core.notify_disconnected(&info, reason);
        }
    }

    async fn handle(&self, peer: SocketAddr, message: Message) {
        let result = match message.msg_type {
            MessageType::Discover => self.handle_discover(peer, &message).await,
            MessageType::HandshakeRequest => self.handle_handshake(peer, &message).await,
            _ => match self.sessions.get(&peer) {
                Some(conn) => self.handle_connected(peer, &conn, message).await,
                None => self.handle_unknown(peer, &message).await,
            },
        };

        if let Err(e) = result {
            self.core
                .log(LogLevel::Warn, &format!("메시지 처리 에러: {}", e), LogContext::peer(peer));
        }
    }

    async fn handle_discover(&self, peer: SocketAddr, message: &Message) -> Result<()> {
        let request = match message.parse::<DiscoverRequest>() {
            Ok(request) => request,
            Err(e) => {
                self.core
                    .log(LogLevel::Debug, &format!("잘못된 탐색 요청: {}", e), LogContext::peer(peer));
                return Ok(());
            }
        };

        let config = &self.core.config;
        let reply = DiscoverReply {
            server_name: config.server_name.clone(),
            app_version: config.app_version.clone(),
            compatible: request.app_version == config.app_version,
            connections: self.sessions.len() as u32,
            capacity: self.sessions.capacity() as u32,
        };
        self.core.log(LogLevel::Debug, "탐색 요청 응답", LogContext::peer(peer));
        self.core.send_unconnected(peer, &reply).await
    }

    async fn handle_handshake(&self, peer: SocketAddr, message: &Message) -> Result<()> {
        let request = match message.parse::<HandshakeRequest>() {
            Ok(request) => request,
            Err(e) => {
                self.core
                    .log(LogLevel::Debug, &format!("잘못된 핸드쉐이크 요청: {}", e), LogContext::peer(peer));
                let reject = HandshakeReject {
                    client_id: 0,
                    reason: RejectReason::Malformed,
                };
                return self.core.send_unconnected(peer, &reject).await;
            }
        };

        let context = LogContext::peer(peer).with_client(request.client_id);
        match self.sessions.admit(peer, &request, Instant::now()) {
            Admission::Accepted(conn) => {
                let info = conn.lock().peer();
                self.core.log(LogLevel::Info, "Client connected", context);
                self.core.send_unconnected(peer, &self.accept(request.client_id)).await?;
                self.core.dispatcher.connected(&info);
                Ok(())
            }
            Admission::Existing(conn) => {
                conn.lock().touch(Instant::now());
                self.core.log(LogLevel::Debug, "중복 핸드쉐이크 요청, accept 재전송", context);
                self.core.send_unconnected(peer, &self.accept(request.client_id)).await
            }
            Admission::Rejected(reason) => {
                self.core
                    .log(LogLevel::Info, &format!("Handshake rejected: {}", reason), context);
                let reject = HandshakeReject {
                    client_id: request.client_id,
                    reason,
                };
                self.core.send_unconnected(peer, &reject).await
            }
        }
    }

    fn accept(&self, client_id: u64) -> HandshakeAccept {
        let config = &self.core.config;
        HandshakeAccept {
            client_id,
            server_name: config.server_name.clone(),
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            connection_timeout_ms: config.connection_timeout_ms,
        }
    }

    async fn handle_connected(&self, peer: SocketAddr, conn: &SharedConnection, message: Message) -> Result<()> {
        match message.msg_type {
            MessageType::Disconnect => {
                conn.lock().touch(Instant::now());
                self.evict(&peer, DisconnectReason::Remote);
                Ok(())
            }
            MessageType::Heartbeat | MessageType::Ack | MessageType::Application(_) => {
                self.core.process(conn, message).await
            }
            _ => {
                conn.lock().touch(Instant::now());
                Ok(())
            }
        }
    }

    /// 등록되지 않은 주소의 트래픽
    async fn handle_unknown(&self, peer: SocketAddr, message: &Message) -> Result<()> {
        match message.msg_type {
            MessageType::Heartbeat | MessageType::Ack | MessageType::Application(_) => {
                self.core
                    .log(LogLevel::Debug, "미등록 주소의 트래픽, NotConnected 알림", LogContext::peer(peer));
                let notice = DisconnectNotice {
                    code: DisconnectCode::NotConnected,
                };
                self.core.send_unconnected(peer, &notice).await
            }
            _ => Ok(()),
        }
    }

    /// 모든 피어에 종료 알림 (best effort)
    async fn notify_shutdown(&self) {
        let notice = DisconnectNotice {
            code: DisconnectCode::Shutdown,
        };
        for conn in self.sessions.connections() {
            if let Err(e) = self.core.send_control(&conn, &notice).await {
                self.core
                    .log(LogLevel::Debug, &format!("종료 알림 전송 실패: {}", e), LogContext::none());
                break;
            }
        }
    }
}

async fn receive_loop(inner: Arc<ServerInner>) {
    let mut shutdown = inner.core.shutdown_signal();
    let mut buf = vec![0u8; inner.core.config.max_datagram_size];

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            result = inner.core.socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => {
                    if let Some(message) = inner.core.accept_datagram(from, &buf[..len]) {
                        inner.handle(from, message).await;
                    }
                }
                Err(e) if is_transient(&e) => {
                    inner.core.log(LogLevel::Debug, &format!("ICMP 에러 무시: {}", e), LogContext::none());
                }
                Err(e) => {
                    inner.core.fail(format!("recv_from 실패: {}", e));
                    break;
                }
            }
        }
    }

    if inner.core.fault().is_some() {
        inner.evict_all(DisconnectReason::SocketError);
    }
}

async fn timer_loop(inner: Arc<ServerInner>) {
    let mut shutdown = inner.core.shutdown_signal();
    let mut interval = tokio::time::interval(inner.core.config.sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let timeout = inner.core.config.connection_timeout();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }
        if !inner.core.is_running() {
            break;
        }

        for peer in inner.sessions.expired(Instant::now(), timeout) {
            inner.core.log(LogLevel::Info, "Connection timed out", LogContext::peer(peer));
            inner.evict(&peer, DisconnectReason::Timeout);
        }

        for conn in inner.sessions.connections() {
            if inner.core.sweep(&conn).await.is_err() {
                break;
            }
        }
    }

    if inner.core.fault().is_some() {
        inner.evict_all(DisconnectReason::SocketError);
    }
}

/// 실행 중인 서버 핸들
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// 모든 연결에 송신. 보낸 피어 수 반환
    pub async fn broadcast(&self, tag: MessageTag, payload: impl Into<Bytes>, reliable: bool) -> Result<usize> {
        self.inner.core.ensure_running()?;
        let payload = payload.into();

        let mut sent = 0;
        for conn in self.inner.sessions.connections() {
            match self.inner.core.send_message(&conn, tag, payload.clone(), reliable).await {
                Ok(_) => sent += 1,
                // 방금 퇴출된 연결
                Err(Error::NotConnected) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    /// 특정 피어에 송신
    pub async fn send_to(
        &self,
        peer: SocketAddr,
        tag: MessageTag,
        payload: impl Into<Bytes>,
        reliable: bool,
    ) -> Result<Sequence> {
        let conn = self.inner.sessions.get(&peer).ok_or(Error::UnknownPeer { peer })?;
        self.inner
            .core
            .send_message(&conn, tag, payload.into(), reliable)
            .await
    }

    /// 피어 하나의 연결 종료
    pub async fn disconnect_peer(&self, peer: SocketAddr) -> Result<()> {
        let conn = self.inner.sessions.get(&peer).ok_or(Error::UnknownPeer { peer })?;
        let notice = DisconnectNotice {
            code: DisconnectCode::Closed,
        };
        let sent = self.inner.core.send_control(&conn, &notice).await;
        self.inner.evict(&peer, DisconnectReason::Local);
        sent
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.sessions.peers()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.core.local_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.core.stats.snapshot()
    }

    pub fn delivery_failures(&self) -> crossbeam_channel::Receiver<DeliveryFailure> {
        self.inner.core.failures()
    }

    pub fn is_running(&self) -> bool {
        self.inner.core.is_running()
    }

    /// 서버 종료
    ///
    /// 피어에 종료 알림을 보내고 태스크를 정리한 뒤 모든 연결을 퇴출한다.
    pub async fn close(&self) -> Result<()> {
        if self.inner.core.signal_shutdown() {
            self.inner.notify_shutdown().await;
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        self.inner.evict_all(DisconnectReason::Shutdown);
        self.inner.core.log(
            LogLevel::Info,
            &format!("RDL server stopped. {}", self.stats().summary()),
            LogContext::none(),
        );
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.core.signal_shutdown();
        self.inner.evict_all(DisconnectReason::Shutdown);
    }
}
