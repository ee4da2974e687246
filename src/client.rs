//! 클라이언트 엔드포인트
//!
//! - 핸드쉐이크 (백오프 재요청, accept/reject/타임아웃)
//! - 수신 루프: 서버에서 온 데이터그램만 처리
//! - 타이머 루프: 재전송, heartbeat, 연결 타임아웃
//! - LAN 서버 탐색

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionState, PeerInfo, SharedConnection};
use crate::dispatcher::{Delivery, DisconnectReason, Dispatcher, HandlerRegistry};
use crate::endpoint::{is_transient, DeliveryFailure, EndpointCore};
use crate::error::HandshakeError;
use crate::interceptor::{Interceptor, PassThrough, SharedInterceptor};
use crate::logging::{LogContext, LogLevel, LogSink, SharedSink, TracingSink};
use crate::message::{
    ControlPayload, DisconnectCode, DisconnectNotice, DiscoverReply, DiscoverRequest,
    HandshakeAccept, HandshakeReject, HandshakeRequest, Message, MessageTag, MessageType, Verdict,
};
use crate::sequence::Sequence;
use crate::stats::StatsSnapshot;
use crate::{codec, Config, Result};

/// 클라이언트 빌더
pub struct ClientBuilder {
    config: Config,
    registry: HandlerRegistry,
    sink: SharedSink,
    interceptor: SharedInterceptor,
    bind_addr: SocketAddr,
}

impl ClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            sink: Arc::new(TracingSink),
            interceptor: Arc::new(PassThrough),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
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

    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PeerInfo, DisconnectReason) + Send + Sync + 'static,
    {
        self.registry.set_on_disconnect(hook);
        self
    }

    /// 서버 검증기의 판정 수신
    pub fn on_verdict<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PeerInfo, &Verdict) + Send + Sync + 'static,
    {
        self.registry.set_on_verdict(hook);
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

    /// 로컬 바인드 주소 (기본 0.0.0.0:0)
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// 서버에 연결
    ///
    /// accept를 받을 때까지 백오프로 요청을 재전송한다.
    pub async fn connect(self, server_addr: SocketAddr, timeout: Duration) -> Result<Client> {
        self.config.validate()?;

        let socket = UdpSocket::bind(self.bind_addr).await?;
        let dispatcher = Dispatcher::new(self.registry, self.config.dispatch_workers, self.sink.clone())?;
        let core = EndpointCore::new(socket, self.config, dispatcher, self.sink, self.interceptor)?;

        let client_id: u64 = rand::random();
        let connection =
            Connection::new(server_addr, client_id, core.config.receive_window, Instant::now()).into_shared();
        let accept = handshake(&core, &connection, timeout).await?;

        core.log(
            LogLevel::Info,
            &format!(
                "RDL client connected from {} to {} ({})",
                core.local_addr,
                server_addr,
                accept.server_name.as_deref().unwrap_or("unnamed")
            ),
            LogContext::peer(server_addr).with_client(client_id),
        );

        let inner = Arc::new(ClientInner {
            core,
            connection,
            server_addr,
            client_id,
            server_name: accept.server_name,
            tasks: Mutex::new(Vec::new()),
        });

        let recv_task = tokio::spawn(receive_loop(inner.clone()));
        let timer_task = tokio::spawn(timer_loop(inner.clone()));
        inner.tasks.lock().extend([recv_task, timer_task]);

        Ok(Client { inner })
    }

    /// 빌더의 로거로 LAN 서버 탐색
    ///
    /// `target`(보통 브로드캐스트 주소)으로 요청을 보내고 `wait` 동안 응답을 모은다.
    pub async fn discover(self, target: SocketAddr, wait: Duration) -> Result<Vec<DiscoveredServer>> {
        let socket = UdpSocket::bind(self.bind_addr).await?;
        socket.set_broadcast(true)?;

        let request = DiscoverRequest {
            app_version: self.config.app_version.clone(),
        };
        let datagram = codec::encode(&Message::control(&request)?)?;
        socket.send_to(&datagram, target).await?;

        let deadline = tokio::time::Instant::now() + wait;
        let mut buf = vec![0u8; self.config.max_datagram_size];
        let mut servers: Vec<DiscoveredServer> = Vec::new();

        loop {
            let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) if is_transient(&e) => continue,
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(pair)) => pair,
            };

            let reply = match codec::decode(&buf[..len]) {
                Ok(message) if message.msg_type == MessageType::DiscoverReply => message.parse::<DiscoverReply>(),
                Ok(_) => continue,
                Err(e) => Err(e.into()),
            };
            match reply {
                Ok(reply) if !servers.iter().any(|s| s.addr == from) => servers.push(DiscoveredServer {
                    addr: from,
                    server_name: reply.server_name,
                    app_version: reply.app_version,
                    compatible: reply.compatible,
                    connections: reply.connections,
                    capacity: reply.capacity,
                }),
                Ok(_) => {}
                Err(e) => self.sink.emit(
                    LogLevel::Debug,
                    &format!("탐색 응답 무시: {}", e),
                    &LogContext::peer(from),
                ),
            }
        }

        Ok(servers)
    }
}

/// 서버 탐색 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub addr: SocketAddr,
    pub server_name: Option<String>,
    pub app_version: String,
    pub compatible: bool,
    pub connections: u32,
    pub capacity: u32,
}

struct ClientInner {
    core: EndpointCore,
    connection: SharedConnection,
    server_addr: SocketAddr,
    client_id: u64,
    server_name: Option<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInner {
    fn context(&self) -> LogContext {
        LogContext::peer(self.server_addr).with_client(self.client_id)
    }

    /// 연결 종료. 처음 한 번만 on_disconnect 호출
    fn teardown(&self, reason: DisconnectReason) {
        let peer = {
            let mut conn = self.connection.lock();
            conn.close().then(|| conn.peer())
        };
        if let Some(peer) = peer {
            self.core.notify_disconnected(&peer, reason);
        }
        self.core.signal_shutdown();
    }

    async fn handle(&self, message: Message) {
        match message.msg_type {
            MessageType::Disconnect => {
                let code = message.parse::<DisconnectNotice>().map(|n| n.code);
                self.core.log(
                    LogLevel::Info,
                    &format!("Server closed connection ({:?})", code),
                    self.context(),
                );
                self.teardown(DisconnectReason::Remote);
            }
            MessageType::HandshakeAccept => {
                // 유실 후 재전송된 accept
                self.connection.lock().touch(Instant::now());
            }
            MessageType::HandshakeRequest
            | MessageType::HandshakeReject
            | MessageType::Discover
            | MessageType::DiscoverReply => {
                self.core.log(LogLevel::Debug, "클라이언트가 처리하지 않는 메시지", self.context());
            }
            MessageType::Heartbeat | MessageType::Ack | MessageType::Verdict | MessageType::Application(_) => {
                if let Err(e) = self.core.process(&self.connection, message).await {
                    self.core.log(LogLevel::Warn, &format!("메시지 처리 에러: {}", e), self.context());
                }
            }
        }
    }
}

async fn receive_loop(inner: Arc<ClientInner>) {
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
                    if from != inner.server_addr {
                        inner.core.log(LogLevel::Debug, "서버가 아닌 주소의 데이터그램 무시", LogContext::peer(from));
                        continue;
                    }
                    if let Some(message) = inner.core.accept_datagram(from, &buf[..len]) {
                        inner.handle(message).await;
                    }
                }
                Err(e) if is_transient(&e) => {
                    inner.core.log(LogLevel::Debug, &format!("ICMP 에러 무시: {}", e), inner.context());
                }
                Err(e) => {
                    inner.core.fail(format!("recv_from 실패: {}", e));
                    break;
                }
            }
        }
    }

    if inner.core.fault().is_some() {
        inner.teardown(DisconnectReason::SocketError);
    }
}

async fn timer_loop(inner: Arc<ClientInner>) {
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

        let idle = inner.connection.lock().idle_for(Instant::now());
        if idle > timeout {
            inner.core.log(
                LogLevel::Info,
                &format!("Connection timed out after {}ms idle", idle.as_millis()),
                inner.context(),
            );
            inner.teardown(DisconnectReason::Timeout);
            break;
        }

        if inner.core.sweep(&inner.connection).await.is_err() {
            break;
        }
    }

    if inner.core.fault().is_some() {
        inner.teardown(DisconnectReason::SocketError);
    }
}

/// 핸드쉐이크 요청/응답 교환
///
/// 연결은 Connecting 상태로 시작하며 일치하는 accept를 받으면 Connected가 된다.
async fn handshake(core: &EndpointCore, connection: &SharedConnection, timeout: Duration) -> Result<HandshakeAccept> {
    let (server_addr, client_id) = {
        let conn = connection.lock();
        (conn.peer_addr, conn.client_id)
    };
    let request = HandshakeRequest {
        client_id,
        app_version: core.config.app_version.clone(),
        compression: core.config.compression,
    };
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = vec![0u8; core.config.max_datagram_size];
    let mut attempt = 0u32;

    loop {
        core.log(
            LogLevel::Debug,
            &format!("핸드쉐이크 요청 전송 (시도 {})", attempt + 1),
            LogContext::peer(server_addr).with_client(client_id),
        );
        core.send_unconnected(server_addr, &request).await?;

        let wait_until = (tokio::time::Instant::now() + core.config.retry_timeout(attempt)).min(deadline);
        loop {
            let received = tokio::time::timeout_at(wait_until, core.socket.recv_from(&mut buf)).await;
            let (len, from) = match received {
                Err(_) => break,
                Ok(Err(e)) if is_transient(&e) => continue,
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(pair)) => pair,
            };
            if from != server_addr {
                continue;
            }
            let Some(message) = core.accept_datagram(from, &buf[..len]) else {
                continue;
            };

            match message.msg_type {
                MessageType::HandshakeAccept => {
                    let accept = parse_handshake::<HandshakeAccept>(&message)?;
                    if accept.client_id == client_id {
                        let mut conn = connection.lock();
                        conn.touch(Instant::now());
                        conn.establish();
                        return Ok(accept);
                    }
                }
                MessageType::HandshakeReject => {
                    let reject = parse_handshake::<HandshakeReject>(&message)?;
                    if reject.client_id == client_id {
                        core.log(
                            LogLevel::Warn,
                            &format!("서버가 연결 거부: {}", reject.reason),
                            LogContext::peer(server_addr).with_client(client_id),
                        );
                        return Err(HandshakeError::Rejected { reason: reject.reason }.into());
                    }
                }
                _ => {}
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(HandshakeError::TimedOut {
                after_ms: timeout.as_millis() as u64,
            }
            .into());
        }
        attempt += 1;
    }
}

fn parse_handshake<P: ControlPayload>(message: &Message) -> Result<P> {
    message
        .parse::<P>()
        .map_err(|e| HandshakeError::Malformed(e.to_string()).into())
}

/// 연결된 클라이언트 핸들
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// 메시지 송신, 할당된 시퀀스 반환
    ///
    /// 신뢰성 메시지의 최종 실패는 `delivery_failures()`로 보고된다.
    pub async fn send(&self, tag: MessageTag, payload: impl Into<Bytes>, reliable: bool) -> Result<Sequence> {
        self.inner
            .core
            .send_message(&self.inner.connection, tag, payload.into(), reliable)
            .await
    }

    /// 연결 종료 (Disconnect 알림 후 태스크 정리)
    pub async fn disconnect(&self) -> Result<()> {
        if self.inner.connection.lock().is_connected() {
            let notice = DisconnectNotice {
                code: DisconnectCode::Closed,
            };
            if let Err(e) = self.inner.core.send_control(&self.inner.connection, &notice).await {
                self.inner
                    .core
                    .log(LogLevel::Debug, &format!("종료 알림 전송 실패: {}", e), self.inner.context());
            }
        }

        self.inner.teardown(DisconnectReason::Local);

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.lock().state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.lock().is_connected()
    }

    pub fn client_id(&self) -> u64 {
        self.inner.client_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr
    }

    pub fn server_name(&self) -> Option<&str> {
        self.inner.server_name.as_deref()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.core.local_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.core.stats.snapshot()
    }

    /// 미확인 신뢰성 송신 수
    pub fn pending_count(&self) -> usize {
        self.inner.connection.lock().pending_count()
    }

    pub fn delivery_failures(&self) -> crossbeam_channel::Receiver<DeliveryFailure> {
        self.inner.core.failures()
    }

    /// LAN 서버 탐색 (기본 로거 사용)
    ///
    /// 로거를 지정하려면 `ClientBuilder::discover`를 사용한다.
    pub async fn discover(target: SocketAddr, config: &Config, wait: Duration) -> Result<Vec<DiscoveredServer>> {
        ClientBuilder::new(config.clone()).discover(target, wait).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.teardown(DisconnectReason::Local);
    }
}
