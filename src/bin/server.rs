//! RDL 서버 - 채팅 릴레이 데모
//!
//! 클라이언트가 보낸 채팅 메시지(태그 0)를 모든 연결에 중계한다.
//!
//! 사용법:
//!   cargo run --release --bin rdl-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 실행
//!   cargo run --release --bin rdl-server -- --bind 0.0.0.0:9000
//!
//!   # 순서 보장 + 최대 10명
//!   cargo run --release --bin rdl-server -- --strict --max-connections 10 --name lobby

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rdl::{Config, MessageTag, ServerBuilder};

/// 채팅 메시지 태그
const CHAT: MessageTag = MessageTag::saturating(0);

/// 서버 설정
struct ServerOptions {
    bind_addr: SocketAddr,
    stats_interval: Option<Duration>,
    config: Config,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            stats_interval: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerOptions {
    let args: Vec<String> = std::env::args().collect();
    let mut options = ServerOptions::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    options.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    options.config.server_name = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--max-connections" | "-m" => {
                if i + 1 < args.len() {
                    options.config.max_connections = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--app-version" => {
                if i + 1 < args.len() {
                    options.config.app_version = args[i + 1].clone();
                    i += 1;
                }
            }
            "--workers" | "-w" => {
                if i + 1 < args.len() {
                    options.config.dispatch_workers = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--stats" => {
                if i + 1 < args.len() {
                    let secs: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    options.stats_interval = Some(Duration::from_secs(secs.max(1)));
                    i += 1;
                }
            }
            "--strict" => {
                options.config.strict_ordering = true;
            }
            "--lan" => {
                let name = options.config.server_name.take();
                options.config = Config {
                    server_name: name,
                    ..Config::lan()
                };
            }
            "--help" | "-h" => {
                println!(
                    r#"RDL Server - Reliable Datagram Layer 채팅 릴레이

사용법:
  cargo run --release --bin rdl-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>            바인드 주소 (기본: 0.0.0.0:9000)
  -n, --name <NAME>            서버 이름 (accept/탐색 응답에 포함)
  -m, --max-connections <N>    최대 동시 연결 수 (기본: 50)
  -w, --workers <N>            핸들러 워커 수 (기본: 0 = 수신 루프에서 호출)
      --app-version <VER>      애플리케이션 버전 (기본: 1.0)
      --stats <SECS>           주기적 통계 출력
      --strict                 순서 보장 모드
      --lan                    LAN 프리셋 (짧은 재전송/타임아웃)
  -h, --help                   이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    options
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = parse_args();

    info!("RDL Server starting...");
    info!("Bind address: {}", options.bind_addr);
    info!("Strict ordering: {}", options.config.strict_ordering);
    info!("Max connections: {}", options.config.max_connections);

    // 핸들러는 동기 호출이므로 중계는 채널로 넘긴다
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<(SocketAddr, bytes::Bytes)>();

    let server = Arc::new(
        ServerBuilder::new(options.config)
            .handler(CHAT, move |delivery| {
                info!(
                    "[{}] {}",
                    delivery.peer,
                    String::from_utf8_lossy(&delivery.payload)
                );
                let _ = relay_tx.send((delivery.peer, delivery.payload.clone()));
            })
            .on_connect(|peer| info!("+ {} (client {:016x})", peer.addr, peer.client_id))
            .on_disconnect(|peer, reason| info!("- {} ({})", peer.addr, reason))
            .start(options.bind_addr)
            .await?,
    );

    info!("Server listening on {}", server.local_addr());

    // 중계 태스크
    let relay_server = server.clone();
    tokio::spawn(async move {
        while let Some((from, payload)) = relay_rx.recv().await {
            let line = format!("{}: {}", from, String::from_utf8_lossy(&payload));
            if let Err(e) = relay_server.broadcast(CHAT, line.into_bytes(), true).await {
                info!("Relay stopped: {}", e);
                break;
            }
        }
    });

    // 통계 출력 태스크
    if let Some(period) = options.stats_interval {
        let stats_server = server.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if !stats_server.is_running() {
                    break;
                }
                info!(
                    "Peers: {} | {}",
                    stats_server.connection_count(),
                    stats_server.stats().summary()
                );
            }
        });
    }

    // 전달 실패 로그
    let failures = server.delivery_failures();
    std::thread::spawn(move || {
        for failure in failures.iter() {
            info!(
                "Delivery failed: seq {} to {} after {} attempts",
                failure.sequence, failure.peer, failure.attempts
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    server.close().await?;

    Ok(())
}
