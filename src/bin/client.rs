//! RDL 클라이언트 - 채팅 데모
//!
//! 표준 입력의 각 줄을 신뢰성 메시지(태그 0)로 보내고 서버가 중계한 메시지를 출력한다.
//!
//! 사용법:
//!   cargo run --release --bin rdl-client -- [OPTIONS]
//!
//! 예시:
//!   # 서버 접속
//!   cargo run --release --bin rdl-client -- --server 127.0.0.1:9000
//!
//!   # LAN 서버 탐색
//!   cargo run --release --bin rdl-client -- --discover 255.255.255.255:9000

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rdl::{Client, ClientBuilder, Config, MessageTag};

/// 채팅 메시지 태그
const CHAT: MessageTag = MessageTag::saturating(0);

/// 클라이언트 설정
struct ClientOptions {
    bind_addr: SocketAddr,
    server_addr: SocketAddr,
    discover: Option<SocketAddr>,
    config: Config,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            discover: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientOptions {
    let args: Vec<String> = std::env::args().collect();
    let mut options = ClientOptions::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    options.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    options.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--discover" | "-d" => {
                if i + 1 < args.len() {
                    options.discover = Some(args[i + 1].parse().expect("유효한 주소 필요"));
                    i += 1;
                }
            }
            "--timeout" | "-t" => {
                if i + 1 < args.len() {
                    options.config.handshake_timeout_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--app-version" => {
                if i + 1 < args.len() {
                    options.config.app_version = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"RDL Client - Reliable Datagram Layer 채팅 클라이언트

사용법:
  cargo run --release --bin rdl-client -- [OPTIONS]

옵션:
  -b, --bind <ADDR>        로컬 바인드 주소 (기본: 0.0.0.0:0)
  -s, --server <ADDR>      서버 주소 (기본: 127.0.0.1:9000)
  -d, --discover <ADDR>    서버 탐색 후 종료 (예: 255.255.255.255:9000)
  -t, --timeout <MS>       연결 타임아웃 밀리초 (기본: 5000)
      --app-version <VER>  애플리케이션 버전 (기본: 1.0)
  -h, --help               이 도움말 출력

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

    if let Some(target) = options.discover {
        info!("Discovering servers via {}...", target);
        let servers = Client::discover(target, &options.config, Duration::from_secs(2)).await?;
        if servers.is_empty() {
            info!("No servers found");
        }
        for server in servers {
            info!(
                "{} | {} | v{} ({}) | {}/{} connections",
                server.addr,
                server.server_name.as_deref().unwrap_or("unnamed"),
                server.app_version,
                if server.compatible { "compatible" } else { "incompatible" },
                server.connections,
                server.capacity,
            );
        }
        return Ok(());
    }

    info!("Connecting to {}...", options.server_addr);
    let timeout = options.config.handshake_timeout();

    let client = ClientBuilder::new(options.config)
        .bind(options.bind_addr)
        .handler(CHAT, |delivery| {
            println!("{}", String::from_utf8_lossy(&delivery.payload));
        })
        .on_disconnect(|peer, reason| warn!("서버 연결 종료 {} ({})", peer.addr, reason))
        .connect(options.server_addr, timeout)
        .await?;

    info!(
        "Connected as {:016x} to {}",
        client.client_id(),
        client.server_name().unwrap_or("unnamed server")
    );

    // 전달 실패 로그
    let failures = client.delivery_failures();
    std::thread::spawn(move || {
        for failure in failures.iter() {
            warn!("메시지 전달 실패: seq {} ({}회 전송)", failure.sequence, failure.attempts);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(e) = client.send(CHAT, line.into_bytes(), true).await {
                        warn!("송신 실패: {}", e);
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        if !client.is_connected() {
            break;
        }
    }

    client.disconnect().await?;
    info!("{}", client.stats().summary());
    Ok(())
}
