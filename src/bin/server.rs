//! LTP 수신기 - 서비스 ID 하나를 등록하고 받은 블록을 파일로 저장
//!
//! 사용법:
//!   cargo run --release --bin ltp-recv -- [OPTIONS]
//!
//! 예시:
//!   # 엔진 2로 1113 포트에서 수신, 엔진 1을 이웃으로 등록
//!   cargo run --release --bin ltp-recv -- --engine 2 --peer 1@127.0.0.1:1114 --output ./received
//!
//!   # 장거리 링크 설정
//!   cargo run --release --bin ltp-recv -- --engine 2 --peer 1@10.0.0.1:1113 --preset long-haul

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ltp::{ChannelListener, Config, EngineId, LtpEngine, LtpEvent, ReceivedBlock, ServiceId};

/// 수신기 설정
struct ServerConfig {
    peers: Vec<(EngineId, SocketAddr)>,
    service_id: ServiceId,
    output_dir: PathBuf,
    config_path: Option<PathBuf>,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            service_id: ServiceId::from(1),
            output_dir: PathBuf::from("received"),
            config_path: None,
            config: Config::with_engine(
                EngineId::from(2),
                SocketAddr::from(([0, 0, 0, 0], ltp::LTP_UDP_PORT)),
            ),
        }
    }
}

/// `ENGINE@ADDR` 형식
fn parse_peer(arg: &str) -> (EngineId, SocketAddr) {
    let (engine, addr) = arg.split_once('@').expect("--peer 형식: ENGINE@ADDR");
    (
        engine.parse().expect("유효한 엔진 ID 필요"),
        addr.parse().expect("유효한 주소 필요"),
    )
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--engine" | "-e" => {
                if i + 1 < args.len() {
                    config.config.engine_id = args[i + 1].parse().expect("유효한 엔진 ID 필요");
                    i += 1;
                }
            }
            "--peer" | "-p" => {
                if i + 1 < args.len() {
                    config.peers.push(parse_peer(&args[i + 1]));
                    i += 1;
                }
            }
            "--service" | "-s" => {
                if i + 1 < args.len() {
                    config.service_id = args[i + 1].parse().expect("유효한 서비스 ID 필요");
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--preset" => {
                if i + 1 < args.len() {
                    let base = match args[i + 1].as_str() {
                        "low-spec" => Config::low_spec(),
                        "high-performance" => Config::high_performance(),
                        "long-haul" => Config::long_haul(),
                        other => panic!("알 수 없는 프리셋: {}", other),
                    };
                    config.config = Config {
                        engine_id: config.config.engine_id.clone(),
                        bind_addr: config.config.bind_addr,
                        ..base
                    };
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"LTP Receiver - RFC 5326 블록 수신기

받은 블록을 출력 디렉터리에 session 이름의 파일로 저장한다.

사용법:
  cargo run --release --bin ltp-recv -- [OPTIONS]

옵션:
  -b, --bind <ADDR>        바인드 주소 (기본: 0.0.0.0:1113)
  -e, --engine <ID>        로컬 엔진 ID (숫자 또는 a.b.c.d, 기본: 2)
  -p, --peer <ID@ADDR>     이웃 엔진 (여러 번 지정 가능)
  -s, --service <ID>       수신 서비스 ID (기본: 1)
  -o, --output <DIR>       출력 디렉터리 (기본: ./received)
  -c, --config <PATH>      bincode 설정 파일 (엔진 ID/주소 옵션보다 먼저 적용)
  --preset <NAME>          low-spec | high-performance | long-haul
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

    if let Some(path) = &config.config_path {
        let loaded = Config::load(path).expect("설정 파일 로드 실패");
        config.config = Config {
            engine_id: config.config.engine_id.clone(),
            bind_addr: config.config.bind_addr,
            ..loaded
        };
    }

    config
}

fn save_block(dir: &Path, block: &ReceivedBlock) -> ltp::Result<PathBuf> {
    let name = format!(
        "{}-{}.bin",
        block.info.session_id.originator, block.info.session_id.number
    );
    let path = dir.join(name);
    match &block.payload {
        ltp::Payload::File { path: blob, .. } => {
            std::fs::copy(blob, &path)?;
            std::fs::remove_file(blob)?;
        }
        payload => std::fs::write(&path, payload.to_bytes()?)?,
    }
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();
    std::fs::create_dir_all(&server_config.output_dir)?;

    info!("LTP Receiver starting...");
    info!("Engine: {}", server_config.config.engine_id);
    info!("Bind address: {}", server_config.config.bind_addr);
    info!("Service: {}", server_config.service_id);
    info!("Output: {:?}", server_config.output_dir);

    let engine = LtpEngine::start(server_config.config.clone()).await?;
    for (engine_id, addr) in &server_config.peers {
        engine.add_neighbor(engine_id.clone(), *addr);
    }

    let (listener, events) = ChannelListener::new();
    engine.register_listener(server_config.service_id.clone(), Arc::new(listener))?;

    // 파일 쓰기는 처리기 밖에서
    let output_dir = server_config.output_dir.clone();
    let writer = tokio::task::spawn_blocking(move || {
        for event in events.iter() {
            match event {
                LtpEvent::SessionStarted(info) => {
                    info!("Session started: {} from {}", info.session_id, info.neighbor);
                }
                LtpEvent::BlockReceived(block) => match save_block(&output_dir, &block) {
                    Ok(path) => info!(
                        "Block received: {} ({} bytes, red {}) -> {:?}",
                        block.info.session_id, block.info.length, block.info.red_length, path
                    ),
                    Err(e) => error!("블록 저장 실패 {}: {}", block.info.session_id, e),
                },
                LtpEvent::BlockReceiveCancelled(info, reason) => {
                    warn!("Block cancelled: {} ({})", info.session_id, reason);
                }
                LtpEvent::SystemError { description, .. } => {
                    error!("System error: {}", description);
                }
                _ => {}
            }
        }
    });

    info!("Waiting for blocks (Ctrl-C to stop)...");
    tokio::signal::ctrl_c().await?;

    info!("Stopping...");
    let stats = engine.stats();
    engine.unregister_listener(&server_config.service_id);
    engine.stop().await;
    let _ = writer.await;

    info!("{}", stats.summary());
    Ok(())
}
