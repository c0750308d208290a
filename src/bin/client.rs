//! LTP 송신기 - 파일(또는 테스트 데이터)을 블록 하나로 이웃 엔진에 송신
//!
//! 사용법:
//!   cargo run --release --bin ltp-send -- [OPTIONS]
//!
//! 예시:
//!   # 전체 레드로 파일 송신
//!   cargo run --release --bin ltp-send -- --peer 2@127.0.0.1:1113 --file data.bin
//!
//!   # 앞 64KB만 레드, 나머지 그린
//!   cargo run --release --bin ltp-send -- -p 2@127.0.0.1:1113 -f data.bin --red 65536

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ltp::{
    BlockOptions, ChannelListener, CheckpointPolicy, Config, EngineId, LtpEngine, LtpEvent,
    ServiceId,
};

/// 송신기 설정
struct ClientConfig {
    peer: Option<(EngineId, SocketAddr)>,
    service_id: ServiceId,
    file_path: Option<PathBuf>,
    test_size: usize,
    red_length: Option<u64>,
    checkpoint_policy: CheckpointPolicy,
    wait_secs: u64,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer: None,
            service_id: ServiceId::from(1),
            file_path: None,
            test_size: 1024 * 1024,
            red_length: None,
            checkpoint_policy: CheckpointPolicy::LastOnly,
            wait_secs: 300,
            config: Config::with_engine(EngineId::from(1), "0.0.0.0:0".parse().unwrap()),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

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
                    let (engine, addr) = args[i + 1]
                        .split_once('@')
                        .expect("--peer 형식: ENGINE@ADDR");
                    config.peer = Some((
                        engine.parse().expect("유효한 엔진 ID 필요"),
                        addr.parse().expect("유효한 주소 필요"),
                    ));
                    i += 1;
                }
            }
            "--service" | "-s" => {
                if i + 1 < args.len() {
                    config.service_id = args[i + 1].parse().expect("유효한 서비스 ID 필요");
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--size" => {
                if i + 1 < args.len() {
                    config.test_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--red" => {
                if i + 1 < args.len() {
                    config.red_length = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--green" | "-g" => {
                config.red_length = Some(0);
            }
            "--checkpoint-all" => {
                config.checkpoint_policy = CheckpointPolicy::All;
            }
            "--mtu" => {
                if i + 1 < args.len() {
                    config.config.mtu = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--rate" => {
                if i + 1 < args.len() {
                    config.config.segment_rate_limit = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--wait" => {
                if i + 1 < args.len() {
                    config.wait_secs = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"LTP Sender - RFC 5326 블록 송신기

사용법:
  cargo run --release --bin ltp-send -- [OPTIONS]

옵션:
  -p, --peer <ID@ADDR>     대상 엔진 (필수)
  -b, --bind <ADDR>        바인드 주소 (기본: 0.0.0.0:0)
  -e, --engine <ID>        로컬 엔진 ID (기본: 1)
  -s, --service <ID>       대상 서비스 ID (기본: 1)
  -f, --file <PATH>        송신할 파일 (없으면 테스트 데이터)
  --size <BYTES>           테스트 데이터 크기 (기본: 1MB)
  --red <BYTES>            레드 파트 길이 (기본: 전체)
  -g, --green              전체 그린
  --checkpoint-all         모든 레드 세그먼트를 체크포인트로
  --mtu <BYTES>            최대 프레임 크기 (기본: 1400)
  --rate <SEG/S>           이웃 송신 속도 제한 (기본: 4000)
  --wait <SECS>            완료 대기 시간 (기본: 300)
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

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = parse_args();
    let (peer, peer_addr) = match client_config.peer.clone() {
        Some(peer) => peer,
        None => {
            error!("--peer 필요 (--help 참고)");
            std::process::exit(2);
        }
    };

    info!("LTP Sender starting...");
    info!("Engine: {}", client_config.config.engine_id);
    info!("Peer: {} @ {}", peer, peer_addr);
    info!("MTU: {} bytes", client_config.config.mtu);

    let engine = LtpEngine::start(client_config.config.clone()).await?;
    engine.add_neighbor(peer.clone(), peer_addr);

    let (listener, events) = ChannelListener::new();
    engine.register_listener(client_config.service_id.clone(), Arc::new(listener))?;

    let mut options = match client_config.red_length {
        Some(0) => BlockOptions::all_green(client_config.service_id.clone()),
        Some(red) => BlockOptions::mixed(client_config.service_id.clone(), red),
        None => BlockOptions::all_red(client_config.service_id.clone()),
    };
    if options.red_length > 0 {
        options = options.with_policy(client_config.checkpoint_policy);
    }

    let start = Instant::now();
    let (session, size) = match &client_config.file_path {
        Some(path) => {
            let size = std::fs::metadata(path)?.len();
            info!("Sending file: {:?} ({} bytes)", path, size);
            (engine.send_file(peer, path, options).await?, size)
        }
        None => {
            info!("Using test data ({} bytes)", client_config.test_size);
            let data = bytes::Bytes::from(vec![0xABu8; client_config.test_size]);
            (engine.send(peer, data, options).await?, client_config.test_size as u64)
        }
    };
    info!("Session: {}", session);

    // 완료 이벤트 대기
    let wait = Duration::from_secs(client_config.wait_secs);
    let watched = session.clone();
    let outcome = tokio::task::spawn_blocking(move || loop {
        match events.recv_timeout(wait) {
            Ok(LtpEvent::SegmentsTransmitted(info)) if info.session_id == watched => {
                info!("All segments transmitted once");
            }
            Ok(LtpEvent::BlockSent(info)) if info.session_id == watched => return Ok(()),
            Ok(LtpEvent::BlockTransmitCancelled(info, reason)) if info.session_id == watched => {
                return Err(format!("cancelled: {}", reason));
            }
            Ok(_) => {}
            Err(_) => return Err("timed out".to_string()),
        }
    })
    .await?;

    let elapsed = start.elapsed();
    match outcome {
        Ok(()) => {
            info!("Transfer complete!");
            info!("  Time: {:.2}s", elapsed.as_secs_f64());
            info!(
                "  Throughput: {:.2} MB/s",
                size as f64 / elapsed.as_secs_f64() / 1_000_000.0
            );
        }
        Err(e) => error!("Transfer failed: {}", e),
    }

    info!("{}", engine.stats().summary());
    engine.stop().await;
    Ok(())
}
