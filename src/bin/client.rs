//! Sanchez 스트림 클라이언트 - 스트림을 수신해 .sanchez 파일로 기록
//!
//! 수신한 프레임을 순서대로 모아 컨테이너로 저장하고, 오디오가 실려 있으면
//! 같은 이름의 .mp3로 함께 내려놓는다.
//!
//! 사용법:
//!   cargo run --release --bin sanchez_client -- --server <HOST> [OPTIONS]
//!
//! 예시:
//!   # TCP 수신 후 저장
//!   cargo run --release --bin sanchez_client -- -s 192.168.1.100 -o recorded.sanchez
//!
//!   # 멀티캐스트 그룹 수신
//!   cargo run --release --bin sanchez_client -- -s 239.0.0.1 -m multicast -o feed.sanchez

use std::fs::File;
use std::path::PathBuf;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sanchez::container;
use sanchez::{
    FrameStore, SanchezMetadata, SanchezStreamClient, StreamEvent, StreamMode, StreamOptions,
    DEFAULT_PORT,
};

/// 클라이언트 CLI 설정
struct ReceiveConfig {
    server: String,
    port: u16,
    mode: StreamMode,
    output: Option<PathBuf>,
    satellite: bool,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            mode: StreamMode::TcpUnicast,
            output: None,
            satellite: false,
        }
    }
}

fn parse_args() -> ReceiveConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ReceiveConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server = args[i + 1].clone();
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    config.port = args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--mode" | "-m" => {
                if i + 1 < args.len() {
                    config.mode =
                        StreamMode::parse(&args[i + 1]).expect("tcp|udp|multicast|broadcast");
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--satellite" => config.satellite = true,
            "--help" | "-h" => {
                println!(
                    r#"Sanchez Stream Client - 스트림 수신/기록

사용법:
  cargo run --release --bin sanchez_client -- --server <HOST> [OPTIONS]

옵션:
  -s, --server <HOST>   서버 주소 또는 멀티캐스트 그룹 (기본: 127.0.0.1)
  -p, --port <PORT>     포트 (기본: 9999)
  -m, --mode <MODE>     tcp | udp | multicast | broadcast (기본: tcp)
  -o, --output <PATH>   수신 스트림을 .sanchez로 저장
  --satellite           위성 모드 수신 (FEC 복구 활성)
  -h, --help            이 도움말 출력

예시:
  # TCP 수신 후 저장
  cargo run --release --bin sanchez_client -- -s 192.168.1.100 -o recorded.sanchez

  # 멀티캐스트 수신
  cargo run --release --bin sanchez_client -- -s 239.0.0.1 -m multicast -o feed.sanchez
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
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let receive_config = parse_args();
    let options = if receive_config.satellite {
        StreamOptions::satellite_mode()
    } else {
        StreamOptions::default()
    };

    let (client, mut events) = SanchezStreamClient::start(
        receive_config.mode,
        &receive_config.server,
        receive_config.port,
        options,
    )
    .await?;

    let mut store: Option<FrameStore> = None;
    let mut lost = 0u64;

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Frame { index, frame } => {
                let store = store.get_or_insert_with(|| {
                    FrameStore::new(frame.width(), frame.height())
                });
                if let Err(e) = store.push(frame) {
                    warn!("프레임 {} 버림: {}", index, e);
                    continue;
                }
                if store.len() % 24 == 0 {
                    info!("수신 프레임 {}", store.len());
                }
            }
            StreamEvent::FrameLost(index) => {
                lost += 1;
                warn!("프레임 {} 손실", index);
            }
        }
    }

    let stats = client.stats();
    info!("수신 종료: {}", stats.summary());
    if lost > 0 {
        warn!("손실 프레임 {}개", lost);
    }

    let Some(store) = store else {
        warn!("수신한 프레임 없음");
        return Ok(());
    };

    if let Some(output) = receive_config.output {
        let metadata = client.metadata().map_or_else(
            || SanchezMetadata::new("stream", "sanchez", 0.0),
            |m| SanchezMetadata {
                title: format!("{} (stream)", m.title),
                ..m
            },
        );
        let mut file = File::create(&output)?;
        container::write_store(&mut file, &metadata, &store, true)?;
        info!("저장 완료: {:?} ({} frames)", output, store.len());

        if let Some(audio) = client.audio() {
            if !audio.is_empty() {
                let audio_path = output.with_extension("mp3");
                std::fs::write(&audio_path, &audio)?;
                info!("오디오 저장: {:?} ({} bytes)", audio_path, audio.len());
            }
        }
    }

    Ok(())
}
