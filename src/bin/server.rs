//! Sanchez 스트림 서버 - .sanchez 파일을 네트워크로 송출
//!
//! TCP / UDP / 멀티캐스트 / 브로드캐스트 네 모드, 위성 모드(FEC) 지원.
//! 같은 이름의 .mp3가 옆에 있으면 오디오로 함께 내보낸다.
//!
//! 사용법:
//!   cargo run --release --bin sanchez_server -- --file video.sanchez [OPTIONS]
//!
//! 예시:
//!   # TCP 기본 송출
//!   cargo run --release --bin sanchez_server -- -f video.sanchez
//!
//!   # 위성 멀티캐스트 반복 송출
//!   cargo run --release --bin sanchez_server -- -f video.sanchez -m multicast --satellite --loop

use std::path::PathBuf;

use bytes::Bytes;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sanchez::{
    ContainerReader, SanchezStreamServer, StreamMode, StreamOptions, DEFAULT_PORT,
};

/// 서버 CLI 설정
struct ServeConfig {
    file: Option<PathBuf>,
    audio: Option<PathBuf>,
    host: Option<String>,
    port: u16,
    mode: StreamMode,
    loop_playback: bool,
    satellite: bool,
    fps: Option<f64>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            file: None,
            audio: None,
            host: None,
            port: DEFAULT_PORT,
            mode: StreamMode::TcpUnicast,
            loop_playback: false,
            satellite: false,
            fps: None,
        }
    }
}

impl ServeConfig {
    /// 모드별 기본 호스트
    fn host(&self) -> String {
        if let Some(host) = &self.host {
            return host.clone();
        }
        match self.mode {
            StreamMode::UdpMulticast => "239.0.0.1".to_string(),
            StreamMode::UdpBroadcast => "255.255.255.255".to_string(),
            _ => "0.0.0.0".to_string(),
        }
    }
}

fn parse_args() -> ServeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--audio" | "-a" => {
                if i + 1 < args.len() {
                    config.audio = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--host" | "-H" => {
                if i + 1 < args.len() {
                    config.host = Some(args[i + 1].clone());
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
            "--fps" => {
                if i + 1 < args.len() {
                    config.fps = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--loop" => config.loop_playback = true,
            "--satellite" => config.satellite = true,
            "--help" | "-h" => {
                println!(
                    r#"Sanchez Stream Server - .sanchez 파일 송출

사용법:
  cargo run --release --bin sanchez_server -- --file <PATH> [OPTIONS]

옵션:
  -f, --file <PATH>     송출할 .sanchez 파일
  -a, --audio <PATH>    함께 보낼 mp3 (기본: 같은 이름의 .mp3 자동 탐색)
  -H, --host <ADDR>     바인드/대상 주소 (tcp 기본 0.0.0.0, multicast 기본 239.0.0.1)
  -p, --port <PORT>     포트 (기본: 9999)
  -m, --mode <MODE>     tcp | udp | multicast | broadcast (기본: tcp)
  --fps <N>             UDP 페이싱 fps 강제 (기본: 메타데이터에서 유도)
  --loop                반복 송출
  --satellite           위성 모드 (1400B 청크 + XOR FEC)
  -h, --help            이 도움말 출력

예시:
  # TCP 송출
  cargo run --release --bin sanchez_server -- -f video.sanchez

  # 위성 멀티캐스트 반복 송출
  cargo run --release --bin sanchez_server -- -f video.sanchez -m multicast --satellite --loop
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

    let serve_config = parse_args();
    let Some(file) = serve_config.file.clone() else {
        eprintln!("--file <PATH> 필요 (--help 참고)");
        std::process::exit(1);
    };

    let reader = ContainerReader::open(&file)?;
    info!("{}", reader.info());
    let metadata = reader.metadata().clone();
    let store = reader.read_all()?;

    // 오디오: 명시 경로 우선, 없으면 같은 이름의 .mp3 탐색
    let audio_path = serve_config
        .audio
        .clone()
        .or_else(|| {
            let sibling = file.with_extension("mp3");
            sibling.exists().then_some(sibling)
        });
    let audio = match audio_path {
        Some(path) => {
            info!("오디오 로드: {:?}", path);
            Some(Bytes::from(std::fs::read(path)?))
        }
        None => None,
    };

    let mut options = if serve_config.satellite {
        StreamOptions::satellite_mode()
    } else {
        StreamOptions::default()
    };
    options.loop_playback = serve_config.loop_playback;
    options.fps = serve_config.fps;

    let host = serve_config.host();
    info!(
        "송출 시작: {:?} {}:{} | frames {} | loop {} | satellite {}",
        serve_config.mode,
        host,
        serve_config.port,
        store.len(),
        serve_config.loop_playback,
        serve_config.satellite,
    );

    let server = SanchezStreamServer::with_options(serve_config.mode, options);
    if let Err(e) = server
        .stream(&store, &metadata, audio, &host, serve_config.port)
        .await
    {
        warn!("송출 종료: {}", e);
        std::process::exit(1);
    }

    info!("송출 완료");
    Ok(())
}
