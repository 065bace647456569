//! # Sanchez
//!
//! `.sanchez` 비디오 컨테이너 + 전용 스트리밍 프로토콜
//!
//! ## 핵심 특징
//! - **자기 기술 컨테이너**: 메타데이터 JSON / 고정폭 설정 라인 / 프레임 라인 3구역 텍스트 포맷
//! - **2가지 프레임 인코딩**: zlib+base64 압축, ASCII hex 비압축 (라인 단위 혼용 허용)
//! - **4가지 전송 경로**: TCP 유니캐스트, UDP 유니캐스트 / 멀티캐스트 / 브로드캐스트
//! - **위성 모드**: 1400B 청크 + XOR 패리티 FEC로 그룹당 단일 청크 손실 복구
//! - **재조립 엔진**: 재정렬 윈도우, 순서 보장 전달, 손실 프레임 마커
//! - **백프레셔**: TCP 흐름 제어, 유한 채널 기반 소비 속도 조절

pub mod client;
pub mod codec;
pub mod config;
pub mod container;
pub mod error;
pub mod frame;
pub mod packet;
pub mod player;
pub mod server;
pub mod stats;
pub mod transport;

pub use client::{FrameReceiver, SanchezStreamClient, StreamEvent};
pub use config::StreamOptions;
pub use container::{ContainerReader, SanchezConfig, SanchezMetadata};
pub use error::{Error, Result};
pub use frame::{Frame, FrameStore};
pub use packet::{Packet, PacketType};
pub use player::{PlaybackScheduler, PlaybackState};
pub use server::SanchezStreamServer;
pub use stats::StreamStats;
pub use transport::StreamMode;

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 매직 넘버 (패킷 식별용)
pub const MAGIC: [u8; 4] = *b"SANC";

/// 패킷 헤더 길이 (CRC 제외, 바이트)
pub const PACKET_HEADER_LEN: usize = 22;

/// 기본 청크 크기 (유니캐스트, 바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// 위성 모드 청크 크기 (바이트)
pub const SATELLITE_CHUNK_SIZE: usize = 1400;

/// 기본 FEC 그룹 크기 (청크 수)
pub const DEFAULT_FEC_GROUP: usize = 8;

/// 재정렬 허용 윈도우 (최대 시퀀스 기준 뒤쪽 허용 폭)
pub const REORDER_WINDOW: u32 = 1024;

/// 기본 포트
pub const DEFAULT_PORT: u16 = 9999;

/// 메타데이터로 fps를 알 수 없을 때의 기본값
pub const DEFAULT_FPS: f64 = 24.0;

/// 오디오 코덱 태그 ("MP3 ")
pub const AUDIO_CODEC_MP3: u32 = 0x4D50_3320;
