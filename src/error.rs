//! 에러 타입 정의

use thiserror::Error;

use crate::packet::PacketType;

/// Sanchez 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("메타데이터 JSON 에러: {0}")]
    Json(#[from] serde_json::Error),

    #[error("헤더 형식 불량 (라인 누락)")]
    MalformedHeader,

    #[error("설정 라인 불량: {reason}")]
    InvalidConfig { reason: String },

    #[error("지원하지 않는 해상도: {width}x{height}")]
    UnsupportedGeometry { width: u32, height: u32 },

    #[error("base64 디코드 에러: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("zlib 처리 실패")]
    Zlib,

    #[error("hex 토큰 불량: {token:?}")]
    Hex { token: String },

    #[error("프레임 길이 불일치: expected {expected} bytes, got {got}")]
    ShortFrame { expected: usize, got: usize },

    #[error("프레임 라인 뒤에 잉여 데이터")]
    TrailingData,

    #[error("프레임 해상도 불일치: expected {expected_width}x{expected_height}, got {got_width}x{got_height}")]
    GeometryMismatch {
        expected_width: u32,
        expected_height: u32,
        got_width: u32,
        got_height: u32,
    },

    #[error("수치 필드 범위 초과: {field}={value}")]
    Overflow { field: &'static str, value: u64 },

    #[error("프레임 수 불일치: config {expected}, got {got}")]
    FrameCountMismatch { expected: u32, got: u32 },

    #[error("유효하지 않은 매직 넘버: {got:02X?}")]
    BadMagic { got: [u8; 4] },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    UnsupportedVersion { expected: u8, got: u8 },

    #[error("패킷 잘림: 최소 {needed} bytes 필요, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("패킷 길이 불일치: expected {expected} bytes, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("페이로드 파싱 실패: {packet_type:?}")]
    MalformedPayload { packet_type: PacketType },

    #[error("전송 채널 종료")]
    TransportClosed,

    #[error("수신 타임아웃")]
    RecvTimeout,

    #[error("유효하지 않은 주소: {0}")]
    InvalidAddress(String),

    #[error("채널 에러")]
    ChannelError,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
