//! 와이어 패킷 코덱
//!
//! 고정 빅엔디언 레이아웃:
//!
//! ```text
//! magic(4) ‖ version(1) ‖ type(1) ‖ seq(4) ‖ ts_ns(8) ‖ payload_len(4) ‖ payload ‖ crc32(4)
//! ```
//!
//! CRC32는 CRC 필드를 제외한 전체 바이트를 대상으로 계산한다.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::crc32;
use crate::{Error, Result, MAGIC, PACKET_HEADER_LEN, PROTOCOL_VERSION};

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// 메타데이터 JSON (0x01)
    Metadata,
    /// 설정 라인 15 ASCII 바이트 (0x02)
    Config,
    /// 프레임 시작 (0x10)
    FrameStart,
    /// 프레임 청크 (0x11)
    FrameChunk,
    /// 프레임 끝 (0x12)
    FrameEnd,
    /// 동기화 비콘 (0x20)
    Sync,
    /// XOR 패리티 (0x30)
    FecData,
    /// 오디오 설정 (0x40)
    AudioConfig,
    /// 오디오 청크 (0x41)
    AudioChunk,
    /// 스트림 종료 (0xFF)
    EndStream,
    /// 알 수 없는 타입 (비치명, 무시 대상)
    Unknown(u8),
}

impl PacketType {
    pub fn code(self) -> u8 {
        match self {
            PacketType::Metadata => 0x01,
            PacketType::Config => 0x02,
            PacketType::FrameStart => 0x10,
            PacketType::FrameChunk => 0x11,
            PacketType::FrameEnd => 0x12,
            PacketType::Sync => 0x20,
            PacketType::FecData => 0x30,
            PacketType::AudioConfig => 0x40,
            PacketType::AudioChunk => 0x41,
            PacketType::EndStream => 0xFF,
            PacketType::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => PacketType::Metadata,
            0x02 => PacketType::Config,
            0x10 => PacketType::FrameStart,
            0x11 => PacketType::FrameChunk,
            0x12 => PacketType::FrameEnd,
            0x20 => PacketType::Sync,
            0x30 => PacketType::FecData,
            0x40 => PacketType::AudioConfig,
            0x41 => PacketType::AudioChunk,
            0xFF => PacketType::EndStream,
            other => PacketType::Unknown(other),
        }
    }
}

/// 디코드된 패킷
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub seq: u32,
    pub ts_ns: u64,
    pub payload: Bytes,
}

impl Packet {
    /// 패킷 인코드: 헤더 + 페이로드 + CRC32
    pub fn encode(packet_type: PacketType, seq: u32, ts_ns: u64, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + payload.len() + 4);
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(packet_type.code());
        buf.put_u32(seq);
        buf.put_u64(ts_ns);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        let crc = crc32(&buf);
        buf.put_u32(crc);
        buf.freeze()
    }

    /// 패킷 디코드. 입력 전체가 정확히 한 패킷이어야 한다.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PACKET_HEADER_LEN + 4 {
            return Err(Error::Truncated {
                needed: PACKET_HEADER_LEN + 4,
                got: bytes.len(),
            });
        }

        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != MAGIC {
            return Err(Error::BadMagic { got: magic });
        }

        let version = bytes[4];
        if version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let packet_type = PacketType::from_code(bytes[5]);
        let seq = be_u32(&bytes[6..10]);
        let ts_ns = be_u64(&bytes[10..18]);
        let payload_len = be_u32(&bytes[18..22]) as usize;

        let total = PACKET_HEADER_LEN + payload_len + 4;
        if bytes.len() < total {
            return Err(Error::Truncated {
                needed: total,
                got: bytes.len(),
            });
        }
        if bytes.len() > total {
            return Err(Error::LengthMismatch {
                expected: total,
                got: bytes.len(),
            });
        }

        let crc_offset = PACKET_HEADER_LEN + payload_len;
        let expected = be_u32(&bytes[crc_offset..crc_offset + 4]);
        let got = crc32(&bytes[..crc_offset]);
        if got != expected {
            return Err(Error::ChecksumMismatch { expected, got });
        }

        Ok(Self {
            packet_type,
            seq,
            ts_ns,
            payload: Bytes::copy_from_slice(&bytes[PACKET_HEADER_LEN..crc_offset]),
        })
    }
}

/// FRAME_START 페이로드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStart {
    pub frame_index: u32,
    pub total_bytes: u32,
    pub chunk_count: u32,
}

impl FrameStart {
    pub fn encode(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&self.frame_index.to_be_bytes());
        buf[4..8].copy_from_slice(&self.total_bytes.to_be_bytes());
        buf[8..12].copy_from_slice(&self.chunk_count.to_be_bytes());
        buf
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() != 12 {
            return Err(Error::MalformedPayload {
                packet_type: PacketType::FrameStart,
            });
        }
        Ok(Self {
            frame_index: be_u32(&payload[0..4]),
            total_bytes: be_u32(&payload[4..8]),
            chunk_count: be_u32(&payload[8..12]),
        })
    }
}

/// FRAME_END 페이로드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEnd {
    pub frame_index: u32,
    pub frame_crc32: u32,
}

impl FrameEnd {
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.frame_index.to_be_bytes());
        buf[4..8].copy_from_slice(&self.frame_crc32.to_be_bytes());
        buf
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() != 8 {
            return Err(Error::MalformedPayload {
                packet_type: PacketType::FrameEnd,
            });
        }
        Ok(Self {
            frame_index: be_u32(&payload[0..4]),
            frame_crc32: be_u32(&payload[4..8]),
        })
    }
}

/// SYNC 페이로드
///
/// `server_ts_ms`는 벽시계(Unix epoch 기준 밀리초). 헤더 `ts_ns`는 단조 시계라서
/// 수신측 드리프트 판단용 벽시계는 여기 실린다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncInfo {
    pub server_ts_ms: u64,
    pub frame_index: u32,
}

impl SyncInfo {
    pub fn encode(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..8].copy_from_slice(&self.server_ts_ms.to_be_bytes());
        buf[8..12].copy_from_slice(&self.frame_index.to_be_bytes());
        buf
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() != 12 {
            return Err(Error::MalformedPayload {
                packet_type: PacketType::Sync,
            });
        }
        Ok(Self {
            server_ts_ms: be_u64(&payload[0..8]),
            frame_index: be_u32(&payload[8..12]),
        })
    }
}

/// AUDIO_CONFIG 페이로드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInfo {
    pub codec_tag: u32,
    pub total_bytes: u32,
}

impl AudioInfo {
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.codec_tag.to_be_bytes());
        buf[4..8].copy_from_slice(&self.total_bytes.to_be_bytes());
        buf
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() != 8 {
            return Err(Error::MalformedPayload {
                packet_type: PacketType::AudioConfig,
            });
        }
        Ok(Self {
            codec_tag: be_u32(&payload[0..4]),
            total_bytes: be_u32(&payload[4..8]),
        })
    }
}

/// FEC_DATA 페이로드
///
/// `group_id`는 그룹 첫 멤버의 chunk_index. 멤버십은 한 프레임 안에서
/// `[group_id, group_id + member_count)`로 자기 기술된다. 패리티는 프리픽스를
/// 포함한 청크 페이로드 전체의 XOR이며 짧은 멤버는 `member_length`까지
/// 0으로 패딩한 것으로 본다.
#[derive(Debug, Clone)]
pub struct FecData {
    pub group_id: u32,
    pub member_count: u32,
    pub member_length: u32,
    pub parity: Bytes,
}

impl FecData {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.parity.len());
        buf.put_u32(self.group_id);
        buf.put_u32(self.member_count);
        buf.put_u32(self.member_length);
        buf.put_slice(&self.parity);
        buf.freeze()
    }

    pub fn parse(payload: &Bytes) -> Result<Self> {
        if payload.len() < 12 {
            return Err(Error::MalformedPayload {
                packet_type: PacketType::FecData,
            });
        }
        Ok(Self {
            group_id: be_u32(&payload[0..4]),
            member_count: be_u32(&payload[4..8]),
            member_length: be_u32(&payload[8..12]),
            parity: payload.slice(12..),
        })
    }
}

/// FRAME_CHUNK 페이로드 조립: `(frame_index, chunk_index)` 프리픽스 + 데이터
pub fn encode_chunk_payload(frame_index: u32, chunk_index: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + data.len());
    buf.put_u32(frame_index);
    buf.put_u32(chunk_index);
    buf.put_slice(data);
    buf.freeze()
}

/// FRAME_CHUNK 페이로드 분해 → (frame_index, chunk_index, 데이터)
pub fn parse_chunk_payload(payload: &Bytes) -> Result<(u32, u32, Bytes)> {
    if payload.len() < 8 {
        return Err(Error::MalformedPayload {
            packet_type: PacketType::FrameChunk,
        });
    }
    Ok((
        be_u32(&payload[0..4]),
        be_u32(&payload[4..8]),
        payload.slice(8..),
    ))
}

/// AUDIO_CHUNK 페이로드 조립: offset 프리픽스 + 데이터
pub fn encode_audio_payload(offset: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u32(offset);
    buf.put_slice(data);
    buf.freeze()
}

/// AUDIO_CHUNK 페이로드 분해 → (offset, 데이터)
pub fn parse_audio_payload(payload: &Bytes) -> Result<(u32, Bytes)> {
    if payload.len() < 4 {
        return Err(Error::MalformedPayload {
            packet_type: PacketType::AudioChunk,
        });
    }
    Ok((be_u32(&payload[0..4]), payload.slice(4..)))
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
