//! `.sanchez` 컨테이너 코덱
//!
//! 라인 기반 3구역 포맷:
//!
//! ```text
//! 1행: 메타데이터 JSON (한 줄)
//! 2행: 설정 라인 WWWWHHHHFFFFFFF (15자, zero-pad)
//! 3행~: 프레임 라인 (압축 base64 또는 `{..}` hex), 각 줄 `\n` 종결
//! ```
//!
//! 쓰기 인코딩은 파일 전체에 대해 단일 플래그로 결정되지만, 읽기는 줄마다
//! 첫 문자로 분기하므로 혼용 파일도 읽는다.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::frame::{Frame, FrameStore};
use crate::{Error, Result};

/// 해상도 한 축의 최대값
pub const MAX_DIMENSION: u32 = 9999;
/// 프레임 수 최대값
pub const MAX_FRAME_COUNT: u32 = 9_999_999;
/// 설정 라인 길이 (바이트)
pub const CONFIG_LINE_LEN: usize = 15;

/// 파일 메타데이터 (1행)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanchezMetadata {
    /// 제목
    pub title: String,
    /// 제작자
    pub creator: String,
    /// 생성 시각 (RFC3339 UTC)
    pub created_at: String,
    /// 재생 길이 (초, 십진 문자열)
    pub seconds: String,
}

impl SanchezMetadata {
    /// 현재 시각을 찍어 새 메타데이터 생성
    pub fn new(title: impl Into<String>, creator: impl Into<String>, seconds: f64) -> Self {
        Self {
            title: title.into(),
            creator: creator.into(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            seconds: format!("{}", seconds),
        }
    }

    /// 재생 길이 (초). 파싱 불가 또는 음수면 None.
    pub fn duration_seconds(&self) -> Option<f64> {
        self.seconds
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|s| s.is_finite() && *s >= 0.0)
    }

    /// 프레임 수 기준 fps. 길이나 프레임 수를 모르면 None.
    pub fn fps(&self, frame_count: u32) -> Option<f64> {
        let secs = self.duration_seconds()?;
        if secs > 0.0 && frame_count > 0 {
            Some(frame_count as f64 / secs)
        } else {
            None
        }
    }

    /// 한 줄 JSON 직렬화 (개행 없음)
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 기하/길이 설정 (2행)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanchezConfig {
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
}

impl SanchezConfig {
    /// 범위 검증을 거친 설정 생성
    pub fn new(width: u32, height: u32, frame_count: u32) -> Result<Self> {
        if width == 0 || width > MAX_DIMENSION {
            return Err(Error::Overflow {
                field: "width",
                value: width as u64,
            });
        }
        if height == 0 || height > MAX_DIMENSION {
            return Err(Error::Overflow {
                field: "height",
                value: height as u64,
            });
        }
        if frame_count > MAX_FRAME_COUNT {
            return Err(Error::Overflow {
                field: "frame_count",
                value: frame_count as u64,
            });
        }
        Ok(Self {
            width,
            height,
            frame_count,
        })
    }

    /// 설정 라인 인코드: width(4) ‖ height(4) ‖ frame_count(7)
    pub fn encode(&self) -> String {
        format!("{:04}{:04}{:07}", self.width, self.height, self.frame_count)
    }

    /// 설정 라인 파싱. 정확히 15자, 숫자만, 공백 비허용.
    pub fn parse(line: &str) -> Result<Self> {
        let bytes = line.as_bytes();
        if bytes.len() != CONFIG_LINE_LEN {
            return Err(Error::InvalidConfig {
                reason: format!("길이 {} != {}", bytes.len(), CONFIG_LINE_LEN),
            });
        }
        if !bytes.iter().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidConfig {
                reason: "숫자 이외 문자 포함".to_string(),
            });
        }

        let width = ascii_digits_to_u32(&bytes[0..4]);
        let height = ascii_digits_to_u32(&bytes[4..8]);
        let frame_count = ascii_digits_to_u32(&bytes[8..15]);

        if width == 0 || height == 0 {
            return Err(Error::UnsupportedGeometry { width, height });
        }
        Ok(Self {
            width,
            height,
            frame_count,
        })
    }

    /// 프레임 한 장의 RGB 바이트 수
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

// 호출 전 is_ascii_digit 검증 전제, 7자리 이하라 오버플로 없음
fn ascii_digits_to_u32(digits: &[u8]) -> u32 {
    digits.iter().fold(0u32, |acc, b| acc * 10 + (b - b'0') as u32)
}

/// 컨테이너 쓰기
///
/// 메타데이터 라인, 설정 라인, 프레임 라인 순서로 기록한다. 각 줄은 `\n`으로
/// 끝난다. 프레임 수가 설정과 다르면 `FrameCountMismatch`.
pub fn write_container<'a, W: Write>(
    sink: &mut W,
    metadata: &SanchezMetadata,
    config: &SanchezConfig,
    frames: impl IntoIterator<Item = &'a Frame>,
    compress: bool,
) -> Result<()> {
    // 직접 구성한 config 값 방어
    SanchezConfig::new(config.width, config.height, config.frame_count)?;

    sink.write_all(metadata.to_json_line()?.as_bytes())?;
    sink.write_all(b"\n")?;
    sink.write_all(config.encode().as_bytes())?;
    sink.write_all(b"\n")?;

    let mut written = 0u32;
    for frame in frames {
        if frame.width() != config.width || frame.height() != config.height {
            return Err(Error::GeometryMismatch {
                expected_width: config.width,
                expected_height: config.height,
                got_width: frame.width(),
                got_height: frame.height(),
            });
        }
        let line = if compress {
            codec::base64_encode(&codec::deflate(frame.data())?)
        } else {
            codec::rgb_to_hex_line(frame.data())
        };
        sink.write_all(line.as_bytes())?;
        sink.write_all(b"\n")?;
        written += 1;
    }

    if written != config.frame_count {
        return Err(Error::FrameCountMismatch {
            expected: config.frame_count,
            got: written,
        });
    }
    sink.flush()?;
    Ok(())
}

/// 프레임 저장소 전체를 컨테이너로 쓰기
pub fn write_store<W: Write>(
    sink: &mut W,
    metadata: &SanchezMetadata,
    store: &FrameStore,
    compress: bool,
) -> Result<()> {
    let config = SanchezConfig::new(store.width(), store.height(), store.len() as u32)?;
    write_container(sink, metadata, &config, store.iter(), compress)
}

/// 헤더 읽기. 정확히 두 줄 소비.
pub fn read_header<R: BufRead>(reader: &mut R) -> Result<(SanchezMetadata, SanchezConfig)> {
    let meta_line = read_line(reader)?.ok_or(Error::MalformedHeader)?;
    let metadata: SanchezMetadata = serde_json::from_str(&meta_line)?;

    let config_line = read_line(reader)?.ok_or(Error::MalformedHeader)?;
    let config = SanchezConfig::parse(&config_line)?;

    Ok((metadata, config))
}

/// 프레임 라인 하나 읽기. EOF면 `None`.
pub fn read_frame<R: BufRead>(reader: &mut R, config: &SanchezConfig) -> Result<Option<Frame>> {
    match read_line(reader)? {
        None => Ok(None),
        Some(line) if line.is_empty() => Ok(None),
        Some(line) => decode_frame_line(&line, config).map(Some),
    }
}

/// 프레임 라인 디코드. 첫 문자로 인코딩 분기.
pub fn decode_frame_line(line: &str, config: &SanchezConfig) -> Result<Frame> {
    let expected = config.frame_bytes();
    let rgb = if line.starts_with('{') {
        decode_hex_line(line, config)?
    } else {
        let deflated = codec::base64_decode(line)?;
        codec::inflate(&deflated)?
    };
    if rgb.len() != expected {
        return Err(Error::ShortFrame {
            expected,
            got: rgb.len(),
        });
    }
    Frame::from_rgb(config.width, config.height, Bytes::from(rgb))
}

fn decode_hex_line(line: &str, config: &SanchezConfig) -> Result<Vec<u8>> {
    let inner = &line[1..];
    let close = inner.find('}').ok_or_else(|| Error::Hex {
        token: "닫는 중괄호 없음".to_string(),
    })?;
    let (body, rest) = inner.split_at(close);
    if !rest[1..].trim_end().is_empty() {
        return Err(Error::TrailingData);
    }

    let pixel_count = config.width as usize * config.height as usize;
    let tokens = body.split(',').count();
    if tokens != pixel_count {
        return Err(Error::ShortFrame {
            expected: pixel_count * 3,
            got: tokens * 3,
        });
    }

    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for token in body.split(',') {
        rgb.extend_from_slice(&codec::hex_token_to_rgb(token)?);
    }
    Ok(rgb)
}

// `\n` 하나를 벗긴 한 줄. EOF면 None.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    let read = reader.read_line(&mut line)?;
    if read == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(Some(line))
}

/// 지연 프레임 반복자 (유한, 재시작 불가)
pub struct FrameIter<R: BufRead> {
    reader: R,
    config: SanchezConfig,
    done: bool,
}

impl<R: BufRead> Iterator for FrameIter<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_frame(&mut self.reader, &self.config) {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// 컨테이너 리더: 헤더를 소비한 뒤 프레임을 순회한다
pub struct ContainerReader<R: BufRead> {
    metadata: SanchezMetadata,
    config: SanchezConfig,
    reader: R,
}

impl ContainerReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: BufRead> ContainerReader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let (metadata, config) = read_header(&mut reader)?;
        Ok(Self {
            metadata,
            config,
            reader,
        })
    }

    pub fn metadata(&self) -> &SanchezMetadata {
        &self.metadata
    }

    pub fn config(&self) -> &SanchezConfig {
        &self.config
    }

    /// 다음 프레임. EOF면 None.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        read_frame(&mut self.reader, &self.config)
    }

    /// 나머지 프레임을 지연 반복자로 소비
    pub fn frames(self) -> FrameIter<R> {
        FrameIter {
            reader: self.reader,
            config: self.config,
            done: false,
        }
    }

    /// 전체 프레임을 메모리로 적재
    pub fn read_all(self) -> Result<FrameStore> {
        let config = self.config;
        let mut store = FrameStore::new(config.width, config.height);
        for frame in self.frames() {
            store.push(frame?)?;
        }
        if store.len() as u32 != config.frame_count {
            return Err(Error::FrameCountMismatch {
                expected: config.frame_count,
                got: store.len() as u32,
            });
        }
        Ok(store)
    }

    /// 사람용 요약 (info 출력)
    pub fn info(&self) -> String {
        let duration = self.metadata.duration_seconds().unwrap_or(0.0);
        let fps = self
            .metadata
            .fps(self.config.frame_count)
            .unwrap_or(crate::DEFAULT_FPS);
        format!(
            "Title: {} | Creator: {} | Created: {} | {}x{} | Frames: {} | {:.2} fps | {:.2}s",
            self.metadata.title,
            self.metadata.creator,
            self.metadata.created_at,
            self.config.width,
            self.config.height,
            self.config.frame_count,
            fps,
            duration,
        )
    }
}
