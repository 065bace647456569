//! 코덱 프리미티브
//!
//! RGB <-> hex 토큰, zlib deflate/inflate, base64, CRC32

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::{Error, Result};

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// CRC32 (IEEE) 계산
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// zlib deflate
pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(|_| Error::Zlib)?;
    encoder.finish().map_err(|_| Error::Zlib)
}

/// zlib inflate
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|_| Error::Zlib)?;
    Ok(out)
}

/// base64 인코드 (패딩 포함 표준 알파벳)
pub fn base64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// base64 디코드. 후행 공백은 무시한다.
pub fn base64_decode(text: &str) -> Result<Vec<u8>> {
    Ok(BASE64.decode(text.trim_end())?)
}

/// RGB 픽셀 버퍼를 비압축 프레임 라인으로 인코드
///
/// `{RRGGBB,RRGGBB,...}` 형태, 대문자 hex, row-major 순서.
pub fn rgb_to_hex_line(rgb: &[u8]) -> String {
    debug_assert_eq!(rgb.len() % 3, 0);
    let pixels = rgb.len() / 3;
    let mut line = String::with_capacity(2 + pixels * 7);
    line.push('{');
    for (i, px) in rgb.chunks_exact(3).enumerate() {
        if i > 0 {
            line.push(',');
        }
        for &b in px {
            line.push(HEX_UPPER[(b >> 4) as usize] as char);
            line.push(HEX_UPPER[(b & 0x0F) as usize] as char);
        }
    }
    line.push('}');
    line
}

/// 6자리 hex 토큰을 RGB 3바이트로 파싱 (대소문자 모두 허용)
pub fn hex_token_to_rgb(token: &str) -> Result<[u8; 3]> {
    let bytes = token.as_bytes();
    if bytes.len() != 6 || !bytes.iter().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Hex {
            token: token.to_string(),
        });
    }
    let mut rgb = [0u8; 3];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        rgb[i] = (hex_val(pair[0]) << 4) | hex_val(pair[1]);
    }
    Ok(rgb)
}

// 호출 전 is_ascii_hexdigit 검증 전제
fn hex_val(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}
