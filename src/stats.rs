//! 세션 통계

use std::time::{Duration, Instant};

/// 스트리밍 세션 통계
///
/// 복구 가능한 이상 상태(단일 패킷 CRC 불일치, 윈도우 밖 패킷, 중복)는
/// 세션을 끊지 않고 여기 누적된다.
#[derive(Debug, Clone)]
pub struct StreamStats {
    /// 세션 시작 시간
    pub started_at: Instant,

    /// 처리한 패킷 수
    pub packets: u64,

    /// 처리한 바이트 수
    pub bytes: u64,

    /// CRC 불일치로 버린 패킷
    pub crc_errors: u64,

    /// 형식 불량(잘림, 길이 불일치)으로 버린 패킷
    pub malformed_packets: u64,

    /// 재정렬 윈도우 밖이라 버린 패킷
    pub stale_packets: u64,

    /// 중복 수신 청크
    pub duplicate_chunks: u64,

    /// 전달 완료 프레임
    pub frames_delivered: u64,

    /// 손실 처리 프레임
    pub frames_lost: u64,

    /// FEC로 복구한 청크
    pub fec_recoveries: u64,

    /// SYNC 패킷 수
    pub sync_packets: u64,

    /// 알 수 없는 타입 패킷
    pub unknown_packets: u64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            packets: 0,
            bytes: 0,
            crc_errors: 0,
            malformed_packets: 0,
            stale_packets: 0,
            duplicate_chunks: 0,
            frames_delivered: 0,
            frames_lost: 0,
            fec_recoveries: 0,
            sync_packets: 0,
            unknown_packets: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 전체 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / elapsed
    }

    /// 프레임 손실률
    pub fn frame_loss_rate(&self) -> f64 {
        let total = self.frames_delivered + self.frames_lost;
        if total == 0 {
            return 0.0;
        }
        self.frames_lost as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Frames: {} delivered, {} lost | FEC: {} | CRC errors: {} | Stale: {} | Throughput: {:.2} MB/s",
            self.elapsed().as_secs_f64(),
            self.frames_delivered,
            self.frames_lost,
            self.fec_recoveries,
            self.crc_errors,
            self.stale_packets,
            self.throughput() / 1_000_000.0,
        )
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}
