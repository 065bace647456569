//! 스트리밍 옵션

use std::time::Duration;

use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_FEC_GROUP, SATELLITE_CHUNK_SIZE};

/// 스트리밍 세션 옵션
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// 마지막 프레임 후 처음부터 반복
    pub loop_playback: bool,

    /// 위성 모드: FEC 패리티 발행 + 작은 청크 강제
    pub satellite: bool,

    /// 청크 크기 (바이트). 위성 모드에서는 1400B 상한이 강제된다.
    pub chunk_size: usize,

    /// UDP 페이싱 fps. None이면 메타데이터(초 + 프레임 수)에서 유도, 실패 시 24.
    /// TCP에서는 무시된다 (백프레셔 페이싱).
    pub fps: Option<f64>,

    /// FEC 그룹 크기 (청크 수). 위성 모드가 아니면 무시.
    pub fec_group: usize,

    /// SYNC 비콘 최대 간격
    pub sync_interval: Duration,

    /// 선두 프레임이 후속 완료에 막혔을 때의 대기 한도.
    /// None이면 프레임 주기의 2배, 주기를 모르면 500ms.
    pub max_frame_lag: Option<Duration>,

    /// UDP 수신 버퍼 크기
    pub recv_buffer_size: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            loop_playback: false,
            satellite: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            fps: None,
            fec_group: DEFAULT_FEC_GROUP,
            sync_interval: Duration::from_secs(1),
            max_frame_lag: None,
            recv_buffer_size: 64 * 1024,
        }
    }
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 위성 링크용 프리셋: 작은 청크 + FEC
    pub fn satellite_mode() -> Self {
        Self {
            satellite: true,
            chunk_size: SATELLITE_CHUNK_SIZE,
            ..Self::default()
        }
    }

    /// 실효 청크 크기. 위성 모드는 1400B를 넘지 못한다.
    pub fn effective_chunk_size(&self) -> usize {
        let size = if self.satellite {
            self.chunk_size.min(SATELLITE_CHUNK_SIZE)
        } else {
            self.chunk_size
        };
        size.max(1)
    }

    /// 패킷 수신 타임아웃 (sync_interval × 3)
    pub fn recv_timeout(&self) -> Duration {
        self.sync_interval * 3
    }

    /// 선두 프레임 대기 한도
    pub fn frame_lag(&self, frame_period: Option<Duration>) -> Duration {
        if let Some(lag) = self.max_frame_lag {
            return lag;
        }
        match frame_period {
            Some(period) => period * 2,
            None => Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satellite_chunk_cap() {
        let mut options = StreamOptions::satellite_mode();
        assert_eq!(options.effective_chunk_size(), SATELLITE_CHUNK_SIZE);

        options.chunk_size = 8192;
        assert_eq!(options.effective_chunk_size(), SATELLITE_CHUNK_SIZE);

        options.chunk_size = 512;
        assert_eq!(options.effective_chunk_size(), 512);

        let unicast = StreamOptions::default();
        assert_eq!(unicast.effective_chunk_size(), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_frame_lag_defaults() {
        let options = StreamOptions::default();
        assert_eq!(
            options.frame_lag(Some(Duration::from_millis(40))),
            Duration::from_millis(80)
        );
        assert_eq!(options.frame_lag(None), Duration::from_millis(500));

        let fixed = StreamOptions {
            max_frame_lag: Some(Duration::from_millis(120)),
            ..StreamOptions::default()
        };
        assert_eq!(fixed.frame_lag(None), Duration::from_millis(120));
    }

    #[test]
    fn test_recv_timeout() {
        let options = StreamOptions::default();
        assert_eq!(options.recv_timeout(), Duration::from_secs(3));
    }
}
