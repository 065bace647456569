//! 스트림 서버
//!
//! 프레임 저장소를 순회하며 `.sanchez` 스트림 세션을 송출한다.
//!
//! - TCP: accept 루프, 클라이언트마다 시퀀스 0부터 독립 세션 태스크
//! - UDP 유니캐스트/멀티캐스트/브로드캐스트: 단일 송신 경로 + fps 페이싱
//!
//! 세션 순서: METADATA → CONFIG → (AUDIO_CONFIG) → 프레임별
//! FRAME_START / FRAME_CHUNK* / (위성: FEC 플러시) / FRAME_END, 오디오 청크
//! 인터리브, SYNC는 `sync_interval`마다, 비루프 완주 후 END_STREAM.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::StreamOptions;
use crate::container::{SanchezConfig, SanchezMetadata};
use crate::frame::FrameStore;
use crate::packet::{
    self, AudioInfo, FecData, FrameEnd, FrameStart, Packet, PacketType, SyncInfo,
};
use crate::transport::{tcp_send, StreamMode, UdpEmitter};
use crate::{Result, AUDIO_CODEC_MP3, DEFAULT_FPS};

/// 스트림 서버
pub struct SanchezStreamServer {
    mode: StreamMode,
    options: StreamOptions,
    running: Arc<AtomicBool>,
}

impl SanchezStreamServer {
    pub fn new(mode: StreamMode) -> Self {
        Self::with_options(mode, StreamOptions::default())
    }

    pub fn with_options(mode: StreamMode, options: StreamOptions) -> Self {
        Self {
            mode,
            options,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// 송출 중단 요청
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 스트리밍 시작. 비루프 완주 또는 `stop()`까지 블록.
    ///
    /// TCP는 accept 루프가 `stop()`까지 돌고, 접속마다 전체 세션을 따로 내보낸다.
    pub async fn stream(
        &self,
        store: &FrameStore,
        metadata: &SanchezMetadata,
        audio: Option<Bytes>,
        host: &str,
        port: u16,
    ) -> Result<()> {
        let source = Arc::new(PreparedSource::build(store, metadata, audio, &self.options)?);
        self.running.store(true, Ordering::SeqCst);

        let result = match self.mode {
            StreamMode::TcpUnicast => self.stream_tcp(source, host, port).await,
            _ => self.stream_udp(source, host, port).await,
        };
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn stream_tcp(&self, source: Arc<PreparedSource>, host: &str, port: u16) -> Result<()> {
        let listener = TcpListener::bind((host, port)).await?;
        info!("sanchez stream server (tcp) listening on {}:{}", host, port);

        while self.running.load(Ordering::SeqCst) {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
            };
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept 실패: {}", e);
                    continue;
                }
            };
            info!("클라이언트 연결: {}", addr);

            let source = source.clone();
            let options = self.options.clone();
            let running = self.running.clone();
            tokio::spawn(async move {
                match run_tcp_session(stream, source, options, running).await {
                    Ok(()) => info!("클라이언트 {} 세션 완료", addr),
                    Err(e) => warn!("클라이언트 {} 이탈: {}", addr, e),
                }
            });
        }
        Ok(())
    }

    async fn stream_udp(&self, source: Arc<PreparedSource>, host: &str, port: u16) -> Result<()> {
        let emitter = UdpEmitter::bind(self.mode, host, port).await?;
        info!(
            "sanchez stream server ({:?}) -> {}:{}, {} frames, {:.1} fps",
            self.mode,
            host,
            port,
            source.config.frame_count,
            1.0 / source.frame_period.as_secs_f64().max(f64::EPSILON),
        );

        let mut session = Session::new(
            PacketSink::Udp(&emitter),
            &source,
            &self.options,
            self.running.clone(),
            true,
        );
        session.run().await
    }
}

async fn run_tcp_session(
    mut stream: TcpStream,
    source: Arc<PreparedSource>,
    options: StreamOptions,
    running: Arc<AtomicBool>,
) -> Result<()> {
    {
        let mut session =
            Session::new(PacketSink::Tcp(&mut stream), &source, &options, running, false);
        session.run().await?;
    }
    stream.flush().await?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// 세션 전체에서 공유하는 사전 준비 데이터.
/// 프레임 deflate와 CRC는 한 번만 계산해 TCP 다중 세션이 공유한다.
struct PreparedSource {
    metadata_json: Bytes,
    config_line: Bytes,
    config: SanchezConfig,
    /// (deflate 바이트, 그 CRC32)
    frames: Vec<(Bytes, u32)>,
    /// (오프셋, 데이터)
    audio_chunks: Vec<(u32, Bytes)>,
    audio_total: u32,
    frame_period: Duration,
}

impl PreparedSource {
    fn build(
        store: &FrameStore,
        metadata: &SanchezMetadata,
        audio: Option<Bytes>,
        options: &StreamOptions,
    ) -> Result<Self> {
        let config = SanchezConfig::new(store.width(), store.height(), store.len() as u32)?;
        let metadata_json = Bytes::from(metadata.to_json_line()?);
        let config_line = Bytes::from(config.encode());

        let frames = store
            .iter()
            .map(|frame| {
                let deflated = codec::deflate(frame.data())?;
                let crc = codec::crc32(&deflated);
                Ok((Bytes::from(deflated), crc))
            })
            .collect::<Result<Vec<_>>>()?;

        let chunk_size = options.effective_chunk_size();
        let (audio_chunks, audio_total) = match &audio {
            Some(blob) => {
                let chunks = blob
                    .chunks(chunk_size)
                    .enumerate()
                    .map(|(i, data)| {
                        let offset = (i * chunk_size) as u32;
                        (offset, Bytes::copy_from_slice(data))
                    })
                    .collect();
                (chunks, blob.len() as u32)
            }
            None => (Vec::new(), 0),
        };

        let fps = options
            .fps
            .or_else(|| metadata.fps(config.frame_count))
            .filter(|f| *f > 0.0)
            .unwrap_or(DEFAULT_FPS);

        Ok(Self {
            metadata_json,
            config_line,
            config,
            frames,
            audio_chunks,
            audio_total,
            frame_period: Duration::from_secs_f64(1.0 / fps),
        })
    }

    fn has_audio(&self) -> bool {
        self.audio_total > 0
    }
}

enum PacketSink<'a> {
    Tcp(&'a mut TcpStream),
    Udp(&'a UdpEmitter),
}

impl PacketSink<'_> {
    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        match self {
            PacketSink::Tcp(stream) => tcp_send(stream, packet).await,
            PacketSink::Udp(emitter) => emitter.send(packet).await,
        }
    }
}

/// 단일 세션의 송출 상태
struct Session<'a> {
    sink: PacketSink<'a>,
    source: &'a PreparedSource,
    options: &'a StreamOptions,
    running: Arc<AtomicBool>,
    /// UDP에서만 프레임 주기 페이싱
    pace: bool,
    seq: u32,
    epoch: Instant,
    last_sync: Instant,
    current_frame: u32,
    // FEC 누적 상태 (프레임 경계에서 항상 플러시)
    parity: Vec<u8>,
    group_start: u32,
    group_members: u32,
}

impl<'a> Session<'a> {
    fn new(
        sink: PacketSink<'a>,
        source: &'a PreparedSource,
        options: &'a StreamOptions,
        running: Arc<AtomicBool>,
        pace: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            sink,
            source,
            options,
            running,
            pace,
            seq: 0,
            epoch: now,
            last_sync: now,
            current_frame: 0,
            parity: Vec::new(),
            group_start: 0,
            group_members: 0,
        }
    }

    async fn run(&mut self) -> Result<()> {
        self.emit(PacketType::Metadata, &self.source.metadata_json.clone())
            .await?;
        self.emit(PacketType::Config, &self.source.config_line.clone())
            .await?;

        if self.source.has_audio() {
            let info = AudioInfo {
                codec_tag: AUDIO_CODEC_MP3,
                total_bytes: self.source.audio_total,
            };
            self.emit(PacketType::AudioConfig, &info.encode()).await?;
        }

        let frame_count = self.source.frames.len();
        let mut next_audio = 0usize;
        let mut deadline = Instant::now();

        if frame_count == 0 {
            self.emit_audio_range(next_audio, self.source.audio_chunks.len())
                .await?;
        } else {
            'stream: loop {
                for index in 0..frame_count {
                    if !self.running.load(Ordering::SeqCst) {
                        debug!("세션 중단 요청, 송출 종료");
                        return Ok(());
                    }
                    self.current_frame = index as u32;
                    self.emit_frame(index as u32).await?;

                    // 오디오 인터리브: 남은 프레임에 고르게 분배 (첫 사이클만)
                    let remaining = self.source.audio_chunks.len() - next_audio;
                    if remaining > 0 {
                        let frames_left = frame_count - index;
                        let batch = (remaining + frames_left - 1) / frames_left;
                        self.emit_audio_range(next_audio, next_audio + batch).await?;
                        next_audio += batch;
                    }

                    self.maybe_sync().await?;

                    if self.pace {
                        deadline += self.source.frame_period;
                        tokio::time::sleep_until(deadline.into()).await;
                    }
                }
                if !self.options.loop_playback {
                    break 'stream;
                }
                debug!("루프 재시작 (seq {} 이어서)", self.seq);
            }
        }

        self.emit(PacketType::EndStream, &[]).await?;
        Ok(())
    }

    async fn emit(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        let ts_ns = self.epoch.elapsed().as_nanos() as u64;
        let bytes = Packet::encode(packet_type, self.seq, ts_ns, payload);
        self.seq = self.seq.wrapping_add(1);
        self.sink.send(&bytes).await
    }

    /// `sync_interval`이 지났으면 SYNC 비콘 발행
    async fn maybe_sync(&mut self) -> Result<()> {
        if self.last_sync.elapsed() < self.options.sync_interval {
            return Ok(());
        }
        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let sync = SyncInfo {
            server_ts_ms: wall_ms,
            frame_index: self.current_frame,
        };
        self.emit(PacketType::Sync, &sync.encode()).await?;
        self.last_sync = Instant::now();
        Ok(())
    }

    async fn emit_frame(&mut self, index: u32) -> Result<()> {
        let (deflated, crc) = self.source.frames[index as usize].clone();
        let chunk_size = self.options.effective_chunk_size();
        let chunk_count = ((deflated.len() + chunk_size - 1) / chunk_size).max(1) as u32;

        let start = FrameStart {
            frame_index: index,
            total_bytes: deflated.len() as u32,
            chunk_count,
        };
        self.emit(PacketType::FrameStart, &start.encode()).await?;

        for (chunk_index, chunk) in deflated.chunks(chunk_size).enumerate() {
            let payload = packet::encode_chunk_payload(index, chunk_index as u32, chunk);
            if self.options.satellite {
                self.fec_accumulate(chunk_index as u32, &payload);
            }
            self.emit(PacketType::FrameChunk, &payload).await?;

            if self.options.satellite && self.group_members as usize >= self.options.fec_group {
                self.fec_flush().await?;
            }
            self.maybe_sync().await?;
        }

        // 프레임 경계: 부분 그룹도 FRAME_END 전에 내보낸다
        if self.options.satellite {
            self.fec_flush().await?;
        }

        let end = FrameEnd {
            frame_index: index,
            frame_crc32: crc,
        };
        self.emit(PacketType::FrameEnd, &end.encode()).await
    }

    async fn emit_audio_range(&mut self, from: usize, to: usize) -> Result<()> {
        let to = to.min(self.source.audio_chunks.len());
        for i in from..to {
            let (offset, data) = self.source.audio_chunks[i].clone();
            let payload = packet::encode_audio_payload(offset, &data);
            self.emit(PacketType::AudioChunk, &payload).await?;
        }
        Ok(())
    }

    fn fec_accumulate(&mut self, chunk_index: u32, payload: &[u8]) {
        if self.group_members == 0 {
            self.group_start = chunk_index;
            self.parity.clear();
        }
        if payload.len() > self.parity.len() {
            self.parity.resize(payload.len(), 0);
        }
        for (acc, byte) in self.parity.iter_mut().zip(payload) {
            *acc ^= byte;
        }
        self.group_members += 1;
    }

    async fn fec_flush(&mut self) -> Result<()> {
        if self.group_members == 0 {
            return Ok(());
        }
        let fec = FecData {
            group_id: self.group_start,
            member_count: self.group_members,
            member_length: self.parity.len() as u32,
            parity: Bytes::from(std::mem::take(&mut self.parity)),
        };
        self.group_members = 0;
        self.emit(PacketType::FecData, &fec.encode()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn gradient_store(width: u32, height: u32, count: usize) -> FrameStore {
        let mut store = FrameStore::new(width, height);
        for i in 0..count {
            let data: Vec<u8> = (0..width as usize * height as usize * 3)
                .map(|p| ((p + i * 37) % 256) as u8)
                .collect();
            store
                .push(Frame::from_rgb(width, height, Bytes::from(data)).unwrap())
                .unwrap();
        }
        store
    }

    #[test]
    fn test_prepared_source_fps_resolution() {
        let store = gradient_store(4, 4, 10);
        let metadata = SanchezMetadata {
            title: "t".to_string(),
            creator: "c".to_string(),
            created_at: "2026-01-02T01:30:43Z".to_string(),
            seconds: "0.5".to_string(),
        };

        // 메타데이터 유도: 10프레임 / 0.5초 = 20fps
        let source =
            PreparedSource::build(&store, &metadata, None, &StreamOptions::default()).unwrap();
        assert_eq!(source.frame_period, Duration::from_millis(50));

        // 명시 옵션이 우선
        let options = StreamOptions {
            fps: Some(10.0),
            ..StreamOptions::default()
        };
        let source = PreparedSource::build(&store, &metadata, None, &options).unwrap();
        assert_eq!(source.frame_period, Duration::from_millis(100));

        // 둘 다 없으면 24fps
        let blank = SanchezMetadata {
            seconds: "0".to_string(),
            ..metadata
        };
        let source =
            PreparedSource::build(&store, &blank, None, &StreamOptions::default()).unwrap();
        assert_eq!(source.frame_period, Duration::from_secs_f64(1.0 / 24.0));
    }

    #[test]
    fn test_prepared_source_audio_chunking() {
        let store = gradient_store(2, 2, 1);
        let metadata = SanchezMetadata::new("t", "c", 1.0);
        let audio = Bytes::from(vec![0xABu8; 3000]);
        let options = StreamOptions {
            chunk_size: 1400,
            ..StreamOptions::default()
        };

        let source = PreparedSource::build(&store, &metadata, Some(audio), &options).unwrap();
        assert_eq!(source.audio_total, 3000);
        assert_eq!(source.audio_chunks.len(), 3);
        assert_eq!(source.audio_chunks[0].0, 0);
        assert_eq!(source.audio_chunks[1].0, 1400);
        assert_eq!(source.audio_chunks[2].0, 2800);
        assert_eq!(source.audio_chunks[2].1.len(), 200);
    }

    #[test]
    fn test_frames_are_deflated_with_crc() {
        let store = gradient_store(4, 4, 2);
        let metadata = SanchezMetadata::new("t", "c", 1.0);
        let source =
            PreparedSource::build(&store, &metadata, None, &StreamOptions::default()).unwrap();

        for (i, (deflated, crc)) in source.frames.iter().enumerate() {
            assert_eq!(codec::crc32(deflated), *crc);
            let inflated = codec::inflate(deflated).unwrap();
            assert_eq!(inflated, store.get(i).unwrap().data());
        }
    }
}
