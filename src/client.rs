//! 스트림 클라이언트 / 재조립 엔진
//!
//! 수신 패킷을 검증·정렬해 프레임을 복원한다. 전송 계층과 분리된 순수 로직
//! (`Reassembler`)이 핵심이고, 비동기 수신 루프는 그 위에 얹힌다.
//!
//! 불변식:
//! - 프레임은 (사이클, 인덱스) 오름차순으로만 전달된다. 같은 인덱스는 한
//!   사이클에 한 번만 나간다.
//! - 최대 시퀀스보다 `REORDER_WINDOW` 이상 뒤처진 패킷은 버린다.
//! - 선두 프레임이 미완성인 채 후속 프레임이 완성되면 `max_frame_lag`까지
//!   기다린 뒤 손실 처리한다.
//! - 위성 모드 패리티로 그룹당 정확히 1개의 누락 청크를 복구한다. 복구
//!   결과는 내장 프리픽스와 프레임 CRC로 재검증한다.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::StreamOptions;
use crate::container::{SanchezConfig, SanchezMetadata};
use crate::frame::Frame;
use crate::packet::{self, FecData, FrameEnd, FrameStart, Packet, PacketType};
use crate::stats::StreamStats;
use crate::transport::{RecvTransport, StreamMode};
use crate::{Error, Result, REORDER_WINDOW};

/// 완성 프레임 채널 용량 (~2초 분량 @ 24fps). 가득 차면 수신 루프가 멈춰
/// 백프레셔로 작동한다 (UDP는 손실 감수, TCP는 흐름 제어).
const CHANNEL_CAPACITY: usize = 48;

/// 동시 진행 프레임 상한. 넘으면 선두부터 강제 정리한다.
const MAX_PENDING_FRAMES: usize = 64;

/// 보관하는 패리티 레코드 상한
const MAX_PARITY_RECORDS: usize = 64;

/// FRAME_START 누락 자리 표시 상한
const MAX_GAP_PLACEHOLDERS: u32 = 64;

/// 프레임/오디오 크기 방어 상한
const MAX_FRAME_TOTAL_BYTES: u32 = 64 * 1024 * 1024;
const MAX_AUDIO_TOTAL_BYTES: u32 = 256 * 1024 * 1024;

/// 수신 이벤트
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// 완성된 프레임
    Frame { index: u32, frame: Frame },
    /// 복구 불가로 건너뛴 프레임
    FrameLost(u32),
}

/// 완성 프레임 채널
pub type FrameReceiver = mpsc::Receiver<StreamEvent>;

/// 스트림 클라이언트 핸들
pub struct SanchezStreamClient {
    running: Arc<AtomicBool>,
    shared: Arc<SharedState>,
}

struct SharedState {
    metadata: RwLock<Option<SanchezMetadata>>,
    config: RwLock<Option<SanchezConfig>>,
    audio: RwLock<Option<Bytes>>,
    stats: RwLock<StreamStats>,
}

impl SanchezStreamClient {
    /// 수신 시작. (핸들, 완성 프레임 채널) 반환.
    ///
    /// 채널은 END_STREAM, 전송 종료, 수신 타임아웃 중 먼저 오는 것으로 닫힌다.
    pub async fn start(
        mode: StreamMode,
        host: &str,
        port: u16,
        options: StreamOptions,
    ) -> Result<(Self, FrameReceiver)> {
        let transport = RecvTransport::open(mode, host, port).await?;
        info!("sanchez stream client ({:?}) {}:{}", mode, host, port);

        let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(CHANNEL_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(SharedState {
            metadata: RwLock::new(None),
            config: RwLock::new(None),
            audio: RwLock::new(None),
            stats: RwLock::new(StreamStats::new()),
        });

        let loop_running = running.clone();
        let loop_shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = receive_loop(transport, options, &loop_running, &loop_shared, event_tx).await
            {
                warn!("수신 루프 종료: {}", e);
            }
            loop_running.store(false, Ordering::SeqCst);
        });

        Ok((Self { running, shared }, event_rx))
    }

    /// 수신 중단 요청
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> StreamStats {
        self.shared.stats.read().clone()
    }

    /// 수신한 메타데이터 (METADATA 패킷 도착 후)
    pub fn metadata(&self) -> Option<SanchezMetadata> {
        self.shared.metadata.read().clone()
    }

    /// 수신한 설정 (CONFIG 패킷 도착 후)
    pub fn config(&self) -> Option<SanchezConfig> {
        *self.shared.config.read()
    }

    /// 세션 종료 후 조립된 오디오
    pub fn audio(&self) -> Option<Bytes> {
        self.shared.audio.read().clone()
    }
}

async fn receive_loop(
    mut transport: RecvTransport,
    options: StreamOptions,
    running: &AtomicBool,
    shared: &SharedState,
    event_tx: mpsc::Sender<StreamEvent>,
) -> Result<()> {
    let mut reassembler = Reassembler::new(options.clone());
    let mut scratch = vec![0u8; options.recv_buffer_size.max(2048)];
    let recv_timeout = options.recv_timeout();
    let tick_interval = Duration::from_millis(50);
    let mut last_packet = Instant::now();
    let mut events = Vec::new();

    'receive: while running.load(Ordering::SeqCst) {
        let received = tokio::time::timeout(tick_interval, transport.recv_packet(&mut scratch)).await;
        let now = Instant::now();
        events.clear();

        let progress = match received {
            Ok(Ok(datagram)) => {
                last_packet = now;
                reassembler.handle_datagram(&datagram, now, &mut events)?
            }
            Ok(Err(Error::TransportClosed)) => {
                debug!("전송 종료, 세션 마무리");
                reassembler.finish(&mut events);
                Progress::Ended
            }
            Ok(Err(e)) => return Err(e),
            Err(_elapsed) => {
                if now.duration_since(last_packet) >= recv_timeout {
                    warn!("수신 타임아웃 ({:?}), 세션 마무리", recv_timeout);
                    reassembler.finish(&mut events);
                    Progress::Ended
                } else {
                    reassembler.tick(now, &mut events);
                    Progress::Continue
                }
            }
        };

        publish(shared, &reassembler);
        for event in events.drain(..) {
            if event_tx.send(event).await.is_err() {
                debug!("소비자 이탈, 수신 중단");
                break 'receive;
            }
        }
        if matches!(progress, Progress::Ended) {
            break;
        }
    }

    if !matches!(reassembler.state, SessionState::Terminated) {
        events.clear();
        reassembler.finish(&mut events);
        for event in events.drain(..) {
            let _ = event_tx.try_send(event);
        }
    }
    publish(shared, &reassembler);
    *shared.audio.write() = reassembler.take_audio();
    Ok(())
}

fn publish(shared: &SharedState, reassembler: &Reassembler) {
    *shared.stats.write() = reassembler.stats.clone();
    if shared.metadata.read().is_none() {
        if let Some(metadata) = reassembler.metadata_snapshot.clone() {
            *shared.metadata.write() = Some(metadata);
        }
    }
    if shared.config.read().is_none() {
        if let Some(config) = reassembler.config_snapshot {
            *shared.config.write() = Some(config);
        }
    }
}

/// 패킷 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Continue,
    Ended,
}

/// 세션 상태 기계
enum SessionState {
    AwaitingHeader { metadata: Option<SanchezMetadata> },
    InSession(Box<InSession>),
    Terminated,
}

/// 재조립 엔진 (순수 로직, 소켓 무관)
struct Reassembler {
    options: StreamOptions,
    stats: StreamStats,
    highest_seq: Option<u32>,
    state: SessionState,
    metadata_snapshot: Option<SanchezMetadata>,
    config_snapshot: Option<SanchezConfig>,
    audio_out: Option<Bytes>,
}

impl Reassembler {
    fn new(options: StreamOptions) -> Self {
        Self {
            options,
            stats: StreamStats::new(),
            highest_seq: None,
            state: SessionState::AwaitingHeader { metadata: None },
            metadata_snapshot: None,
            config_snapshot: None,
            audio_out: None,
        }
    }

    /// 데이터그램(또는 TCP 프레임) 하나 처리. 복구 가능한 이상은 통계에만
    /// 남기고, 프로토콜 위반(매직/버전/설정 라인)은 치명으로 돌려준다.
    fn handle_datagram(
        &mut self,
        bytes: &[u8],
        now: Instant,
        events: &mut Vec<StreamEvent>,
    ) -> Result<Progress> {
        self.stats.packets += 1;
        self.stats.bytes += bytes.len() as u64;

        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(Error::ChecksumMismatch { .. }) => {
                self.stats.crc_errors += 1;
                return Ok(Progress::Continue);
            }
            Err(Error::Truncated { .. }) | Err(Error::LengthMismatch { .. }) => {
                self.stats.malformed_packets += 1;
                return Ok(Progress::Continue);
            }
            Err(e) => return Err(e),
        };

        if !self.accept_seq(packet.seq) {
            self.stats.stale_packets += 1;
            return Ok(Progress::Continue);
        }

        let mut progress = Progress::Continue;
        match packet.packet_type {
            PacketType::Metadata => match serde_json::from_slice::<SanchezMetadata>(&packet.payload)
            {
                Ok(metadata) => {
                    self.metadata_snapshot = Some(metadata.clone());
                    match &mut self.state {
                        SessionState::AwaitingHeader { metadata: slot } => *slot = Some(metadata),
                        SessionState::InSession(session) => {
                            if session.metadata.is_none() {
                                session.frame_period = frame_period_of(
                                    &metadata,
                                    session.config.frame_count,
                                );
                                session.metadata = Some(metadata);
                            }
                        }
                        SessionState::Terminated => {}
                    }
                }
                Err(_) => self.stats.malformed_packets += 1,
            },

            PacketType::Config => {
                if let SessionState::AwaitingHeader { metadata } = &mut self.state {
                    let text = std::str::from_utf8(&packet.payload).map_err(|_| {
                        Error::InvalidConfig {
                            reason: "UTF-8 아님".to_string(),
                        }
                    })?;
                    let config = SanchezConfig::parse(text)?;
                    let metadata = metadata.take();
                    let frame_period = metadata
                        .as_ref()
                        .and_then(|m| frame_period_of(m, config.frame_count));
                    info!(
                        "스트림 설정 수신: {}x{}, {} frames",
                        config.width, config.height, config.frame_count
                    );
                    self.config_snapshot = Some(config);
                    self.state = SessionState::InSession(Box::new(InSession::new(
                        metadata,
                        config,
                        frame_period,
                    )));
                }
                // 세션 중 재수신은 무시 (루프 서버는 헤더를 재전송하지 않는다)
            }

            PacketType::FrameStart => {
                if let SessionState::InSession(session) = &mut self.state {
                    match FrameStart::parse(&packet.payload) {
                        Ok(start)
                            if start.total_bytes <= MAX_FRAME_TOTAL_BYTES
                                && start.chunk_count as u64 <= start.total_bytes.max(1) as u64 =>
                        {
                            session.on_frame_start(start);
                        }
                        _ => self.stats.malformed_packets += 1,
                    }
                }
            }

            PacketType::FrameChunk => {
                if let SessionState::InSession(session) = &mut self.state {
                    match packet::parse_chunk_payload(&packet.payload) {
                        Ok((frame_index, chunk_index, data)) => {
                            session.on_chunk(frame_index, chunk_index, data, &mut self.stats);
                        }
                        Err(_) => self.stats.malformed_packets += 1,
                    }
                }
            }

            PacketType::FrameEnd => {
                if let SessionState::InSession(session) = &mut self.state {
                    match FrameEnd::parse(&packet.payload) {
                        Ok(end) => session.on_frame_end(end, &mut self.stats),
                        Err(_) => self.stats.malformed_packets += 1,
                    }
                }
            }

            PacketType::FecData => {
                if let SessionState::InSession(session) = &mut self.state {
                    match FecData::parse(&packet.payload) {
                        Ok(fec) if fec.member_length as usize == fec.parity.len() => {
                            session.on_parity(fec, &mut self.stats);
                        }
                        _ => self.stats.malformed_packets += 1,
                    }
                }
            }

            PacketType::AudioConfig => {
                if let SessionState::InSession(session) = &mut self.state {
                    match packet::AudioInfo::parse(&packet.payload) {
                        Ok(info) if info.total_bytes <= MAX_AUDIO_TOTAL_BYTES => {
                            session.on_audio_config(info);
                        }
                        _ => self.stats.malformed_packets += 1,
                    }
                }
            }

            PacketType::AudioChunk => {
                if let SessionState::InSession(session) = &mut self.state {
                    match packet::parse_audio_payload(&packet.payload) {
                        Ok((offset, data)) => session.on_audio_chunk(offset, data),
                        Err(_) => self.stats.malformed_packets += 1,
                    }
                }
            }

            PacketType::Sync => self.stats.sync_packets += 1,

            PacketType::EndStream => {
                self.finish(events);
                progress = Progress::Ended;
            }

            PacketType::Unknown(code) => {
                debug!("알 수 없는 패킷 타입 0x{:02X} 무시", code);
                self.stats.unknown_packets += 1;
            }
        }

        if progress == Progress::Continue {
            self.drain(now, events);
        }
        Ok(progress)
    }

    /// 패킷 없이도 지연 타이머를 진행시킨다
    fn tick(&mut self, now: Instant, events: &mut Vec<StreamEvent>) {
        self.drain(now, events);
    }

    /// 남은 상태를 모두 해소하고 세션을 끝낸다
    fn finish(&mut self, events: &mut Vec<StreamEvent>) {
        if let SessionState::InSession(session) = &mut self.state {
            session.flush_all(events, &mut self.stats);
            self.audio_out = session
                .audio
                .take()
                .map(|assembly| Bytes::from(assembly.data));
        }
        self.state = SessionState::Terminated;
    }

    fn take_audio(&mut self) -> Option<Bytes> {
        self.audio_out.clone()
    }

    fn drain(&mut self, now: Instant, events: &mut Vec<StreamEvent>) {
        if let SessionState::InSession(session) = &mut self.state {
            let lag = self.options.frame_lag(session.frame_period);
            session.drain(now, lag, events, &mut self.stats);
        }
    }

    /// 재정렬 윈도우 검사. 최대 시퀀스에서 `REORDER_WINDOW` 넘게 뒤처지면 거부.
    fn accept_seq(&mut self, seq: u32) -> bool {
        match self.highest_seq {
            None => {
                self.highest_seq = Some(seq);
                true
            }
            Some(highest) => {
                let ahead = seq.wrapping_sub(highest);
                if ahead == 0 {
                    true
                } else if ahead < u32::MAX / 2 {
                    self.highest_seq = Some(seq);
                    true
                } else {
                    highest.wrapping_sub(seq) <= REORDER_WINDOW
                }
            }
        }
    }
}

/// 진행 중 세션
struct InSession {
    metadata: Option<SanchezMetadata>,
    config: SanchezConfig,
    frame_period: Option<Duration>,
    /// 루프 사이클 (프레임 인덱스가 뒤로 돌면 +1)
    cycle: u64,
    /// (사이클, 인덱스) → 조립 상태. 키 순서가 곧 전달 순서.
    entries: BTreeMap<(u64, u32), FrameEntry>,
    /// 살아있는 엔트리의 인덱스 → 사이클
    live: HashMap<u32, u64>,
    last_started: Option<(u64, u32)>,
    parities: VecDeque<FecData>,
    /// 선두 프레임이 후속 완성에 막힌 시점
    blocked_since: Option<Instant>,
    audio: Option<AudioAssembly>,
}

struct FrameEntry {
    meta: Option<FrameStart>,
    chunks: HashMap<u32, Bytes>,
    expected_crc: Option<u32>,
    end_seen: bool,
    completed: Option<Frame>,
    failed: bool,
}

impl FrameEntry {
    fn new(meta: Option<FrameStart>) -> Self {
        Self {
            meta,
            chunks: HashMap::new(),
            expected_crc: None,
            end_seen: false,
            completed: None,
            failed: false,
        }
    }
}

struct AudioAssembly {
    total: usize,
    data: Vec<u8>,
    offsets: HashSet<u32>,
}

impl InSession {
    fn new(
        metadata: Option<SanchezMetadata>,
        config: SanchezConfig,
        frame_period: Option<Duration>,
    ) -> Self {
        Self {
            metadata,
            config,
            frame_period,
            cycle: 0,
            entries: BTreeMap::new(),
            live: HashMap::new(),
            last_started: None,
            parities: VecDeque::new(),
            blocked_since: None,
            audio: None,
        }
    }

    fn insert_entry(&mut self, cycle: u64, index: u32, meta: Option<FrameStart>) {
        self.entries.insert((cycle, index), FrameEntry::new(meta));
        self.live.insert(index, cycle);
    }

    fn on_frame_start(&mut self, start: FrameStart) {
        let index = start.frame_index;

        if let Some(&cycle) = self.live.get(&index) {
            // 청크가 먼저 도착해 만들어진 엔트리, 또는 중복 START
            if let Some(entry) = self.entries.get_mut(&(cycle, index)) {
                if entry.meta.is_none() {
                    entry.meta = Some(start);
                }
            }
            return;
        }

        let cycle = match self.last_started {
            Some((current, last)) if index <= last => current + 1,
            Some((current, _)) => current,
            None => self.cycle,
        };
        self.cycle = cycle;

        // START가 통째로 유실된 프레임도 제자리에서 손실 처리되도록 자리만 잡는다
        if let Some((prev_cycle, last)) = self.last_started {
            if cycle == prev_cycle && index > last + 1 && index - last - 1 <= MAX_GAP_PLACEHOLDERS {
                for missing in (last + 1)..index {
                    if !self.live.contains_key(&missing) {
                        self.insert_entry(cycle, missing, None);
                    }
                }
            } else if cycle == prev_cycle + 1 && index > 0 && index <= MAX_GAP_PLACEHOLDERS {
                for missing in 0..index {
                    if !self.live.contains_key(&missing) {
                        self.insert_entry(cycle, missing, None);
                    }
                }
            }
        }

        self.insert_entry(cycle, index, Some(start));
        self.last_started = Some((cycle, index));
    }

    /// 데이터(청크/END)가 START보다 먼저 온 프레임의 엔트리 확보
    fn entry_key_for_data(&mut self, index: u32) -> Option<(u64, u32)> {
        if let Some(&cycle) = self.live.get(&index) {
            return Some((cycle, index));
        }
        match self.last_started {
            None => {
                let key = (self.cycle, index);
                self.insert_entry(self.cycle, index, None);
                Some(key)
            }
            Some((cycle, last)) if index > last => {
                self.insert_entry(cycle, index, None);
                Some((cycle, index))
            }
            // 이미 전달/정리된 프레임의 잔여 패킷
            _ => None,
        }
    }

    fn on_chunk(&mut self, frame_index: u32, chunk_index: u32, data: Bytes, stats: &mut StreamStats) {
        let Some(key) = self.entry_key_for_data(frame_index) else {
            stats.duplicate_chunks += 1;
            return;
        };
        {
            let Some(entry) = self.entries.get_mut(&key) else { return };
            if entry.completed.is_some() || entry.failed || entry.chunks.contains_key(&chunk_index) {
                stats.duplicate_chunks += 1;
                return;
            }
            if let Some(meta) = entry.meta {
                if chunk_index >= meta.chunk_count {
                    stats.malformed_packets += 1;
                    return;
                }
            }
            entry.chunks.insert(chunk_index, data);
        }
        self.try_complete(key, stats);
    }

    fn on_frame_end(&mut self, end: FrameEnd, stats: &mut StreamStats) {
        let Some(key) = self.entry_key_for_data(end.frame_index) else {
            stats.duplicate_chunks += 1;
            return;
        };
        {
            let Some(entry) = self.entries.get_mut(&key) else { return };
            if entry.completed.is_some() || entry.failed {
                return;
            }
            entry.expected_crc = Some(end.frame_crc32);
            entry.end_seen = true;
        }
        self.try_complete(key, stats);
    }

    fn on_parity(&mut self, fec: FecData, stats: &mut StreamStats) {
        self.parities.push_back(fec);
        while self.parities.len() > MAX_PARITY_RECORDS {
            self.parities.pop_front();
        }
        // 새 패리티로 풀리는 프레임이 있는지 재시도
        let keys: Vec<(u64, u32)> = self.entries.keys().copied().collect();
        for key in keys {
            self.try_complete(key, stats);
        }
    }

    fn on_audio_config(&mut self, info: packet::AudioInfo) {
        if self.audio.is_none() {
            self.audio = Some(AudioAssembly {
                total: info.total_bytes as usize,
                data: vec![0u8; info.total_bytes as usize],
                offsets: HashSet::new(),
            });
        }
    }

    fn on_audio_chunk(&mut self, offset: u32, data: Bytes) {
        let Some(audio) = &mut self.audio else { return };
        let start = offset as usize;
        let end = start + data.len();
        if audio.offsets.contains(&offset) || end > audio.total {
            return;
        }
        audio.data[start..end].copy_from_slice(&data);
        audio.offsets.insert(offset);
    }

    /// END를 봤고 조건이 맞으면 프레임을 조립한다. 단일 누락은 FEC로 복구.
    fn try_complete(&mut self, key: (u64, u32), stats: &mut StreamStats) {
        let config = self.config;

        let recovery = {
            let Some(entry) = self.entries.get(&key) else { return };
            if entry.completed.is_some() || entry.failed || !entry.end_seen {
                return;
            }
            let Some(meta) = entry.meta else { return };
            let have = entry.chunks.len() as u32;
            if have == meta.chunk_count {
                None
            } else if have + 1 == meta.chunk_count {
                match recover_missing_chunk(key.1, &meta, &entry.chunks, &self.parities) {
                    Some(recovered) => Some(recovered),
                    None => return, // 패리티 부재 또는 불충분, 늦은 청크를 더 기다린다
                }
            } else {
                return; // 둘 이상 누락, lag가 정리한다
            }
        };

        if let Some((chunk_index, data)) = recovery {
            stats.fec_recoveries += 1;
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.chunks.insert(chunk_index, data);
            }
        }

        let Some(entry) = self.entries.get_mut(&key) else { return };
        let Some(meta) = entry.meta else { return };
        if entry.chunks.len() as u32 != meta.chunk_count {
            return;
        }

        let mut deflated = BytesMut::with_capacity(meta.total_bytes as usize);
        for i in 0..meta.chunk_count {
            match entry.chunks.get(&i) {
                Some(chunk) => deflated.extend_from_slice(chunk),
                None => {
                    entry.failed = true;
                    return;
                }
            }
        }
        if deflated.len() != meta.total_bytes as usize {
            entry.failed = true;
            return;
        }
        match entry.expected_crc {
            Some(expected) if codec::crc32(&deflated) == expected => {}
            _ => {
                entry.failed = true;
                return;
            }
        }
        let rgb = match codec::inflate(&deflated) {
            Ok(rgb) => rgb,
            Err(_) => {
                entry.failed = true;
                return;
            }
        };
        if rgb.len() != config.frame_bytes() {
            entry.failed = true;
            return;
        }
        match Frame::from_rgb(config.width, config.height, Bytes::from(rgb)) {
            Ok(frame) => {
                entry.chunks.clear();
                entry.chunks.shrink_to_fit();
                entry.completed = Some(frame);
            }
            Err(_) => entry.failed = true,
        }
    }

    /// 선두부터 전달 가능한 프레임을 내보내고, 막힌 선두는 lag 경과 후 손실 처리
    fn drain(
        &mut self,
        now: Instant,
        lag: Duration,
        events: &mut Vec<StreamEvent>,
        stats: &mut StreamStats,
    ) {
        loop {
            let Some((&key, head)) = self.entries.iter().next() else {
                self.blocked_since = None;
                return;
            };

            if head.completed.is_some() {
                self.pop_entry(key, events, stats, true);
                continue;
            }
            if head.failed {
                self.pop_entry(key, events, stats, false);
                continue;
            }

            let overloaded = self.entries.len() > MAX_PENDING_FRAMES;
            let later_ready = self
                .entries
                .iter()
                .skip(1)
                .any(|(_, entry)| entry.completed.is_some());

            if overloaded {
                self.pop_entry(key, events, stats, false);
                continue;
            }
            if later_ready {
                let since = *self.blocked_since.get_or_insert(now);
                if now.duration_since(since) >= lag {
                    self.pop_entry(key, events, stats, false);
                    self.blocked_since = None;
                    continue;
                }
            } else {
                self.blocked_since = None;
            }
            return;
        }
    }

    fn pop_entry(
        &mut self,
        key: (u64, u32),
        events: &mut Vec<StreamEvent>,
        stats: &mut StreamStats,
        deliver: bool,
    ) {
        let Some(mut entry) = self.entries.remove(&key) else { return };
        if self.live.get(&key.1) == Some(&key.0) {
            self.live.remove(&key.1);
        }
        if deliver {
            if let Some(frame) = entry.completed.take() {
                stats.frames_delivered += 1;
                events.push(StreamEvent::Frame {
                    index: key.1,
                    frame,
                });
                return;
            }
        }
        stats.frames_lost += 1;
        events.push(StreamEvent::FrameLost(key.1));
    }

    /// 세션 종료: 남은 엔트리를 순서대로 전부 해소
    fn flush_all(&mut self, events: &mut Vec<StreamEvent>, stats: &mut StreamStats) {
        while let Some((&key, entry)) = self.entries.iter().next() {
            let deliver = entry.completed.is_some();
            self.pop_entry(key, events, stats, deliver);
        }
    }
}

fn frame_period_of(metadata: &SanchezMetadata, frame_count: u32) -> Option<Duration> {
    metadata
        .fps(frame_count)
        .map(|fps| Duration::from_secs_f64(1.0 / fps))
}

/// 그룹 패리티로 단일 누락 청크 복구
///
/// 패리티는 프리픽스 포함 페이로드의 XOR이므로 복구 결과의 프리픽스가
/// `(frame_index, missing)`과 일치해야 신뢰한다. 실제 데이터 길이는
/// `total_bytes - 보유 청크 합`으로 계산한다.
fn recover_missing_chunk(
    frame_index: u32,
    meta: &FrameStart,
    chunks: &HashMap<u32, Bytes>,
    parities: &VecDeque<FecData>,
) -> Option<(u32, Bytes)> {
    let missing = (0..meta.chunk_count).find(|i| !chunks.contains_key(i))?;
    let have_sum: usize = chunks.values().map(|chunk| chunk.len()).sum();
    let missing_len = (meta.total_bytes as usize).checked_sub(have_sum)?;

    for fec in parities {
        let start = fec.group_id;
        let end = start.saturating_add(fec.member_count);
        if missing < start || missing >= end || end > meta.chunk_count {
            continue;
        }
        if fec.parity.len() < 8 + missing_len {
            continue;
        }

        let mut buf = fec.parity.to_vec();
        let mut have_all_members = true;
        for index in start..end {
            if index == missing {
                continue;
            }
            let Some(chunk) = chunks.get(&index) else {
                have_all_members = false;
                break;
            };
            let payload = packet::encode_chunk_payload(frame_index, index, chunk);
            if payload.len() > buf.len() {
                have_all_members = false;
                break;
            }
            for (acc, byte) in buf.iter_mut().zip(payload.iter()) {
                *acc ^= byte;
            }
        }
        if !have_all_members {
            continue;
        }

        let recovered_frame =
            u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let recovered_chunk =
            u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if recovered_frame != frame_index || recovered_chunk != missing {
            continue;
        }
        return Some((missing, Bytes::copy_from_slice(&buf[8..8 + missing_len])));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameStore;
    use crate::packet::AudioInfo;
    use crate::server::SanchezStreamServer;
    use crate::AUDIO_CODEC_MP3;

    fn test_metadata(seconds: &str) -> SanchezMetadata {
        SanchezMetadata {
            title: "t".to_string(),
            creator: "c".to_string(),
            created_at: "2026-01-02T01:30:43Z".to_string(),
            seconds: seconds.to_string(),
        }
    }

    // LCG로 채운 비압축성 프레임들
    fn make_store(width: u32, height: u32, count: usize) -> FrameStore {
        let mut store = FrameStore::new(width, height);
        let mut state = 0x1234_5678u32;
        for _ in 0..count {
            let data: Vec<u8> = (0..width as usize * height as usize * 3)
                .map(|_| {
                    state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                    (state >> 24) as u8
                })
                .collect();
            store
                .push(Frame::from_rgb(width, height, Bytes::from(data)).unwrap())
                .unwrap();
        }
        store
    }

    /// 서버 송출 순서를 재현하는 동기 패킷 생성기
    struct TestEmitter {
        seq: u32,
        chunk_size: usize,
        satellite: bool,
        fec_group: usize,
        packets: Vec<Bytes>,
        parity: Vec<u8>,
        group_start: u32,
        group_members: u32,
    }

    impl TestEmitter {
        fn new(chunk_size: usize, satellite: bool, fec_group: usize) -> Self {
            Self {
                seq: 0,
                chunk_size,
                satellite,
                fec_group,
                packets: Vec::new(),
                parity: Vec::new(),
                group_start: 0,
                group_members: 0,
            }
        }

        fn emit(&mut self, packet_type: PacketType, payload: &[u8]) {
            self.packets
                .push(Packet::encode(packet_type, self.seq, 0, payload));
            self.seq = self.seq.wrapping_add(1);
        }

        fn header(&mut self, metadata: &SanchezMetadata, config: &SanchezConfig) {
            let json = metadata.to_json_line().unwrap();
            self.emit(PacketType::Metadata, json.as_bytes());
            self.emit(PacketType::Config, config.encode().as_bytes());
        }

        fn audio(&mut self, blob: &[u8]) {
            let info = AudioInfo {
                codec_tag: AUDIO_CODEC_MP3,
                total_bytes: blob.len() as u32,
            };
            self.emit(PacketType::AudioConfig, &info.encode());
            for (i, data) in blob.chunks(self.chunk_size).enumerate() {
                let payload =
                    packet::encode_audio_payload((i * self.chunk_size) as u32, data);
                self.emit(PacketType::AudioChunk, &payload);
            }
        }

        fn frame(&mut self, index: u32, rgb: &[u8]) {
            let deflated = codec::deflate(rgb).unwrap();
            let crc = codec::crc32(&deflated);
            let chunk_count =
                ((deflated.len() + self.chunk_size - 1) / self.chunk_size).max(1) as u32;

            let start = FrameStart {
                frame_index: index,
                total_bytes: deflated.len() as u32,
                chunk_count,
            };
            self.emit(PacketType::FrameStart, &start.encode());

            for (chunk_index, chunk) in deflated.chunks(self.chunk_size).enumerate() {
                let payload = packet::encode_chunk_payload(index, chunk_index as u32, chunk);
                if self.satellite {
                    if self.group_members == 0 {
                        self.group_start = chunk_index as u32;
                        self.parity.clear();
                    }
                    if payload.len() > self.parity.len() {
                        self.parity.resize(payload.len(), 0);
                    }
                    for (acc, byte) in self.parity.iter_mut().zip(payload.iter()) {
                        *acc ^= byte;
                    }
                    self.group_members += 1;
                }
                self.emit(PacketType::FrameChunk, &payload);
                if self.satellite && self.group_members as usize >= self.fec_group {
                    self.flush_parity();
                }
            }
            if self.satellite {
                self.flush_parity();
            }

            let end = FrameEnd {
                frame_index: index,
                frame_crc32: crc,
            };
            self.emit(PacketType::FrameEnd, &end.encode());
        }

        fn flush_parity(&mut self) {
            if self.group_members == 0 {
                return;
            }
            let fec = FecData {
                group_id: self.group_start,
                member_count: self.group_members,
                member_length: self.parity.len() as u32,
                parity: Bytes::from(std::mem::take(&mut self.parity)),
            };
            self.group_members = 0;
            self.emit(PacketType::FecData, &fec.encode());
        }

        fn end(&mut self) {
            self.emit(PacketType::EndStream, &[]);
        }
    }

    fn build_session(
        store: &FrameStore,
        metadata: &SanchezMetadata,
        audio: Option<&[u8]>,
        satellite: bool,
        fec_group: usize,
        chunk_size: usize,
        cycles: usize,
        with_end: bool,
    ) -> Vec<Bytes> {
        let config =
            SanchezConfig::new(store.width(), store.height(), store.len() as u32).unwrap();
        let mut emitter = TestEmitter::new(chunk_size, satellite, fec_group);
        emitter.header(metadata, &config);
        if let Some(blob) = audio {
            emitter.audio(blob);
        }
        for _ in 0..cycles {
            for (i, frame) in store.iter().enumerate() {
                emitter.frame(i as u32, frame.data());
            }
        }
        if with_end {
            emitter.end();
        }
        emitter.packets
    }

    fn feed(
        reassembler: &mut Reassembler,
        packets: &[Bytes],
        now: Instant,
    ) -> (Vec<StreamEvent>, bool) {
        let mut events = Vec::new();
        let mut ended = false;
        for packet in packets {
            if reassembler.handle_datagram(packet, now, &mut events).unwrap() == Progress::Ended {
                ended = true;
            }
        }
        (events, ended)
    }

    fn delivered_indices(events: &[StreamEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Frame { index, .. } => Some(*index),
                StreamEvent::FrameLost(_) => None,
            })
            .collect()
    }

    // 페이로드 기준으로 n번째 FRAME_CHUNK(frame_index) 패킷 위치 찾기
    fn find_chunk_packet(packets: &[Bytes], frame_index: u32, chunk_index: u32) -> usize {
        packets
            .iter()
            .position(|bytes| {
                let packet = Packet::decode(bytes).unwrap();
                if packet.packet_type != PacketType::FrameChunk {
                    return false;
                }
                let (f, c, _) = packet::parse_chunk_payload(&packet.payload).unwrap();
                f == frame_index && c == chunk_index
            })
            .expect("해당 청크 패킷 없음")
    }

    #[test]
    fn test_in_order_delivery() {
        let store = make_store(4, 4, 5);
        let packets = build_session(&store, &test_metadata("0.2"), None, false, 8, 32, 1, true);

        let mut reassembler = Reassembler::new(StreamOptions::default());
        let (events, ended) = feed(&mut reassembler, &packets, Instant::now());

        assert!(ended);
        assert_eq!(delivered_indices(&events), vec![0, 1, 2, 3, 4]);
        for event in &events {
            if let StreamEvent::Frame { index, frame } = event {
                assert_eq!(frame, store.get(*index as usize).unwrap());
            }
        }
        assert_eq!(reassembler.stats.frames_delivered, 5);
        assert_eq!(reassembler.stats.frames_lost, 0);
        assert_eq!(reassembler.metadata_snapshot.as_ref().unwrap().title, "t");
        assert_eq!(reassembler.config_snapshot.unwrap().frame_count, 5);
    }

    #[test]
    fn test_shuffle_within_window_preserves_sequence() {
        let store = make_store(4, 4, 5);
        let mut packets =
            build_session(&store, &test_metadata("0"), None, false, 8, 24, 1, true);

        // 헤더 2개와 END는 제자리에 두고 중간을 블록 단위로 뒤섞는다
        let end = packets.len() - 1;
        for block in packets[2..end].chunks_mut(7) {
            block.reverse();
        }

        let mut reassembler = Reassembler::new(StreamOptions::default());
        let now = Instant::now();
        let (mut events, ended) = feed(&mut reassembler, &packets, now);
        if !ended {
            reassembler.finish(&mut events);
        }

        assert_eq!(delivered_indices(&events), vec![0, 1, 2, 3, 4]);
        assert_eq!(reassembler.stats.frames_lost, 0);
        for event in &events {
            if let StreamEvent::Frame { index, frame } = event {
                assert_eq!(frame, store.get(*index as usize).unwrap());
            }
        }
    }

    #[test]
    fn test_fec_recovers_single_loss() {
        let store = make_store(6, 6, 3);
        let mut packets =
            build_session(&store, &test_metadata("0.125"), None, true, 4, 16, 1, true);

        let victim = find_chunk_packet(&packets, 1, 2);
        packets.remove(victim);

        let mut reassembler = Reassembler::new(StreamOptions::satellite_mode());
        let (events, ended) = feed(&mut reassembler, &packets, Instant::now());

        assert!(ended);
        assert_eq!(delivered_indices(&events), vec![0, 1, 2]);
        assert_eq!(reassembler.stats.frames_lost, 0);
        assert!(reassembler.stats.fec_recoveries >= 1);
        for event in &events {
            if let StreamEvent::Frame { index, frame } = event {
                assert_eq!(frame, store.get(*index as usize).unwrap());
            }
        }
    }

    #[test]
    fn test_two_losses_in_group_mark_frame_lost() {
        let store = make_store(6, 6, 3);
        let mut packets =
            build_session(&store, &test_metadata("0.125"), None, true, 64, 16, 1, true);

        // 그룹 하나(프레임 전체)에서 청크 둘 제거
        let first = find_chunk_packet(&packets, 1, 1);
        packets.remove(first);
        let second = find_chunk_packet(&packets, 1, 3);
        packets.remove(second);

        let mut reassembler = Reassembler::new(StreamOptions::satellite_mode());
        let (events, ended) = feed(&mut reassembler, &packets, Instant::now());

        assert!(ended);
        let summary: Vec<String> = events
            .iter()
            .map(|event| match event {
                StreamEvent::Frame { index, .. } => format!("F{}", index),
                StreamEvent::FrameLost(index) => format!("L{}", index),
            })
            .collect();
        assert_eq!(summary, vec!["F0", "L1", "F2"]);
        assert_eq!(reassembler.stats.frames_lost, 1);
    }

    #[test]
    fn test_lag_timeout_skips_blocked_frame() {
        let store = make_store(4, 4, 4);
        let mut packets =
            build_session(&store, &test_metadata("0"), None, false, 8, 24, 1, false);

        let victim = find_chunk_packet(&packets, 1, 0);
        packets.remove(victim);

        let mut reassembler = Reassembler::new(StreamOptions::default());
        let t0 = Instant::now();
        let (events, ended) = feed(&mut reassembler, &packets, t0);
        assert!(!ended);
        assert_eq!(delivered_indices(&events), vec![0]);

        // fps를 모르는 세션의 기본 lag는 500ms
        let mut late_events = Vec::new();
        reassembler.tick(t0 + Duration::from_millis(600), &mut late_events);

        let summary: Vec<String> = late_events
            .iter()
            .map(|event| match event {
                StreamEvent::Frame { index, .. } => format!("F{}", index),
                StreamEvent::FrameLost(index) => format!("L{}", index),
            })
            .collect();
        assert_eq!(summary, vec!["L1", "F2", "F3"]);
    }

    #[test]
    fn test_duplicates_are_not_delivered_twice() {
        let store = make_store(4, 4, 3);
        let packets = build_session(&store, &test_metadata("0.125"), None, false, 8, 32, 1, true);

        let doubled: Vec<Bytes> = packets
            .iter()
            .flat_map(|p| [p.clone(), p.clone()])
            .collect();

        let mut reassembler = Reassembler::new(StreamOptions::default());
        let (events, ended) = feed(&mut reassembler, &doubled, Instant::now());

        assert!(ended);
        assert_eq!(delivered_indices(&events), vec![0, 1, 2]);
        assert!(reassembler.stats.duplicate_chunks > 0);
    }

    #[test]
    fn test_loop_cycles_repeat_indices() {
        let store = make_store(4, 4, 3);
        let packets = build_session(&store, &test_metadata("0.125"), None, false, 8, 32, 2, true);

        let mut reassembler = Reassembler::new(StreamOptions::default());
        let (events, ended) = feed(&mut reassembler, &packets, Instant::now());

        assert!(ended);
        assert_eq!(delivered_indices(&events), vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(reassembler.stats.frames_delivered, 6);
        assert_eq!(reassembler.stats.frames_lost, 0);
    }

    #[test]
    fn test_audio_reassembly() {
        let store = make_store(4, 4, 2);
        let blob: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let packets = build_session(
            &store,
            &test_metadata("0.08"),
            Some(&blob),
            false,
            8,
            512,
            1,
            true,
        );

        let mut reassembler = Reassembler::new(StreamOptions::default());
        let (_events, ended) = feed(&mut reassembler, &packets, Instant::now());

        assert!(ended);
        assert_eq!(reassembler.take_audio().unwrap().as_ref(), &blob[..]);
    }

    #[test]
    fn test_stale_packet_outside_window_dropped() {
        let store = make_store(4, 4, 2);
        let packets = build_session(&store, &test_metadata("0.08"), None, false, 8, 32, 1, false);

        let mut reassembler = Reassembler::new(StreamOptions::default());
        let now = Instant::now();
        feed(&mut reassembler, &packets, now);

        // 윈도우(1024)보다 한참 뒤처진 시퀀스
        let highest = reassembler.highest_seq.unwrap();
        let stale = Packet::encode(
            PacketType::FrameChunk,
            highest.wrapping_sub(REORDER_WINDOW + 100),
            0,
            &packet::encode_chunk_payload(0, 0, b"late"),
        );
        let mut events = Vec::new();
        reassembler.handle_datagram(&stale, now, &mut events).unwrap();
        assert_eq!(reassembler.stats.stale_packets, 1);
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let mut bytes = Packet::encode(PacketType::Sync, 0, 0, &[0u8; 12]).to_vec();
        bytes[0] = b'X';

        let mut reassembler = Reassembler::new(StreamOptions::default());
        let mut events = Vec::new();
        assert!(matches!(
            reassembler.handle_datagram(&bytes, Instant::now(), &mut events),
            Err(Error::BadMagic { .. })
        ));
    }

    #[test]
    fn test_crc_corruption_counted_not_fatal() {
        let store = make_store(4, 4, 2);
        let packets = build_session(&store, &test_metadata("0.08"), None, false, 8, 32, 1, true);

        // 청크 하나의 손상본을 원본보다 먼저 흘린다
        let victim = find_chunk_packet(&packets, 0, 0);
        let mut corrupted = packets[victim].to_vec();
        let last = corrupted.len() - 5;
        corrupted[last] ^= 0xFF;

        let mut with_noise: Vec<Bytes> = Vec::new();
        for (i, packet) in packets.iter().enumerate() {
            if i == victim {
                with_noise.push(Bytes::from(corrupted.clone()));
            }
            with_noise.push(packet.clone());
        }

        let mut reassembler = Reassembler::new(StreamOptions::default());
        let (events, ended) = feed(&mut reassembler, &with_noise, Instant::now());

        assert!(ended);
        assert_eq!(reassembler.stats.crc_errors, 1);
        assert_eq!(delivered_indices(&events), vec![0, 1]);
    }

    #[test]
    fn test_seq_wraparound_accepted() {
        let mut reassembler = Reassembler::new(StreamOptions::default());
        assert!(reassembler.accept_seq(u32::MAX - 1));
        assert!(reassembler.accept_seq(u32::MAX));
        assert!(reassembler.accept_seq(0)); // 랩어라운드 전진
        assert_eq!(reassembler.highest_seq, Some(0));
        assert!(reassembler.accept_seq(u32::MAX)); // 윈도우 안쪽
        assert!(!reassembler.accept_seq(u32::MAX - REORDER_WINDOW - 50));
    }

    fn free_port(udp: bool) -> u16 {
        if udp {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        } else {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        }
    }

    #[tokio::test]
    async fn test_tcp_stream_roundtrip() {
        let store = make_store(4, 4, 10);
        let metadata = test_metadata("0.4");
        let port = free_port(false);

        let server = Arc::new(SanchezStreamServer::new(StreamMode::TcpUnicast));
        let server_task = {
            let server = server.clone();
            let store = store.clone();
            let metadata = metadata.clone();
            tokio::spawn(async move {
                let _ = server.stream(&store, &metadata, None, "127.0.0.1", port).await;
            })
        };

        // 서버 바인드 대기 후 접속
        let mut attempt = 0;
        let (client, mut events) = loop {
            match SanchezStreamClient::start(
                StreamMode::TcpUnicast,
                "127.0.0.1",
                port,
                StreamOptions::default(),
            )
            .await
            {
                Ok(pair) => break pair,
                Err(_) if attempt < 40 => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(e) => panic!("접속 실패: {e}"),
            }
        };

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Frame { index, frame } => received.push((index, frame)),
                StreamEvent::FrameLost(index) => panic!("TCP에서 프레임 {index} 손실"),
            }
        }

        assert_eq!(received.len(), 10);
        for (i, (index, frame)) in received.iter().enumerate() {
            assert_eq!(*index as usize, i);
            assert_eq!(frame, store.get(i).unwrap());
        }
        assert_eq!(client.config().unwrap().frame_count, 10);
        assert_eq!(client.metadata().unwrap().seconds, "0.4");

        server.stop();
        let _ = server_task.await;
    }

    #[tokio::test]
    async fn test_udp_stream_roundtrip() {
        let store = make_store(4, 4, 5);
        let metadata = test_metadata("0.2");
        let port = free_port(true);

        // UDP는 수신측을 먼저 열어야 첫 패킷을 받는다
        let (_client, mut events) = SanchezStreamClient::start(
            StreamMode::UdpUnicast,
            "127.0.0.1",
            port,
            StreamOptions::default(),
        )
        .await
        .unwrap();

        let options = StreamOptions {
            fps: Some(200.0),
            ..StreamOptions::default()
        };
        let server = SanchezStreamServer::with_options(StreamMode::UdpUnicast, options);
        server
            .stream(&store, &metadata, None, "127.0.0.1", port)
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            if let StreamEvent::Frame { index, frame } = event {
                received.push((index, frame));
            }
        }

        // 루프백 UDP는 손실이 없어야 한다
        assert_eq!(received.len(), 5);
        for (i, (index, frame)) in received.iter().enumerate() {
            assert_eq!(*index as usize, i);
            assert_eq!(frame, store.get(i).unwrap());
        }
    }
}
