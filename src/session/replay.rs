//! 本地回放会话
//!
//! 不连接真实服务的会话实现：用户一轮说完（上行麦克风能量检测）或显式请求时，
//! 把预先准备好的应答片段按线上格式（PCM16，24 kHz）切成小块下发；
//! 应答期间用户持续开口则发出 `Interrupted` 并丢弃剩余片段。
//!
//! 语音活动按上行音频本身的时长累计，不依赖墙上时间。

use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::{LiveSession, RealtimeInput, SessionError, SessionEvent, Speaker};
use crate::audio::format::{f32_to_pcm16, pcm16_to_f32, PcmFormat};
use crate::audio::resample::resample_once;
use crate::decode::{decode_inline, AudioDecoder};

/// 工作线程轮询间隔
const TICK: Duration = Duration::from_millis(10);

/// 回放会话配置
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    /// 下行线上采样率
    pub wire_rate: u32,
    /// 每个下行块的时长（毫秒）
    pub chunk_ms: u32,
    /// 下发领先实时的最大秒数
    pub lead_secs: f64,
    /// 语音判定的 RMS 阈值
    pub vad_threshold: f32,
    /// 用户说完后静音多久算一轮结束（秒）
    pub end_of_turn_secs: f64,
    /// 应答期间用户连续说话多久触发打断（秒）
    pub barge_in_secs: f64,
    /// 一轮结束后自动应答
    pub auto_respond: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            wire_rate: 24_000,
            chunk_ms: 40,
            lead_secs: 0.5,
            vad_threshold: 0.02,
            end_of_turn_secs: 0.8,
            barge_in_secs: 0.2,
            auto_respond: true,
        }
    }
}

/// 一段应答音频（线上格式 PCM16 LE）
#[derive(Clone, Debug)]
pub struct ResponseClip {
    pub name: String,
    pub pcm: Vec<u8>,
}

impl ResponseClip {
    /// 从音频文件加载并转换到线上格式
    pub fn from_file<P: AsRef<Path>>(path: P, wire_rate: u32) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let load_err = |source| SessionError::Load {
            path: path.display().to_string(),
            source,
        };

        let chunk = AudioDecoder::open(path)
            .and_then(AudioDecoder::decode_all)
            .map_err(load_err)?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        log::info!(
            "Loaded response clip '{}': {:.2}s @ {}Hz",
            name,
            chunk.duration(),
            chunk.sample_rate()
        );

        Ok(Self::from_samples(name, chunk.samples(), chunk.sample_rate(), wire_rate))
    }

    pub fn from_samples(name: impl Into<String>, samples: &[f32], rate: u32, wire_rate: u32) -> Self {
        let resampled = resample_once(samples, rate, wire_rate);
        let mut pcm = Vec::with_capacity(resampled.len() * 2);
        f32_to_pcm16(&resampled, &mut pcm);
        Self {
            name: name.into(),
            pcm,
        }
    }

    /// 合成的提示音片段（没有提供应答文件时使用）
    pub fn tone(wire_rate: u32) -> Self {
        let rate = wire_rate as f32;
        let samples: Vec<f32> = (0..(wire_rate as usize * 3 / 2))
            .map(|i| {
                let t = i as f32 / rate;
                // 三个音节的"说话"包络
                let envelope = (std::f32::consts::PI * (t * 2.0).fract()).sin().powi(2);
                let pitch = 180.0 + 40.0 * (t * 3.0).sin();
                0.3 * envelope * (std::f32::consts::TAU * pitch * t).sin()
            })
            .collect();
        Self::from_samples("synthetic tone", &samples, wire_rate, wire_rate)
    }

    pub fn duration(&self, wire_rate: u32) -> f64 {
        (self.pcm.len() / 2) as f64 / wire_rate.max(1) as f64
    }
}

enum Inbound {
    Input(RealtimeInput),
    Respond,
    Close,
}

/// 本地回放会话
pub struct ReplaySession {
    tx: Sender<Inbound>,
    events: Receiver<SessionEvent>,
    worker: Option<JoinHandle<()>>,
    closed: bool,
}

impl ReplaySession {
    /// 启动会话工作线程
    pub fn connect(mut clips: Vec<ResponseClip>, config: ReplayConfig) -> Result<Self, SessionError> {
        if clips.is_empty() {
            clips.push(ResponseClip::tone(config.wire_rate));
        }

        let (tx, rx) = unbounded();
        let (event_tx, events) = unbounded();

        let worker = ReplayWorker::new(clips, config, rx, event_tx);
        let handle = thread::Builder::new()
            .name("session".to_string())
            .spawn(move || worker.run())
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        Ok(Self {
            tx,
            events,
            worker: Some(handle),
            closed: false,
        })
    }
}

impl LiveSession for ReplaySession {
    fn send_realtime_input(&self, input: RealtimeInput) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.tx
            .send(Inbound::Input(input))
            .map_err(|_| SessionError::Closed)
    }

    fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    fn request_response(&self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.tx.send(Inbound::Respond).map_err(|_| SessionError::Closed)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.tx.send(Inbound::Close);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ReplaySession {
    fn drop(&mut self) {
        self.close();
    }
}

struct ActiveResponse {
    clip: usize,
    offset: usize,
    started: Instant,
    sent_secs: f64,
}

struct ReplayWorker {
    clips: Vec<ResponseClip>,
    config: ReplayConfig,
    format: PcmFormat,
    /// 下行负载的 MIME（`audio/pcm;rate=N`），和真实会话的 inline data 一致
    mime: String,
    rx: Receiver<Inbound>,
    events: Sender<SessionEvent>,

    next_clip: usize,
    response: Option<ActiveResponse>,

    /// 本轮用户已说话的累计时长
    user_speech_secs: f64,
    /// 当前连续说话时长
    speech_run_secs: f64,
    /// 最后一次说话之后的连续静音时长
    silence_run_secs: f64,
    frames_received: u64,
    scratch: Vec<f32>,
}

impl ReplayWorker {
    fn new(
        clips: Vec<ResponseClip>,
        config: ReplayConfig,
        rx: Receiver<Inbound>,
        events: Sender<SessionEvent>,
    ) -> Self {
        let format = PcmFormat::mono(config.wire_rate);
        Self {
            clips,
            config,
            mime: format.mime_type(),
            format,
            rx,
            events,
            next_clip: 0,
            response: None,
            user_speech_secs: 0.0,
            speech_run_secs: 0.0,
            silence_run_secs: 0.0,
            frames_received: 0,
            scratch: Vec::new(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn run(mut self) {
        log::info!("Replay session opened with {} response clip(s)", self.clips.len());
        self.emit(SessionEvent::Opened);

        let reason = loop {
            match self.rx.recv_timeout(TICK) {
                Ok(Inbound::Input(input)) => self.on_input(input),
                Ok(Inbound::Respond) => self.begin_response(),
                Ok(Inbound::Close) => break "closed by client",
                Err(RecvTimeoutError::Disconnected) => break "client dropped",
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.pump_response();
        };

        log::info!("Replay session closed ({})", reason);
        self.emit(SessionEvent::Closed {
            reason: reason.to_string(),
        });
    }

    fn on_input(&mut self, input: RealtimeInput) {
        match input {
            RealtimeInput::Audio { pcm, format } => self.on_audio(&pcm, format),
            RealtimeInput::Image { jpeg, width, height } => {
                self.frames_received += 1;
                log::debug!(
                    "Received video frame #{} {}x{} ({} bytes)",
                    self.frames_received,
                    width,
                    height,
                    jpeg.len()
                );
            }
        }
    }

    fn on_audio(&mut self, pcm: &[u8], format: PcmFormat) {
        self.scratch.clear();
        let n = pcm16_to_f32(pcm, &mut self.scratch);
        if n == 0 {
            return;
        }

        let secs = n as f64 / format.channels.max(1) as f64 / format.sample_rate.max(1) as f64;
        let rms = (self.scratch.iter().map(|s| s * s).sum::<f32>() / n as f32).sqrt();

        if rms >= self.config.vad_threshold {
            self.speech_run_secs += secs;
            self.user_speech_secs += secs;
            self.silence_run_secs = 0.0;

            if self.response.is_some() && self.speech_run_secs >= self.config.barge_in_secs {
                self.interrupt_response();
            }
        } else {
            self.speech_run_secs = 0.0;
            self.silence_run_secs += secs;

            if self.response.is_none()
                && self.user_speech_secs > 0.0
                && self.silence_run_secs >= self.config.end_of_turn_secs
            {
                self.end_user_turn();
            }
        }
    }

    fn end_user_turn(&mut self) {
        let spoken = self.user_speech_secs;
        self.user_speech_secs = 0.0;
        self.emit(SessionEvent::Transcript {
            speaker: Speaker::User,
            text: format!("(spoke for {:.1}s)", spoken),
        });
        if self.config.auto_respond {
            self.begin_response();
        }
    }

    fn begin_response(&mut self) {
        if self.response.is_some() {
            return;
        }
        let clip = self.next_clip % self.clips.len();
        self.next_clip = clip + 1;
        log::debug!("Streaming response clip '{}'", self.clips[clip].name);

        self.user_speech_secs = 0.0;
        self.response = Some(ActiveResponse {
            clip,
            offset: 0,
            started: Instant::now(),
            sent_secs: 0.0,
        });
    }

    fn interrupt_response(&mut self) {
        if let Some(response) = self.response.take() {
            log::info!(
                "User barged in after {:.2}s of '{}'",
                response.sent_secs,
                self.clips[response.clip].name
            );
            self.emit(SessionEvent::Interrupted);
        }
    }

    /// 按领先量下发应答块
    fn pump_response(&mut self) {
        let Some(mut response) = self.response.take() else {
            return;
        };

        let chunk_bytes =
            (self.format.sample_rate as usize * self.config.chunk_ms.max(1) as usize / 1000).max(1)
                * self.format.bytes_per_frame();
        let horizon = response.started.elapsed().as_secs_f64() + self.config.lead_secs;

        let clip = &self.clips[response.clip];
        while response.offset < clip.pcm.len() && response.sent_secs < horizon {
            let end = (response.offset + chunk_bytes).min(clip.pcm.len());
            let payload = &clip.pcm[response.offset..end];
            response.offset = end;

            match decode_inline(payload, &self.mime, self.format.sample_rate) {
                Ok(chunk) => {
                    response.sent_secs += chunk.duration();
                    let _ = self.events.send(SessionEvent::AudioChunkReceived(chunk));
                }
                Err(e) => {
                    let _ = self.events.send(SessionEvent::Errored(e.to_string()));
                }
            }
        }

        if response.offset >= clip.pcm.len() {
            let name = clip.name.clone();
            self.emit(SessionEvent::Transcript {
                speaker: Speaker::Model,
                text: name,
            });
            self.emit(SessionEvent::TurnComplete);
        } else {
            self.response = Some(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_block(level: f32, secs: f64, rate: u32) -> Vec<u8> {
        let frames = (secs * rate as f64) as usize;
        let samples: Vec<f32> = (0..frames)
            .map(|i| if i % 2 == 0 { level } else { -level })
            .collect();
        let mut pcm = Vec::new();
        f32_to_pcm16(&samples, &mut pcm);
        pcm
    }

    fn audio(level: f32, secs: f64) -> RealtimeInput {
        RealtimeInput::Audio {
            pcm: pcm_block(level, secs, 16_000),
            format: PcmFormat::mono(16_000),
        }
    }

    fn short_clip() -> ResponseClip {
        ResponseClip::from_samples("hello", &vec![0.1; 4800], 24_000, 24_000)
    }

    /// 收集事件直到满足条件或超时
    fn collect_until(
        session: &ReplaySession,
        stop: impl Fn(&SessionEvent) -> bool,
    ) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = session.events().recv_timeout(Duration::from_secs(2)) {
            let done = stop(&event);
            out.push(event);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn test_opened_then_response_on_request() {
        let session = ReplaySession::connect(vec![short_clip()], ReplayConfig::default()).unwrap();
        session.request_response().unwrap();

        let events = collect_until(&session, |e| matches!(e, SessionEvent::TurnComplete));
        assert!(matches!(events[0], SessionEvent::Opened));

        let total: f64 = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::AudioChunkReceived(c) => Some(c.duration()),
                _ => None,
            })
            .sum();
        assert!((total - 0.2).abs() < 1e-6, "total = {}", total);
        assert!(matches!(events.last(), Some(SessionEvent::TurnComplete)));
    }

    #[test]
    fn test_chunks_follow_chunk_ms() {
        let session = ReplaySession::connect(vec![short_clip()], ReplayConfig::default()).unwrap();
        session.request_response().unwrap();
        let events = collect_until(&session, |e| matches!(e, SessionEvent::TurnComplete));

        let durations: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::AudioChunkReceived(c) => Some(c.duration()),
                _ => None,
            })
            .collect();
        // 0.2s / 40ms = 5 块
        assert_eq!(durations.len(), 5);
        assert!(durations.iter().all(|d| (d - 0.04).abs() < 1e-9));
    }

    #[test]
    fn test_end_of_turn_triggers_response() {
        let session = ReplaySession::connect(vec![short_clip()], ReplayConfig::default()).unwrap();
        session.send_realtime_input(audio(0.3, 0.5)).unwrap();
        session.send_realtime_input(audio(0.0, 1.0)).unwrap();

        let events = collect_until(&session, |e| matches!(e, SessionEvent::TurnComplete));
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Transcript {
                speaker: Speaker::User,
                ..
            }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::AudioChunkReceived(_))));
    }

    #[test]
    fn test_barge_in_interrupts_response() {
        let long_clip = ResponseClip::from_samples("long", &vec![0.1; 24_000 * 10], 24_000, 24_000);
        let session = ReplaySession::connect(vec![long_clip], ReplayConfig::default()).unwrap();
        session.request_response().unwrap();

        // 等到至少一个应答块
        let first = collect_until(&session, |e| matches!(e, SessionEvent::AudioChunkReceived(_)));
        assert!(first
            .iter()
            .any(|e| matches!(e, SessionEvent::AudioChunkReceived(_))));

        session.send_realtime_input(audio(0.3, 0.3)).unwrap();
        let rest = collect_until(&session, |e| matches!(e, SessionEvent::Interrupted));
        assert!(matches!(rest.last(), Some(SessionEvent::Interrupted)));
        assert!(!rest.iter().any(|e| matches!(e, SessionEvent::TurnComplete)));
    }

    #[test]
    fn test_close_rejects_further_input() {
        let mut session = ReplaySession::connect(Vec::new(), ReplayConfig::default()).unwrap();
        session.close();
        assert!(matches!(
            session.send_realtime_input(audio(0.0, 0.1)),
            Err(SessionError::Closed)
        ));

        let events: Vec<SessionEvent> = session.events().try_iter().collect();
        assert!(matches!(events.last(), Some(SessionEvent::Closed { .. })));
    }

    #[test]
    fn test_tone_clip_has_audio() {
        let clip = ResponseClip::tone(24_000);
        assert!((clip.duration(24_000) - 1.5).abs() < 1e-3);
        assert!(clip.pcm.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_from_samples_resamples_to_wire_rate() {
        let clip = ResponseClip::from_samples("x", &vec![0.0; 48_000], 48_000, 24_000);
        assert!((clip.duration(24_000) - 1.0).abs() < 1e-3);
    }
}
