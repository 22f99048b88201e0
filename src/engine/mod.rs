//! 会话引擎
//!
//! 把输出设备、混音器、调度器、麦克风、视频采集和实时会话接在一起。
//! 引擎本身只在控制线程上使用：宿主循环定期调用 `pump` 分发事件，
//! 每个渲染帧调用 `sample_tick` 画波形。音频回调和控制线程之间只有
//! crossbeam channel、原子帧时钟和分析器 ring buffer。

use std::sync::Arc;
use std::time::Instant;

use crate::audio::{
    Analyser, AudioClock, AudioInput, AudioOutput, FrameClock, InputError, Mixer, MixerEvent,
    MixerHandle, OutputConfig, OutputError, PlaybackStats,
};
use crate::capture::{CaptureError, MicCapture, TestPatternSource, VideoCapture};
use crate::config::SessionConfig;
use crate::decode::DecodeError;
use crate::sampler::{Surface, WaveformSampler};
use crate::session::{LiveSession, SessionError, SessionState, SessionStatus};

/// 引擎错误
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("output error: {0}")]
    Output(#[from] OutputError),
    #[error("input error: {0}")]
    Input(#[from] InputError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// 引擎统计快照
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// 音频时钟（秒）
    pub clock_secs: f64,
    /// 已排程但还没播完的时长
    pub queued_secs: f64,
    pub active_sources: usize,
    pub chunks_scheduled: u64,
    pub underrun_count: u64,
    pub interrupt_count: u64,
    pub mic_chunks_sent: u64,
    pub video_frames_sent: u64,
}

/// 会话引擎
pub struct Engine {
    config: SessionConfig,
    stats: Arc<PlaybackStats>,
    sampler: WaveformSampler,
    output: Option<AudioOutput>,
    input: Option<AudioInput>,
    mixer: Option<MixerHandle>,
    state: Option<SessionState<MixerHandle>>,
    session: Option<Box<dyn LiveSession>>,
    mic: Option<MicCapture>,
    video: Option<VideoCapture>,
    /// 本次会话开始前就出现的提示（例如麦克风不可用），开始后写入对话记录
    notices: Vec<String>,
}

impl Engine {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            stats: Arc::new(PlaybackStats::new()),
            sampler: WaveformSampler::new(),
            output: None,
            input: None,
            mixer: None,
            state: None,
            session: None,
            mic: None,
            video: None,
            notices: Vec::new(),
        }
    }

    /// 开始会话
    ///
    /// 输出设备失败是致命的；麦克风失败只记录并提示，会话照常进行（只听不说）
    pub fn start(&mut self, session: Box<dyn LiveSession>) -> Result<(), EngineError> {
        if self.is_running() {
            return Err(EngineError::InvalidState("session already running"));
        }
        self.stats.reset();

        let output_config = OutputConfig {
            device: self.config.output_device.clone(),
        };
        let device = AudioOutput::probe(&output_config)?;
        log::info!(
            "Output device: {} ({} Hz, {}ch)",
            device.name,
            device.sample_rate,
            device.channels
        );

        let clock = FrameClock::new(device.sample_rate);
        let (output_analyser, output_tap) = Analyser::new(self.config.fft_size, self.config.smoothing);
        let (mixer, handle) = Mixer::new(clock, Arc::clone(&self.stats));
        let mixer = mixer.with_tap(output_tap).with_gain(self.config.output_gain);
        let output = AudioOutput::start(&output_config, mixer)?;

        let (input_analyser, input_tap) = Analyser::new(self.config.fft_size, self.config.smoothing);
        if self.config.mic_enabled {
            match AudioInput::start(self.config.input_device.as_deref(), Some(input_tap)) {
                Ok(input) => {
                    self.mic = Some(MicCapture::new(
                        input.sample_rate(),
                        self.config.input_rate,
                        self.config.mic_chunk,
                    ));
                    self.input = Some(input);
                }
                Err(e) => {
                    log::error!("Microphone unavailable: {}", e);
                    self.notices.push(format!("Microphone unavailable: {}", e));
                }
            }
        }

        if self.config.video_enabled {
            let (w, h) = self.config.video_quality.dimensions();
            self.video = Some(VideoCapture::new(
                Box::new(TestPatternSource::new(w, h)),
                self.config.video_quality,
                self.config.frame_interval,
            ));
        }

        let mut state = SessionState::new(handle.clone(), Arc::clone(&self.stats), self.config.mute_window);
        state.set_input_analyser(input_analyser);
        state.set_output_analyser(output_analyser);
        for notice in self.notices.drain(..) {
            state.transcript_mut().system(notice);
        }

        self.output = Some(output);
        self.mixer = Some(handle);
        self.state = Some(state);
        self.session = Some(session);

        log::info!("Session started");
        Ok(())
    }

    /// 分发一轮事件：渲染端结束通知、会话事件、麦克风、视频
    pub fn pump(&mut self, now: Instant) {
        let (Some(state), Some(mixer), Some(session)) =
            (self.state.as_mut(), self.mixer.as_ref(), self.session.as_ref())
        else {
            return;
        };

        forward_mixer_events(mixer, state);

        let events: Vec<_> = session.events().try_iter().collect();
        for event in events {
            state.handle_event(event, mixer.current_time(), now);
        }

        if let (Some(input), Some(mic)) = (self.input.as_ref(), self.mic.as_mut()) {
            let open = state.accepts_input(now);
            for block in input.receiver().try_iter() {
                mic.push(&block, open, &**session);
                input.recycle(block);
            }
        }

        if let Some(video) = self.video.as_mut() {
            if state.status().is_live() {
                video.tick(now, &**session);
            }
        }
    }

    /// 一个渲染帧：刷新分析器并把波形画到表面上
    pub fn sample_tick(&mut self, surface: Option<&mut dyn Surface>) {
        match self.state.as_mut() {
            Some(state) => {
                let (input, output) = state.analysers_mut();
                self.sampler.sample_tick(input, output, surface);
            }
            None => self.sampler.sample_tick(None, None, surface),
        }
    }

    /// 本地打断：立即停掉所有排程的模型语音
    pub fn interrupt(&mut self) -> usize {
        self.state
            .as_mut()
            .map_or(0, |state| state.interrupt_playback())
    }

    /// 切换手动静音，返回切换后是否静音
    pub fn toggle_mute(&mut self) -> Option<bool> {
        self.state.as_mut().map(|state| {
            let muted = state.gate_mut().toggle_manual();
            state
                .transcript_mut()
                .system(if muted { "Microphone muted" } else { "Microphone unmuted" });
            muted
        })
    }

    /// 主动请求模型应答
    pub fn request_response(&mut self) -> Result<(), EngineError> {
        let session = self
            .session
            .as_ref()
            .ok_or(EngineError::InvalidState("no active session"))?;
        session.request_response()?;
        Ok(())
    }

    /// 停止会话并拆除所有设备
    pub fn stop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            // 关闭前已经在途的事件（包括 Closed）照常分发
            if let (Some(state), Some(mixer)) = (self.state.as_mut(), self.mixer.as_ref()) {
                let now = Instant::now();
                for event in session.events().try_iter() {
                    state.handle_event(event, mixer.current_time(), now);
                }
            }
        }

        if let Some(state) = self.state.take() {
            let status = state.status().clone();
            state.teardown();
            log::info!("Session stopped ({})", status);
        }

        if let Some(mixer) = self.mixer.take() {
            mixer.stop_all();
        }
        if let Some(input) = self.input.take() {
            input.stop();
        }
        self.mic = None;
        self.video = None;
        if let Some(output) = self.output.take() {
            output.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    /// 会话已打开且还没关闭
    pub fn is_live(&self) -> bool {
        self.state
            .as_ref()
            .map_or(false, |state| state.status().is_live())
    }

    /// 没有排程中的模型语音，也没有正在进行的应答
    pub fn is_idle(&self) -> bool {
        self.state
            .as_ref()
            .map_or(true, |state| state.scheduler().is_idle() && !state.is_responding())
    }

    pub fn session_state(&self) -> Option<&SessionState<MixerHandle>> {
        self.state.as_ref()
    }

    pub fn status(&self) -> SessionStatus {
        self.state
            .as_ref()
            .map_or_else(|| SessionStatus::Closed("stopped".into()), |s| s.status().clone())
    }

    pub fn output(&self) -> Option<&AudioOutput> {
        self.output.as_ref()
    }

    pub fn input(&self) -> Option<&AudioInput> {
        self.input.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn playback_stats(&self) -> &Arc<PlaybackStats> {
        &self.stats
    }

    pub fn sampler(&self) -> &WaveformSampler {
        &self.sampler
    }

    /// 获取统计信息
    pub fn stats(&self) -> EngineStats {
        let clock_secs = self.mixer.as_ref().map_or(0.0, |m| m.current_time());
        let (queued_secs, active_sources) = self.state.as_ref().map_or((0.0, 0), |s| {
            (
                s.scheduler().queued_secs(clock_secs),
                s.scheduler().active_len(),
            )
        });

        EngineStats {
            clock_secs,
            queued_secs,
            active_sources,
            chunks_scheduled: self.stats.chunks_scheduled(),
            underrun_count: self.stats.underrun_count(),
            interrupt_count: self.stats.interrupt_count(),
            mic_chunks_sent: self.mic.as_ref().map_or(0, |m| m.chunks_sent()),
            video_frames_sent: self.video.as_ref().map_or(0, |v| v.frames_sent()),
        }
    }
}

/// 渲染端的结束通知交给调度器，移出活动集合
fn forward_mixer_events(mixer: &MixerHandle, state: &mut SessionState<MixerHandle>) {
    for event in mixer.drain_events() {
        match event {
            MixerEvent::SourceEnded(id) => state.on_source_ended(id),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_engine() {
        let mut engine = Engine::new(SessionConfig::default());
        assert!(!engine.is_running());
        assert!(!engine.is_live());
        assert!(engine.is_idle());
        assert_eq!(engine.interrupt(), 0);
        assert!(engine.toggle_mute().is_none());
        assert!(matches!(engine.status(), SessionStatus::Closed(_)));

        let stats = engine.stats();
        assert_eq!(stats.active_sources, 0);
        assert_eq!(stats.clock_secs, 0.0);

        // 没有会话时渲染帧被跳过
        engine.sample_tick(None);
        assert_eq!(engine.sampler().frames_skipped(), 1);

        // 重复停止是安全的
        engine.stop();
        engine.stop();
    }

    #[test]
    fn test_request_response_without_session() {
        let mut engine = Engine::new(SessionConfig::default());
        assert!(matches!(
            engine.request_response(),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn test_response_plays_through_mixer_and_drains() {
        use crate::audio::AudioChunk;
        use crate::session::SessionEvent;
        use std::time::Duration;

        let stats = Arc::new(PlaybackStats::new());
        let (mut mixer, handle) = Mixer::new(FrameClock::new(1000), Arc::clone(&stats));
        let mut state = SessionState::new(handle.clone(), Arc::clone(&stats), Duration::ZERO);
        let now = Instant::now();

        state.handle_event(SessionEvent::Opened, handle.current_time(), now);
        let chunk = AudioChunk::new(vec![0.5; 40], 1000);
        for _ in 0..80 {
            state.handle_event(
                SessionEvent::AudioChunkReceived(chunk.clone()),
                handle.current_time(),
                now,
            );
        }
        state.handle_event(SessionEvent::TurnComplete, handle.current_time(), now);
        assert_eq!(state.scheduler().active_len(), 80);

        let mut out = vec![0.0f32; 128];
        let mut peak = 0.0f32;
        let mut silent = 0usize;
        for _ in 0..30 {
            mixer.render_mono(&mut out);
            let start = handle.clock().frames() - out.len() as u64;
            for (i, &s) in out.iter().enumerate() {
                peak = peak.max(s);
                if s == 0.0 && start + (i as u64) < 3200 {
                    silent += 1;
                }
            }
            forward_mixer_events(&handle, &mut state);
        }

        assert!(peak <= 0.5);
        assert_eq!(silent, 0);
        assert!(state.scheduler().is_idle());
        assert_eq!(stats.chunks_scheduled(), 80);
        assert_eq!(*state.status(), SessionStatus::Listening);
    }

    #[test]
    fn test_error_conversion() {
        let err: EngineError = SessionError::Closed.into();
        assert_eq!(err.to_string(), "session error: session is closed");

        let err: EngineError = OutputError::NoDefaultDevice.into();
        assert!(matches!(err, EngineError::Output(_)));
    }
}
