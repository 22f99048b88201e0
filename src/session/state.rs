//! 会话状态
//!
//! 开始会话时创建，停止 / 重置时销毁。持有调度器、两个分析器、
//! 麦克风闸门和对话记录；会话事件在这里分发。

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{SessionEvent, Speaker};
use crate::audio::{Analyser, PlaybackStats};
use crate::scheduler::{PlaybackScheduler, PlaybackSink, SourceId};

/// 对话记录最多保留的条数
const TRANSCRIPT_CAPACITY: usize = 200;

/// 会话状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Listening,
    Responding,
    Closed(String),
}

impl SessionStatus {
    /// 会话是否还能收发
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Listening | Self::Responding)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Listening => write!(f, "Listening"),
            Self::Responding => write!(f, "Responding"),
            Self::Closed(reason) => write!(f, "Closed ({})", reason),
        }
    }
}

/// 麦克风闸门
///
/// 模型开始应答时静音一个固定窗口（可配置），避免扬声器回声被当成用户插话；
/// 另有手动静音开关
#[derive(Debug, Clone)]
pub struct InputGate {
    mute_window: Duration,
    muted_until: Option<Instant>,
    manual_mute: bool,
}

impl InputGate {
    pub fn new(mute_window: Duration) -> Self {
        Self {
            mute_window,
            muted_until: None,
            manual_mute: false,
        }
    }

    /// 模型开始应答
    pub fn begin_response(&mut self, now: Instant) {
        if self.mute_window.is_zero() {
            return;
        }
        self.muted_until = Some(now + self.mute_window);
    }

    pub fn is_open(&self, now: Instant) -> bool {
        !self.manual_mute && self.muted_until.map_or(true, |until| now >= until)
    }

    /// 应答静音还剩多久
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.muted_until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    /// 切换手动静音，返回切换后是否静音
    pub fn toggle_manual(&mut self) -> bool {
        self.manual_mute = !self.manual_mute;
        self.manual_mute
    }

    pub fn is_manually_muted(&self) -> bool {
        self.manual_mute
    }
}

/// 一条对话记录
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub time: String,
    /// None 表示系统消息
    pub speaker: Option<Speaker>,
    pub text: String,
}

/// 对话记录（环形，保留最近的条目）
#[derive(Debug, Default)]
pub struct Transcript {
    entries: VecDeque<TranscriptEntry>,
}

impl Transcript {
    pub fn push(&mut self, speaker: Option<Speaker>, text: impl Into<String>) {
        if self.entries.len() >= TRANSCRIPT_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(TranscriptEntry {
            time: chrono::Local::now().format("%H:%M:%S").to_string(),
            speaker,
            text: text.into(),
        });
    }

    pub fn system(&mut self, text: impl Into<String>) {
        self.push(None, text);
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &TranscriptEntry> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 会话状态对象
pub struct SessionState<S: PlaybackSink> {
    scheduler: PlaybackScheduler<S>,
    input_analyser: Option<Analyser>,
    output_analyser: Option<Analyser>,
    gate: InputGate,
    status: SessionStatus,
    transcript: Transcript,
    /// 最近一次会话错误，只用于显示；错误不改变会话状态
    last_error: Option<String>,
    responding: bool,
    turns: u64,
}

impl<S: PlaybackSink> SessionState<S> {
    pub fn new(sink: S, stats: Arc<PlaybackStats>, mute_window: Duration) -> Self {
        Self {
            scheduler: PlaybackScheduler::new(sink, stats),
            input_analyser: None,
            output_analyser: None,
            gate: InputGate::new(mute_window),
            status: SessionStatus::Connecting,
            transcript: Transcript::default(),
            last_error: None,
            responding: false,
            turns: 0,
        }
    }

    pub fn set_input_analyser(&mut self, analyser: Analyser) {
        self.input_analyser = Some(analyser);
    }

    pub fn set_output_analyser(&mut self, analyser: Analyser) {
        self.output_analyser = Some(analyser);
    }

    /// 分发一个会话事件
    ///
    /// `clock_now` 是音频时钟读数，`now` 是墙上时间（用于麦克风闸门）
    pub fn handle_event(&mut self, event: SessionEvent, clock_now: f64, now: Instant) {
        log::trace!("Session event: {}", event.kind());

        match event {
            SessionEvent::Opened => {
                self.status = SessionStatus::Listening;
                self.transcript.system("Session opened");
            }
            SessionEvent::AudioChunkReceived(chunk) => {
                if !self.responding {
                    self.responding = true;
                    self.gate.begin_response(now);
                    self.status = SessionStatus::Responding;
                }
                self.scheduler.schedule_chunk(&chunk, clock_now);
            }
            SessionEvent::Interrupted => {
                self.scheduler.interrupt();
                self.responding = false;
                self.status = SessionStatus::Listening;
                self.transcript.system("Interrupted");
            }
            SessionEvent::TurnComplete => {
                self.responding = false;
                self.turns += 1;
                if self.status == SessionStatus::Responding {
                    self.status = SessionStatus::Listening;
                }
            }
            SessionEvent::Transcript { speaker, text } => {
                self.transcript.push(Some(speaker), text);
            }
            SessionEvent::Errored(msg) => {
                log::error!("Session error: {}", msg);
                self.transcript.system(format!("Error: {}", msg));
                self.last_error = Some(msg);
            }
            SessionEvent::Closed { reason } => {
                self.scheduler.interrupt();
                self.responding = false;
                self.transcript.system(format!("Session closed: {}", reason));
                self.status = SessionStatus::Closed(reason);
            }
        }
    }

    /// 播放端回报块自然结束
    pub fn on_source_ended(&mut self, id: SourceId) {
        self.scheduler.on_source_ended(id);
    }

    /// 本地打断（用户按键），不经过会话
    pub fn interrupt_playback(&mut self) -> usize {
        let stopped = self.scheduler.interrupt();
        self.responding = false;
        if self.status == SessionStatus::Responding {
            self.status = SessionStatus::Listening;
        }
        stopped
    }

    /// 当前是否应该把麦克风数据发往会话
    pub fn accepts_input(&self, now: Instant) -> bool {
        self.status.is_live() && self.gate.is_open(now)
    }

    pub fn analysers_mut(&mut self) -> (Option<&mut Analyser>, Option<&mut Analyser>) {
        (self.input_analyser.as_mut(), self.output_analyser.as_mut())
    }

    pub fn scheduler(&self) -> &PlaybackScheduler<S> {
        &self.scheduler
    }

    pub fn gate(&self) -> &InputGate {
        &self.gate
    }

    pub fn gate_mut(&mut self) -> &mut InputGate {
        &mut self.gate
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    pub fn is_responding(&self) -> bool {
        self.responding
    }

    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// 销毁：停止所有播放，交回播放端
    pub fn teardown(mut self) -> S {
        let stopped = self.scheduler.interrupt();
        log::debug!("Session state torn down ({} sources stopped)", stopped);
        self.scheduler.into_sink()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioChunk;

    #[derive(Default)]
    struct CountingSink {
        started: Vec<(SourceId, f64)>,
        stopped: Vec<SourceId>,
    }

    impl PlaybackSink for CountingSink {
        fn start(&mut self, id: SourceId, _chunk: &AudioChunk, when: f64) {
            self.started.push((id, when));
        }

        fn stop(&mut self, id: SourceId) {
            self.stopped.push(id);
        }
    }

    fn state(mute: Duration) -> SessionState<CountingSink> {
        SessionState::new(CountingSink::default(), Arc::new(PlaybackStats::new()), mute)
    }

    fn chunk(secs: f64) -> SessionEvent {
        SessionEvent::AudioChunkReceived(AudioChunk::silence(secs, 1000))
    }

    #[test]
    fn test_opened_goes_live() {
        let mut s = state(Duration::from_secs(2));
        assert_eq!(*s.status(), SessionStatus::Connecting);
        assert!(!s.accepts_input(Instant::now()));

        s.handle_event(SessionEvent::Opened, 0.0, Instant::now());
        assert_eq!(*s.status(), SessionStatus::Listening);
        assert!(s.accepts_input(Instant::now()));
    }

    #[test]
    fn test_response_mutes_input_for_window() {
        let mut s = state(Duration::from_secs(2));
        let t0 = Instant::now();
        s.handle_event(SessionEvent::Opened, 0.0, t0);
        s.handle_event(chunk(0.5), 0.0, t0);

        assert!(s.is_responding());
        assert!(!s.accepts_input(t0 + Duration::from_millis(1500)));
        assert!(s.accepts_input(t0 + Duration::from_millis(2000)));

        // 同一轮里后续块不会延长静音窗口
        s.handle_event(chunk(0.5), 0.1, t0 + Duration::from_millis(1900));
        assert!(s.accepts_input(t0 + Duration::from_millis(2001)));
    }

    #[test]
    fn test_zero_mute_window_never_mutes() {
        let mut s = state(Duration::ZERO);
        let t0 = Instant::now();
        s.handle_event(SessionEvent::Opened, 0.0, t0);
        s.handle_event(chunk(0.5), 0.0, t0);
        assert!(s.accepts_input(t0));
    }

    #[test]
    fn test_chunks_are_scheduled_back_to_back() {
        let mut s = state(Duration::ZERO);
        let t0 = Instant::now();
        s.handle_event(SessionEvent::Opened, 0.0, t0);
        for d in [1.0, 0.5, 2.0] {
            s.handle_event(chunk(d), 0.0, t0);
        }
        assert_eq!(s.scheduler().next_start_time(), 3.5);
        assert_eq!(s.scheduler().active_len(), 3);
    }

    #[test]
    fn test_interrupted_flushes_playback() {
        let mut s = state(Duration::ZERO);
        let t0 = Instant::now();
        s.handle_event(SessionEvent::Opened, 0.0, t0);
        s.handle_event(chunk(1.0), 0.0, t0);
        s.handle_event(chunk(1.0), 0.0, t0);

        s.handle_event(SessionEvent::Interrupted, 0.4, t0);
        assert_eq!(s.scheduler().active_len(), 0);
        assert_eq!(s.scheduler().next_start_time(), 0.0);
        assert_eq!(*s.status(), SessionStatus::Listening);
        assert!(!s.is_responding());

        // 下一轮重新开始应答
        s.handle_event(chunk(1.0), 0.6, t0);
        assert!(s.is_responding());
        assert_eq!(s.scheduler().active().next().unwrap().start, 0.6);
    }

    #[test]
    fn test_turn_complete_and_transcript() {
        let mut s = state(Duration::ZERO);
        let t0 = Instant::now();
        s.handle_event(SessionEvent::Opened, 0.0, t0);
        s.handle_event(chunk(0.1), 0.0, t0);
        s.handle_event(
            SessionEvent::Transcript {
                speaker: Speaker::Model,
                text: "hi there".into(),
            },
            0.0,
            t0,
        );
        s.handle_event(SessionEvent::TurnComplete, 0.0, t0);

        assert_eq!(s.turns(), 1);
        assert_eq!(*s.status(), SessionStatus::Listening);
        let last = s.transcript().entries().last().unwrap();
        assert_eq!(last.speaker, Some(Speaker::Model));
        assert_eq!(last.text, "hi there");
    }

    #[test]
    fn test_error_and_close() {
        let mut s = state(Duration::ZERO);
        let t0 = Instant::now();
        s.handle_event(SessionEvent::Opened, 0.0, t0);
        s.handle_event(SessionEvent::Errored("bad payload".into()), 0.0, t0);
        assert_eq!(s.last_error(), Some("bad payload"));
        assert_eq!(*s.status(), SessionStatus::Listening);

        s.handle_event(chunk(1.0), 0.0, t0);
        s.handle_event(
            SessionEvent::Closed {
                reason: "bye".into(),
            },
            0.0,
            t0,
        );
        assert_eq!(s.scheduler().active_len(), 0);
        assert!(matches!(s.status(), SessionStatus::Closed(_)));
    }

    #[test]
    fn test_error_mid_response_keeps_session_live() {
        let mut s = state(Duration::ZERO);
        let t0 = Instant::now();
        s.handle_event(SessionEvent::Opened, 0.0, t0);
        s.handle_event(chunk(0.1), 0.0, t0);
        s.handle_event(SessionEvent::Errored("bad chunk".into()), 0.0, t0);
        assert_eq!(*s.status(), SessionStatus::Responding);

        s.handle_event(chunk(0.1), 0.0, t0);
        s.handle_event(SessionEvent::TurnComplete, 0.0, t0);
        assert_eq!(*s.status(), SessionStatus::Listening);
        assert!(s.accepts_input(t0));
        assert_eq!(s.last_error(), Some("bad chunk"));
        assert_eq!(s.scheduler().active_len(), 2);
    }

    #[test]
    fn test_manual_mute() {
        let mut s = state(Duration::ZERO);
        let t0 = Instant::now();
        s.handle_event(SessionEvent::Opened, 0.0, t0);
        assert!(s.gate_mut().toggle_manual());
        assert!(!s.accepts_input(t0));
        assert!(!s.gate_mut().toggle_manual());
        assert!(s.accepts_input(t0));
    }

    #[test]
    fn test_teardown_stops_active_sources() {
        let mut s = state(Duration::ZERO);
        let t0 = Instant::now();
        s.handle_event(SessionEvent::Opened, 0.0, t0);
        s.handle_event(chunk(1.0), 0.0, t0);
        s.handle_event(chunk(1.0), 0.0, t0);

        let sink = s.teardown();
        assert_eq!(sink.started.len(), 2);
        assert_eq!(sink.stopped, vec![1, 2]);
    }

    #[test]
    fn test_transcript_is_capped() {
        let mut t = Transcript::default();
        for i in 0..(TRANSCRIPT_CAPACITY + 5) {
            t.system(format!("line {}", i));
        }
        assert_eq!(t.len(), TRANSCRIPT_CAPACITY);
        assert_eq!(t.entries().next().unwrap().text, "line 5");
    }

    #[test]
    fn test_gate_remaining() {
        let mut gate = InputGate::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(gate.remaining(t0).is_none());
        gate.begin_response(t0);
        assert_eq!(gate.remaining(t0 + Duration::from_secs(1)), Some(Duration::from_secs(1)));
        assert!(gate.remaining(t0 + Duration::from_secs(3)).is_none());
    }
}
