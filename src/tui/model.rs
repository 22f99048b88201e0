use std::collections::VecDeque;
use std::time::Instant;

use crate::engine::{Engine, EngineStats};
use crate::session::{LiveSession, SessionError, Speaker};

/// 应用日志最多保留的条数
const LOG_CAPACITY: usize = 50;

/// 建立新会话（每次按 `s` 开始时调用）
pub type SessionFactory = Box<dyn FnMut() -> Result<Box<dyn LiveSession>, SessionError>>;

/// 对话面板的一行
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptLine {
    pub time: String,
    pub speaker: Option<Speaker>,
    pub text: String,
}

/// TUI 应用状态
pub struct App {
    /// 会话引擎
    pub engine: Engine,

    connect: SessionFactory,

    /// 会话之外的日志（启动失败等），会话进行中显示会话自己的对话记录
    pub logs: VecDeque<TranscriptLine>,

    pub should_quit: bool,

    /// 缓存的统计信息（每个 tick 刷新一次）
    pub cached_stats: EngineStats,

    pub show_help: bool,
}

impl App {
    pub fn new(engine: Engine, connect: SessionFactory) -> Self {
        Self {
            engine,
            connect,
            logs: VecDeque::new(),
            should_quit: false,
            cached_stats: EngineStats::default(),
            show_help: false,
        }
    }

    /// 添加日志
    pub fn log(&mut self, message: impl Into<String>) {
        if self.logs.len() >= LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(TranscriptLine {
            time: chrono::Local::now().format("%H:%M:%S").to_string(),
            speaker: None,
            text: message.into(),
        });
    }

    pub fn start_session(&mut self) {
        if self.engine.is_running() {
            return;
        }
        let session = match (self.connect)() {
            Ok(session) => session,
            Err(e) => {
                log::error!("Failed to open session: {}", e);
                self.log(format!("Failed to open session: {}", e));
                return;
            }
        };
        if let Err(e) = self.engine.start(session) {
            log::error!("Failed to start session: {}", e);
            self.log(format!("Failed to start session: {}", e));
        }
    }

    pub fn stop_session(&mut self) {
        if !self.engine.is_running() {
            return;
        }
        // 会话记录随会话销毁，保留最后一条状态
        let status = self.engine.status();
        self.engine.stop();
        self.log(format!("Session stopped ({})", status));
    }

    pub fn toggle_session(&mut self) {
        if self.engine.is_running() {
            self.stop_session();
        } else {
            self.start_session();
        }
    }

    pub fn toggle_mute(&mut self) {
        if self.engine.toggle_mute().is_none() {
            self.log("No active session");
        }
    }

    pub fn interrupt(&mut self) {
        let stopped = self.engine.interrupt();
        log::debug!("Local interrupt stopped {} sources", stopped);
    }

    pub fn request_response(&mut self) {
        if let Err(e) = self.engine.request_response() {
            self.log(format!("Error: {}", e));
        }
    }

    /// 对话面板内容：会话进行中显示会话记录，否则显示应用日志
    pub fn transcript_lines(&self) -> Vec<TranscriptLine> {
        match self.engine.session_state() {
            Some(state) => state
                .transcript()
                .entries()
                .map(|e| TranscriptLine {
                    time: e.time.clone(),
                    speaker: e.speaker,
                    text: e.text.clone(),
                })
                .collect(),
            None => self.logs.iter().cloned().collect(),
        }
    }

    /// 更新统计信息、分发会话事件
    pub fn on_tick(&mut self) {
        self.engine.pump(Instant::now());
        self.cached_stats = self.engine.stats();
    }
}
