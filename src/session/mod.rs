//! 实时会话层
//!
//! 外部实时会话（语音识别、推理、轮次管理都在服务端）被抽象成：
//! - 下行：`SessionEvent` 事件流，通过 channel 投递到控制线程
//! - 上行：`LiveSession::send_realtime_input`（麦克风 PCM / 视频帧）
//!
//! 调度器只看到事件，不接触传输层。

mod replay;
mod state;

pub use replay::{ReplayConfig, ReplaySession, ResponseClip};
pub use state::{InputGate, SessionState, SessionStatus, Transcript, TranscriptEntry};

use crossbeam_channel::Receiver;

use crate::audio::format::PcmFormat;
use crate::audio::AudioChunk;

/// 会话错误
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("failed to load response clip {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: crate::decode::DecodeError,
    },
    #[error("transport error: {0}")]
    Transport(String),
}

/// 对话角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Model,
}

/// 会话下行事件
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Opened,
    /// 一块已解码的模型语音
    AudioChunkReceived(AudioChunk),
    /// 用户开口打断了模型
    Interrupted,
    /// 模型这一轮说完
    TurnComplete,
    Transcript {
        speaker: Speaker,
        text: String,
    },
    Errored(String),
    Closed {
        reason: String,
    },
}

impl SessionEvent {
    /// 事件类别名，用于日志
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::AudioChunkReceived(_) => "audio",
            Self::Interrupted => "interrupted",
            Self::TurnComplete => "turn-complete",
            Self::Transcript { .. } => "transcript",
            Self::Errored(_) => "error",
            Self::Closed { .. } => "closed",
        }
    }
}

/// 上行实时输入
#[derive(Debug, Clone)]
pub enum RealtimeInput {
    /// PCM16 LE 单声道
    Audio { pcm: Vec<u8>, format: PcmFormat },
    /// JPEG 帧
    Image {
        jpeg: Vec<u8>,
        width: u32,
        height: u32,
    },
}

impl RealtimeInput {
    pub fn mime_type(&self) -> String {
        match self {
            Self::Audio { format, .. } => format.mime_type(),
            Self::Image { .. } => "image/jpeg".to_string(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Audio { pcm, .. } => pcm.len(),
            Self::Image { jpeg, .. } => jpeg.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 实时会话
pub trait LiveSession {
    /// 上行一块实时输入（不阻塞）
    fn send_realtime_input(&self, input: RealtimeInput) -> Result<(), SessionError>;

    /// 下行事件
    fn events(&self) -> &Receiver<SessionEvent>;

    /// 主动请求模型应答（不等语音活动检测）
    fn request_response(&self) -> Result<(), SessionError>;

    /// 关闭会话；之后的发送返回 `SessionError::Closed`
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_input_mime() {
        let audio = RealtimeInput::Audio {
            pcm: vec![0; 4],
            format: PcmFormat::mono(16_000),
        };
        assert_eq!(audio.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(audio.len(), 4);

        let image = RealtimeInput::Image {
            jpeg: Vec::new(),
            width: 640,
            height: 480,
        };
        assert_eq!(image.mime_type(), "image/jpeg");
        assert!(image.is_empty());
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(SessionEvent::Interrupted.kind(), "interrupted");
        assert_eq!(
            SessionEvent::Closed {
                reason: String::new()
            }
            .kind(),
            "closed"
        );
    }
}
