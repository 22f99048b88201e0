//! 会话配置

use std::time::Duration;

use crate::audio::analyser::{DEFAULT_FFT_SIZE, DEFAULT_SMOOTHING};
use crate::capture::{VideoQuality, FRAME_INTERVAL};

/// 模型语音下行的线上采样率
pub const OUTPUT_WIRE_RATE: u32 = 24_000;
/// 麦克风上行的线上采样率
pub const INPUT_WIRE_RATE: u32 = 16_000;
/// 模型开始应答后麦克风静音的时长
pub const DEFAULT_MUTE_WINDOW: Duration = Duration::from_secs(2);

/// 会话配置
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// 下行 PCM 采样率（未带 rate 参数的 payload 按这个解）
    pub output_rate: u32,
    /// 上行 PCM 采样率
    pub input_rate: u32,
    /// 每块上行麦克风数据的时长
    pub mic_chunk: Duration,
    /// 应答开始后的麦克风静音窗口，0 表示不静音
    pub mute_window: Duration,
    pub fft_size: usize,
    pub smoothing: f32,
    pub video_quality: VideoQuality,
    pub frame_interval: Duration,
    /// 是否发送视频帧
    pub video_enabled: bool,
    /// 是否打开麦克风
    pub mic_enabled: bool,
    /// 输出设备名（None 表示系统默认，支持部分匹配）
    pub output_device: Option<String>,
    pub input_device: Option<String>,
    pub output_gain: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_rate: OUTPUT_WIRE_RATE,
            input_rate: INPUT_WIRE_RATE,
            mic_chunk: Duration::from_millis(100),
            mute_window: DEFAULT_MUTE_WINDOW,
            fft_size: DEFAULT_FFT_SIZE,
            smoothing: DEFAULT_SMOOTHING,
            video_quality: VideoQuality::default(),
            frame_interval: FRAME_INTERVAL,
            video_enabled: false,
            mic_enabled: true,
            output_device: None,
            input_device: None,
            output_gain: 1.0,
        }
    }
}
