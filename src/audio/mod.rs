//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: Lock-free 数据传递（分析器 tap）
//! - Clock: 音频帧时钟
//! - Format: PCM16 编解码
//! - Mixer: 渲染侧混音、样本精度起播
//! - Analyser: 字节频谱
//! - Stats: 播放统计
//! - Output / Input: cpal 设备

pub mod analyser;
pub mod chunk;
pub mod clock;
pub mod format;
pub mod input;
pub mod mixer;
pub mod output;
pub mod resample;
pub mod ring_buffer;
pub mod stats;

pub use analyser::{Analyser, AnalyserTap};
pub use chunk::AudioChunk;
pub use clock::{AudioClock, FrameClock};
pub use format::PcmFormat;
pub use input::{AudioInput, InputError};
pub use mixer::{Mixer, MixerEvent, MixerHandle};
pub use output::{AudioOutput, DeviceInfo, OutputConfig, OutputError};
pub use ring_buffer::RingBuffer;
pub use stats::{PlaybackStats, StatsReport};
