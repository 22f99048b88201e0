//! 音频时钟
//!
//! 调度器所用的时间基准是"输出设备已经渲染了多少帧"，而不是墙上时间：
//! 这样排好的起播时间和混音器实际开始发声的样本位置严格对应，不受线程调度抖动影响。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 单调音频时钟（秒）
pub trait AudioClock {
    fn current_time(&self) -> f64;
}

/// 由渲染帧数驱动的时钟
///
/// 渲染回调调用 `advance`，控制线程调用 `current_time`。克隆共享同一计数。
#[derive(Clone)]
pub struct FrameClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl FrameClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate: sample_rate.max(1),
        }
    }

    /// 渲染回调推进时钟
    #[inline]
    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Release);
    }

    #[inline]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// 秒 → 帧（向最近的整数帧取整，负数截为 0）
    #[inline]
    pub fn secs_to_frames(&self, secs: f64) -> u64 {
        if secs <= 0.0 {
            0
        } else {
            (secs * self.sample_rate as f64).round() as u64
        }
    }
}

impl AudioClock for FrameClock {
    fn current_time(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_clock_tracks_rendered_frames() {
        let clock = FrameClock::new(48_000);
        assert_eq!(clock.current_time(), 0.0);

        let shared = clock.clone();
        shared.advance(24_000);
        assert!((clock.current_time() - 0.5).abs() < 1e-9);
        assert_eq!(clock.frames(), 24_000);
    }

    #[test]
    fn test_secs_to_frames() {
        let clock = FrameClock::new(24_000);
        assert_eq!(clock.secs_to_frames(1.5), 36_000);
        assert_eq!(clock.secs_to_frames(-1.0), 0);
        assert_eq!(clock.secs_to_frames(0.0), 0);
    }
}
