//! 解码后的音频块

use std::sync::Arc;

/// 一段解码完成的单声道 PCM
///
/// 产生后不可变；样本放在 `Arc<[f32]>` 里，调度器和渲染线程共享同一份数据
#[derive(Clone, Debug)]
pub struct AudioChunk {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate: sample_rate.max(1),
        }
    }

    /// 指定时长的静音块
    pub fn silence(duration_secs: f64, sample_rate: u32) -> Self {
        let frames = (duration_secs.max(0.0) * sample_rate as f64).round() as usize;
        Self::new(vec![0.0; frames], sample_rate)
    }

    #[inline]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 时长（秒）
    #[inline]
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// 峰值电平，用于日志
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration() {
        let chunk = AudioChunk::new(vec![0.0; 12_000], 24_000);
        assert_eq!(chunk.duration(), 0.5);
        assert_eq!(chunk.frames(), 12_000);
    }

    #[test]
    fn test_silence() {
        let chunk = AudioChunk::silence(1.0, 16_000);
        assert_eq!(chunk.frames(), 16_000);
        assert_eq!(chunk.peak(), 0.0);

        assert!(AudioChunk::silence(-1.0, 16_000).is_empty());
    }

    #[test]
    fn test_clone_shares_samples() {
        let chunk = AudioChunk::new(vec![0.25, -0.5], 8_000);
        let copy = chunk.clone();
        assert!(std::ptr::eq(chunk.samples().as_ptr(), copy.samples().as_ptr()));
        assert_eq!(copy.peak(), 0.5);
    }
}
