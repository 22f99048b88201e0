//! 重采样
//!
//! 会话两端的线上采样率固定（上行 16 kHz，下行 24 kHz），设备采样率由硬件决定，
//! 两者不一致时在这里做转换。语音带宽下线性插值已经足够。

/// 重采样器
pub trait Resampler: Send {
    /// 处理一段单声道样本，结果追加到 output
    ///
    /// 可以跨调用保持状态（流式），返回追加的样本数
    fn process(&mut self, input: &[f32], output: &mut Vec<f32>) -> usize;

    /// 重置内部状态
    fn reset(&mut self);

    /// 输出/输入采样率比
    fn ratio(&self) -> f64;
}

/// 直通（采样率一致时使用）
pub struct PassthroughResampler;

impl Resampler for PassthroughResampler {
    fn process(&mut self, input: &[f32], output: &mut Vec<f32>) -> usize {
        output.extend_from_slice(input);
        input.len()
    }

    fn reset(&mut self) {}

    fn ratio(&self) -> f64 {
        1.0
    }
}

/// 流式线性插值重采样器
pub struct LinearResampler {
    /// 每个输出样本在输入上前进的步长（= from / to）
    step: f64,
    /// 下一个输出样本相对于当前块起点的位置（可以为负：落在上一块的最后一个样本上）
    position: f64,
    /// 上一块的最后一个样本
    last: f32,
    primed: bool,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate.max(1) as f64 / to_rate.max(1) as f64,
            position: 0.0,
            last: 0.0,
            primed: false,
        }
    }
}

impl Resampler for LinearResampler {
    fn process(&mut self, input: &[f32], output: &mut Vec<f32>) -> usize {
        if input.is_empty() {
            return 0;
        }

        let before = output.len();

        if !self.primed {
            self.last = input[0];
            self.primed = true;
        }

        // 插值区间：[-1, len-1]，索引 -1 表示上一块的最后一个样本
        let len = input.len() as f64;
        while self.position < len - 1.0 {
            let base = self.position.floor();
            let frac = (self.position - base) as f32;
            let i = base as isize;

            let a = if i < 0 { self.last } else { input[i as usize] };
            let b = input[(i + 1) as usize];
            output.push(a + (b - a) * frac);

            self.position += self.step;
        }

        self.position -= len;
        self.last = input[input.len() - 1];

        output.len() - before
    }

    fn reset(&mut self) {
        self.position = 0.0;
        self.last = 0.0;
        self.primed = false;
    }

    fn ratio(&self) -> f64 {
        1.0 / self.step
    }
}

/// 按采样率选择重采样器
pub fn make_resampler(from_rate: u32, to_rate: u32) -> Box<dyn Resampler> {
    if from_rate == to_rate {
        Box::new(PassthroughResampler)
    } else {
        Box::new(LinearResampler::new(from_rate, to_rate))
    }
}

/// 一次性重采样整段样本
pub fn resample_once(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let mut out = Vec::with_capacity(
        (input.len() as f64 * to_rate as f64 / from_rate.max(1) as f64) as usize + 1,
    );
    let mut resampler = make_resampler(from_rate, to_rate);
    resampler.process(input, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        let out = resample_once(&[0.1, 0.2, 0.3], 16_000, 16_000);
        assert_eq!(out, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_downsample_length() {
        // 48k → 16k：长度约为 1/3
        let input: Vec<f32> = (0..4800).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = resample_once(&input, 48_000, 16_000);
        assert!((out.len() as i64 - 1600).abs() <= 1, "len = {}", out.len());
    }

    #[test]
    fn test_upsample_interpolates_linearly() {
        let out = resample_once(&[0.0, 1.0, 2.0], 1, 2);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let input: Vec<f32> = (0..1000).map(|i| i as f32 / 1000.0).collect();
        let one_shot = resample_once(&input, 24_000, 44_100);

        let mut resampler = LinearResampler::new(24_000, 44_100);
        let mut streamed = Vec::new();
        for block in input.chunks(97) {
            resampler.process(block, &mut streamed);
        }

        assert_eq!(one_shot.len(), streamed.len());
        for (a, b) in one_shot.iter().zip(&streamed) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_ratio() {
        assert!((LinearResampler::new(16_000, 48_000).ratio() - 3.0).abs() < 1e-9);
    }
}
