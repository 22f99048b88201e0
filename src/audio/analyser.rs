//! 频谱分析器
//!
//! 行为对齐浏览器的 AnalyserNode `getByteFrequencyData`：
//! - 最近 fft_size 个时域样本，Blackman 窗
//! - FFT 幅度 / fft_size，按时间常数平滑
//! - dB 映射：[min_db, max_db] → 0..=255
//!
//! 音频回调通过 `AnalyserTap` 写入样本（lock-free ring buffer），
//! 控制线程在每个渲染帧调用 `refresh` 重新计算快照。

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use super::ring_buffer::RingBuffer;

pub const DEFAULT_FFT_SIZE: usize = 256;
pub const DEFAULT_SMOOTHING: f32 = 0.8;
pub const DEFAULT_MIN_DB: f32 = -100.0;
pub const DEFAULT_MAX_DB: f32 = -30.0;

const MIN_FFT_SIZE: usize = 32;
const MAX_FFT_SIZE: usize = 32768;

/// 音频回调侧的写入端
#[derive(Clone)]
pub struct AnalyserTap {
    ring: Arc<RingBuffer<f32>>,
}

impl AnalyserTap {
    /// 写入单声道样本；环满时丢弃（读端每帧只取最近的窗口）
    #[inline]
    pub fn push(&self, samples: &[f32]) {
        self.ring.write(samples);
    }
}

/// 频谱分析器（控制线程侧）
pub struct Analyser {
    ring: Arc<RingBuffer<f32>>,
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    window: Vec<f32>,
    /// 最近 fft_size 个时域样本（时间顺序）
    history: Vec<f32>,
    incoming: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    fft_scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    snapshot: Vec<u8>,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
}

impl Analyser {
    /// 创建分析器和写入端
    ///
    /// fft_size 会被限制在 [32, 32768] 并向上取整到 2 的幂
    pub fn new(fft_size: usize, smoothing: f32) -> (Self, AnalyserTap) {
        let fft_size = fft_size.clamp(MIN_FFT_SIZE, MAX_FFT_SIZE).next_power_of_two();
        let bins = fft_size / 2;

        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        let scratch_len = fft.get_inplace_scratch_len();

        // 环容量留足 8 个窗口，读端偶尔掉帧也不会丢最近的数据
        let ring = Arc::new(RingBuffer::with_min_capacity(fft_size * 8));
        ring.lock_memory();

        let analyser = Self {
            ring: Arc::clone(&ring),
            fft,
            fft_size,
            window: blackman_window(fft_size),
            history: vec![0.0; fft_size],
            incoming: vec![0.0; fft_size],
            spectrum: vec![Complex::new(0.0, 0.0); fft_size],
            fft_scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            smoothed: vec![0.0; bins],
            snapshot: vec![0; bins],
            smoothing: smoothing.clamp(0.0, 1.0),
            min_db: DEFAULT_MIN_DB,
            max_db: DEFAULT_MAX_DB,
        };

        (analyser, AnalyserTap { ring })
    }

    #[inline]
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// 频点数 = fft_size / 2
    #[inline]
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// 拉取新样本并重新计算快照
    pub fn refresh(&mut self) {
        self.pull_samples();

        for ((dst, &x), &w) in self.spectrum.iter_mut().zip(&self.history).zip(&self.window) {
            *dst = Complex::new(x * w, 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.spectrum, &mut self.fft_scratch);

        let norm = 1.0 / self.fft_size as f32;
        let range = self.max_db - self.min_db;
        let k = self.smoothing;

        for ((smoothed, byte), bin) in self
            .smoothed
            .iter_mut()
            .zip(self.snapshot.iter_mut())
            .zip(self.spectrum.iter())
        {
            let magnitude = bin.norm() * norm;
            *smoothed = k * *smoothed + (1.0 - k) * magnitude;

            *byte = if *smoothed > 0.0 {
                let db = 20.0 * smoothed.log10();
                (255.0 * (db - self.min_db) / range).clamp(0.0, 255.0) as u8
            } else {
                0
            };
        }
    }

    /// 最近一次 `refresh` 的字节频谱（长度 = frequency_bin_count）
    #[inline]
    pub fn byte_frequency_data(&self) -> &[u8] {
        &self.snapshot
    }

    /// 清空历史和平滑状态
    pub fn reset(&mut self) {
        self.ring.clear();
        self.history.fill(0.0);
        self.smoothed.fill(0.0);
        self.snapshot.fill(0);
    }

    fn pull_samples(&mut self) {
        self.ring.skip_to_latest(self.fft_size);
        let n = self.ring.read(&mut self.incoming);
        if n == 0 {
            return;
        }
        // 历史左移 n 个样本，新样本接在末尾
        self.history.copy_within(n.., 0);
        let start = self.fft_size - n;
        self.history[start..].copy_from_slice(&self.incoming[..n]);
    }
}

/// Blackman 窗（alpha = 0.16）
fn blackman_window(size: usize) -> Vec<f32> {
    let alpha = 0.16f32;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5;
    let a2 = 0.5 * alpha;
    let n = size as f32;
    (0..size)
        .map(|i| {
            let x = std::f32::consts::TAU * i as f32 / n;
            a0 - a1 * x.cos() + a2 * (2.0 * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq_bin: usize, fft_size: usize, len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| {
                amp * (std::f32::consts::TAU * freq_bin as f32 * i as f32 / fft_size as f32).sin()
            })
            .collect()
    }

    #[test]
    fn test_bin_count_and_size_normalisation() {
        let (a, _) = Analyser::new(256, 0.8);
        assert_eq!(a.frequency_bin_count(), 128);
        assert_eq!(a.byte_frequency_data().len(), 128);

        let (a, _) = Analyser::new(100, 0.8);
        assert_eq!(a.fft_size(), 128);

        let (a, _) = Analyser::new(1, 0.8);
        assert_eq!(a.fft_size(), 32);
    }

    #[test]
    fn test_silence_is_all_zero() {
        let (mut a, tap) = Analyser::new(64, 0.0);
        tap.push(&[0.0; 64]);
        a.refresh();
        assert!(a.byte_frequency_data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sine_peaks_at_its_bin() {
        let (mut a, tap) = Analyser::new(256, 0.0);
        // 小幅度，避免相邻频点的主瓣泄漏也被钳到 255
        tap.push(&sine(20, 256, 256, 0.05));
        a.refresh();

        let data = a.byte_frequency_data();
        let peak = data
            .iter()
            .enumerate()
            .max_by_key(|(_, &b)| b)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 20);
        assert!(data[20] > data[21]);
        assert!(data[20] > data[19]);
        // 远离峰值的频点很低
        assert!(data[80] < data[20] / 2);
    }

    #[test]
    fn test_smoothing_decays_gradually() {
        let (mut a, tap) = Analyser::new(64, 0.8);
        tap.push(&sine(8, 64, 64, 0.5));
        a.refresh();
        let loud = a.byte_frequency_data()[8];

        // 之后是静音：平滑值衰减但不会立刻归零
        tap.push(&[0.0; 64]);
        a.refresh();
        let after = a.byte_frequency_data()[8];
        assert!(after > 0);
        assert!(after <= loud);
    }

    #[test]
    fn test_only_latest_window_is_used() {
        let (mut a, tap) = Analyser::new(32, 0.0);
        // 先写入很多响亮的数据，再写入一个窗口的静音
        tap.push(&vec![0.9; 32 * 4]);
        tap.push(&[0.0; 32]);
        a.refresh();
        assert!(a.byte_frequency_data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_reset_clears_snapshot() {
        let (mut a, tap) = Analyser::new(64, 0.5);
        tap.push(&sine(4, 64, 64, 0.5));
        a.refresh();
        assert!(a.byte_frequency_data().iter().any(|&b| b > 0));

        a.reset();
        assert!(a.byte_frequency_data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_blackman_window_shape() {
        let w = blackman_window(64);
        assert!(w[0].abs() < 1e-6);
        assert!((w[32] - 1.0).abs() < 1e-5);
    }
}
