//! 播放统计模块
//!
//! 调度侧（控制线程）和渲染侧（音频回调）共同写入，全部是原子计数，
//! 回调里只做降频采样，减少开销

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// 统计采样间隔：每 N 次 callback 才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 回调间隔缓冲区大小
const INTERVAL_BUFFER_SIZE: usize = 256;

/// 播放统计收集器
///
/// 所有操作都是 lock-free 的，适合在音频回调中使用
pub struct PlaybackStats {
    epoch: Instant,

    // 调度侧
    chunks_scheduled: AtomicU64,
    scheduled_us: AtomicU64,
    underrun_count: AtomicU64,
    gap_us: AtomicU64,
    interrupt_count: AtomicU64,
    sources_stopped: AtomicU64,
    sources_finished: AtomicU64,

    // 渲染侧
    callback_count: AtomicU64,
    frames_rendered: AtomicU64,
    last_sampled_ns: AtomicU64,
    interval_buffer: Box<[AtomicU64; INTERVAL_BUFFER_SIZE]>,
    interval_write_idx: AtomicUsize,
    peak_voices: AtomicUsize,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            chunks_scheduled: AtomicU64::new(0),
            scheduled_us: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
            gap_us: AtomicU64::new(0),
            interrupt_count: AtomicU64::new(0),
            sources_stopped: AtomicU64::new(0),
            sources_finished: AtomicU64::new(0),
            callback_count: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            last_sampled_ns: AtomicU64::new(0),
            interval_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_write_idx: AtomicUsize::new(0),
            peak_voices: AtomicUsize::new(0),
        }
    }

    /// 记录一次调度（时长单位：秒）
    pub fn record_scheduled(&self, duration: f64) {
        self.chunks_scheduled.fetch_add(1, Ordering::Relaxed);
        self.scheduled_us
            .fetch_add((duration.max(0.0) * 1e6) as u64, Ordering::Relaxed);
    }

    /// 记录一次排空（队列已经播完，新块只能从"现在"开始）
    pub fn record_underrun(&self, gap: f64) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
        self.gap_us
            .fetch_add((gap.max(0.0) * 1e6) as u64, Ordering::Relaxed);
    }

    pub fn record_interrupt(&self, stopped: usize) {
        self.interrupt_count.fetch_add(1, Ordering::Relaxed);
        self.sources_stopped
            .fetch_add(stopped as u64, Ordering::Relaxed);
    }

    pub fn record_finished(&self) {
        self.sources_finished.fetch_add(1, Ordering::Relaxed);
    }

    /// 在 render callback 内调用
    #[inline]
    pub fn on_callback(&self, frames: usize, active_voices: usize) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);
        self.frames_rendered
            .fetch_add(frames as u64, Ordering::Relaxed);
        self.peak_voices.fetch_max(active_voices, Ordering::Relaxed);

        // 只在采样点读时间
        if count % SAMPLE_INTERVAL == 0 {
            let now = self.epoch.elapsed().as_nanos() as u64;
            let last = self.last_sampled_ns.swap(now, Ordering::Relaxed);
            if last > 0 {
                let idx = self.interval_write_idx.fetch_add(1, Ordering::Relaxed)
                    % INTERVAL_BUFFER_SIZE;
                self.interval_buffer[idx].store(now.saturating_sub(last), Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn interrupt_count(&self) -> u64 {
        self.interrupt_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn chunks_scheduled(&self) -> u64 {
        self.chunks_scheduled.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, frames_per_callback: u32, sample_rate: u32) -> StatsReport {
        let expected_interval_ns = if sample_rate > 0 {
            frames_per_callback as u64 * 1_000_000_000 / sample_rate as u64 * SAMPLE_INTERVAL
        } else {
            0
        };

        let intervals: Vec<u64> = self
            .interval_buffer
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .filter(|&v| v > 0)
            .collect();

        let interval_stats = match (intervals.iter().min(), intervals.iter().max()) {
            (Some(&min_ns), Some(&max_ns)) => IntervalStats {
                min_ns,
                max_ns,
                avg_ns: intervals.iter().sum::<u64>() / intervals.len() as u64,
            },
            _ => IntervalStats::default(),
        };

        StatsReport {
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            scheduled_secs: self.scheduled_us.load(Ordering::Relaxed) as f64 / 1e6,
            underrun_count: self.underrun_count.load(Ordering::Relaxed),
            gap_secs: self.gap_us.load(Ordering::Relaxed) as f64 / 1e6,
            interrupt_count: self.interrupt_count.load(Ordering::Relaxed),
            sources_stopped: self.sources_stopped.load(Ordering::Relaxed),
            sources_finished: self.sources_finished.load(Ordering::Relaxed),
            callback_count: self.callback_count.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            peak_voices: self.peak_voices.load(Ordering::Relaxed),
            expected_interval_ns,
            interval_stats,
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        for counter in [
            &self.chunks_scheduled,
            &self.scheduled_us,
            &self.underrun_count,
            &self.gap_us,
            &self.interrupt_count,
            &self.sources_stopped,
            &self.sources_finished,
            &self.callback_count,
            &self.frames_rendered,
            &self.last_sampled_ns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.interval_write_idx.store(0, Ordering::Relaxed);
        self.peak_voices.store(0, Ordering::Relaxed);
        for slot in self.interval_buffer.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for PlaybackStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub chunks_scheduled: u64,
    pub scheduled_secs: f64,
    pub underrun_count: u64,
    pub gap_secs: f64,
    pub interrupt_count: u64,
    pub sources_stopped: u64,
    pub sources_finished: u64,
    pub callback_count: u64,
    pub frames_rendered: u64,
    pub peak_voices: usize,
    pub expected_interval_ns: u64,
    pub interval_stats: IntervalStats,
}

#[derive(Debug, Default)]
pub struct IntervalStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Playback Statistics")?;
        writeln!(f, "===================")?;
        writeln!(
            f,
            "Chunks scheduled: {} ({:.2}s of audio)",
            self.chunks_scheduled, self.scheduled_secs
        )?;
        writeln!(
            f,
            "Underruns: {} (total gap {:.3}s)",
            self.underrun_count, self.gap_secs
        )?;
        writeln!(
            f,
            "Interrupts: {} ({} sources stopped)",
            self.interrupt_count, self.sources_stopped
        )?;
        writeln!(f, "Sources finished: {}", self.sources_finished)?;
        writeln!(f)?;

        writeln!(f, "Render callbacks: {}", self.callback_count)?;
        writeln!(f, "Frames rendered: {}", self.frames_rendered)?;
        writeln!(f, "Peak concurrent voices: {}", self.peak_voices)?;
        writeln!(
            f,
            "Callback timing (per {} callbacks): expected {:.2} ms, min {:.2} / max {:.2} / avg {:.2} ms",
            SAMPLE_INTERVAL,
            self.expected_interval_ns as f64 / 1e6,
            self.interval_stats.min_ns as f64 / 1e6,
            self.interval_stats.max_ns as f64 / 1e6,
            self.interval_stats.avg_ns as f64 / 1e6,
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_counters() {
        let stats = PlaybackStats::new();
        stats.record_scheduled(1.0);
        stats.record_scheduled(0.5);
        stats.record_underrun(0.25);
        stats.record_interrupt(2);

        let report = stats.report(512, 48_000);
        assert_eq!(report.chunks_scheduled, 2);
        assert!((report.scheduled_secs - 1.5).abs() < 1e-6);
        assert_eq!(report.underrun_count, 1);
        assert!((report.gap_secs - 0.25).abs() < 1e-6);
        assert_eq!(report.interrupt_count, 1);
        assert_eq!(report.sources_stopped, 2);
    }

    #[test]
    fn test_callback_counters_and_reset() {
        let stats = PlaybackStats::new();
        for _ in 0..40 {
            stats.on_callback(256, 3);
        }
        assert_eq!(stats.frames_rendered(), 40 * 256);

        let report = stats.report(256, 48_000);
        assert_eq!(report.callback_count, 40);
        assert_eq!(report.peak_voices, 3);

        stats.reset();
        let report = stats.report(256, 48_000);
        assert_eq!(report.callback_count, 0);
        assert_eq!(report.peak_voices, 0);
        assert_eq!(report.interval_stats.max_ns, 0);
    }

    #[test]
    fn test_report_display() {
        let stats = PlaybackStats::new();
        stats.record_scheduled(2.0);
        let text = stats.report(512, 48_000).to_string();
        assert!(text.contains("Chunks scheduled: 1"));
        assert!(text.contains("Underruns: 0"));
    }
}
