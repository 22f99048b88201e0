//! 播放调度器
//!
//! 把异步到达的音频块排成无缝、按到达顺序播放的流，并支持打断（barge-in）。
//!
//! 核心簿记：
//! - `next_start_time`：下一块最早可以开始的时间，除打断重置外单调不减
//! - 活动集合：已排程 / 正在播放的块，自然结束或被停止时移除
//!
//! 调度器只在控制线程上被调用（`schedule_chunk` / `interrupt` / `on_source_ended`），
//! 不需要任何同步。

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::audio::{AudioChunk, PlaybackStats};

/// 活动块句柄
pub type SourceId = u64;

/// 播放端：把块在指定时刻交给硬件，或立即停止
///
/// 自然结束通过 `PlaybackScheduler::on_source_ended` 回报
pub trait PlaybackSink {
    fn start(&mut self, id: SourceId, chunk: &AudioChunk, when: f64);
    fn stop(&mut self, id: SourceId);
}

/// 单个块的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Scheduled,
    Playing,
    Finished,
}

/// 已排程的块
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledSource {
    #[inline]
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// 按时钟推断状态（停止的块已经不在活动集合里）
    pub fn state_at(&self, clock_now: f64) -> SourceState {
        if clock_now < self.start {
            SourceState::Scheduled
        } else if clock_now < self.end() {
            SourceState::Playing
        } else {
            SourceState::Finished
        }
    }
}

/// 播放调度器
pub struct PlaybackScheduler<S: PlaybackSink> {
    sink: S,
    next_start_time: f64,
    active: BTreeMap<SourceId, ScheduledSource>,
    next_id: SourceId,
    stats: Arc<PlaybackStats>,
}

impl<S: PlaybackSink> PlaybackScheduler<S> {
    pub fn new(sink: S, stats: Arc<PlaybackStats>) -> Self {
        Self {
            sink,
            next_start_time: 0.0,
            active: BTreeMap::new(),
            next_id: 1,
            stats,
        }
    }

    /// 排程一个块
    ///
    /// 起播时间 = max(next_start_time, clock_now)：紧接上一块播放，
    /// 队列已排空时从"现在"开始（接受一个间隙，绝不排到过去）。
    /// 零时长的块不产生任何播放，返回 None。
    pub fn schedule_chunk(&mut self, chunk: &AudioChunk, clock_now: f64) -> Option<ScheduledSource> {
        let duration = chunk.duration();
        if duration <= 0.0 {
            log::debug!("Ignoring empty audio chunk");
            return None;
        }

        if self.next_start_time > 0.0 && clock_now > self.next_start_time {
            let gap = clock_now - self.next_start_time;
            log::debug!("Playback underrun, {:.1} ms gap", gap * 1000.0);
            self.stats.record_underrun(gap);
        }

        let start = self.next_start_time.max(clock_now);
        let id = self.next_id;
        self.next_id += 1;

        self.sink.start(id, chunk, start);
        self.next_start_time = start + duration;

        let source = ScheduledSource {
            id,
            start,
            duration,
        };
        self.active.insert(id, source);
        self.stats.record_scheduled(duration);

        log::trace!(
            "Scheduled source {} at {:.3}s for {:.3}s (cursor {:.3}s)",
            id,
            start,
            duration,
            self.next_start_time
        );

        Some(source)
    }

    /// 打断：立即停止所有活动块，清空集合，游标归零
    ///
    /// 幂等；空集合上调用不产生任何停止。返回被停止的块数
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for &id in self.active.keys() {
            self.sink.stop(id);
        }
        self.active.clear();
        self.next_start_time = 0.0;

        if stopped > 0 {
            self.stats.record_interrupt(stopped);
            log::info!("Playback interrupted, {} sources stopped", stopped);
        }
        stopped
    }

    /// 播放端回报某块自然结束
    ///
    /// 已被打断移除的块会晚到结束通知，这里忽略并返回 false
    pub fn on_source_ended(&mut self, id: SourceId) -> bool {
        if self.active.remove(&id).is_some() {
            self.stats.record_finished();
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    #[inline]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// 活动块（按排程顺序）
    pub fn active(&self) -> impl Iterator<Item = &ScheduledSource> {
        self.active.values()
    }

    /// 队列里还剩多少秒（从 clock_now 算起）
    pub fn queued_secs(&self, clock_now: f64) -> f64 {
        if self.active.is_empty() {
            0.0
        } else {
            (self.next_start_time - clock_now).max(0.0)
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}
