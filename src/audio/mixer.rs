//! 渲染侧混音器
//!
//! 运行在输出设备回调里。控制线程通过 `MixerHandle` 发送命令（起播 / 停止），
//! 混音器按样本精度在指定帧位置开始发声，自然播完时回报 `SourceEnded`。
//!
//! 回调里只做：非阻塞收命令、混音、推进帧时钟、写分析器 tap。不加锁。
//!
//! 还没到起播帧的声部排在 `pending` 里（按起播帧有序，调度器保证），
//! 到点才移入发声列表。排队的声部从不丢弃。

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::analyser::AnalyserTap;
use super::chunk::AudioChunk;
use super::clock::{AudioClock, FrameClock};
use super::stats::PlaybackStats;
use crate::scheduler::{PlaybackSink, SourceId};

/// 同时发声的声部数（预分配）
const VOICE_CAPACITY: usize = 16;

/// 排队声部的预分配容量，超出时扩容而不是丢弃
const PENDING_CAPACITY: usize = 1024;

/// 控制线程 → 渲染线程
#[derive(Debug)]
pub enum MixerCommand {
    Start {
        id: SourceId,
        chunk: AudioChunk,
        start_frame: u64,
    },
    Stop(SourceId),
    StopAll,
}

/// 渲染线程 → 控制线程
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerEvent {
    /// 声部自然播放结束
    SourceEnded(SourceId),
}

struct Voice {
    id: SourceId,
    chunk: AudioChunk,
    start_frame: u64,
    /// 源样本位置（小数，源采样率可以和设备不同）
    position: f64,
    step: f64,
}

impl Voice {
    /// 进入发声列表
    ///
    /// 起播帧已经过去（命令晚于排程时刻到达）时跳过错过的部分，
    /// 保持在排程的时间线上，不和下一块重叠
    fn begin(&mut self, buffer_start: u64) {
        if self.start_frame < buffer_start {
            let missed = buffer_start - self.start_frame;
            self.position = missed as f64 * self.step;
            log::debug!("Source {} started {} frames late", self.id, missed);
        }
    }

    /// 把本声部混入 `out`，返回是否已经播完
    fn mix_into(&mut self, out: &mut [f32], buffer_start: u64) -> bool {
        let offset = self.start_frame.saturating_sub(buffer_start) as usize;
        let samples = self.chunk.samples();
        let len = samples.len();

        for slot in &mut out[offset..] {
            let idx = self.position as usize;
            if idx >= len {
                return true;
            }
            let frac = (self.position - idx as f64) as f32;
            let a = samples[idx];
            let b = if idx + 1 < len { samples[idx + 1] } else { a };
            *slot += a + (b - a) * frac;
            self.position += self.step;
        }

        self.position as usize >= len
    }
}

/// 渲染侧混音器
pub struct Mixer {
    clock: FrameClock,
    commands: Receiver<MixerCommand>,
    events: Sender<MixerEvent>,
    voices: Vec<Voice>,
    pending: VecDeque<Voice>,
    scratch: Vec<f32>,
    tap: Option<AnalyserTap>,
    stats: Arc<PlaybackStats>,
    /// 输出增益
    gain: f32,
}

impl Mixer {
    /// 创建混音器和控制端句柄
    pub fn new(clock: FrameClock, stats: Arc<PlaybackStats>) -> (Self, MixerHandle) {
        let (cmd_tx, cmd_rx) = unbounded();
        let (evt_tx, evt_rx) = unbounded();

        let mixer = Self {
            clock: clock.clone(),
            commands: cmd_rx,
            events: evt_tx,
            voices: Vec::with_capacity(VOICE_CAPACITY),
            pending: VecDeque::with_capacity(PENDING_CAPACITY),
            scratch: Vec::with_capacity(8192),
            tap: None,
            stats,
            gain: 1.0,
        };

        let handle = MixerHandle {
            clock,
            commands: cmd_tx,
            events: evt_rx,
        };

        (mixer, handle)
    }

    /// 接入输出分析器
    pub fn with_tap(mut self, tap: AnalyserTap) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    fn apply_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                MixerCommand::Start {
                    id,
                    chunk,
                    start_frame,
                } => {
                    let step = chunk.sample_rate() as f64 / self.clock.sample_rate() as f64;
                    self.pending.push_back(Voice {
                        id,
                        chunk,
                        start_frame,
                        position: 0.0,
                        step,
                    });
                }
                MixerCommand::Stop(id) => {
                    self.voices.retain(|v| v.id != id);
                    self.pending.retain(|v| v.id != id);
                }
                MixerCommand::StopAll => {
                    self.voices.clear();
                    self.pending.clear();
                }
            }
        }
    }

    /// 把起播帧落在本块之前的排队声部移入发声列表
    fn promote_pending(&mut self, buffer_start: u64, frames: u64) {
        let buffer_end = buffer_start + frames;
        while self
            .pending
            .front()
            .map_or(false, |v| v.start_frame < buffer_end)
        {
            if let Some(mut voice) = self.pending.pop_front() {
                voice.begin(buffer_start);
                self.voices.push(voice);
            }
        }
    }

    /// 渲染单声道块（帧数 = out.len()）
    pub fn render_mono(&mut self, out: &mut [f32]) {
        self.apply_commands();

        out.fill(0.0);
        let buffer_start = self.clock.frames();
        self.promote_pending(buffer_start, out.len() as u64);

        let events = &self.events;
        self.voices.retain_mut(|voice| {
            let finished = voice.mix_into(out, buffer_start);
            if finished {
                let _ = events.send(MixerEvent::SourceEnded(voice.id));
            }
            !finished
        });

        if self.gain != 1.0 {
            for s in out.iter_mut() {
                *s *= self.gain;
            }
        }

        if let Some(ref tap) = self.tap {
            tap.push(out);
        }

        self.stats.on_callback(out.len(), self.voices.len());
        self.clock.advance(out.len() as u64);
    }

    /// 渲染交错多声道块（单声道内容复制到每个声道）
    pub fn render_interleaved(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.resize(frames, 0.0);
        self.render_mono(&mut scratch);

        for (frame, &sample) in out.chunks_mut(channels).zip(scratch.iter()) {
            frame.fill(sample);
        }
        self.scratch = scratch;
    }

    /// 发声中和排队中的声部总数
    pub fn active_voices(&self) -> usize {
        self.voices.len() + self.pending.len()
    }
}

/// 控制线程持有的混音器句柄，实现调度器的播放接口
#[derive(Clone)]
pub struct MixerHandle {
    clock: FrameClock,
    commands: Sender<MixerCommand>,
    events: Receiver<MixerEvent>,
}

impl MixerHandle {
    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    /// 取出所有已到达的渲染事件（非阻塞）
    pub fn drain_events(&self) -> Vec<MixerEvent> {
        self.events.try_iter().collect()
    }

    pub fn stop_all(&self) {
        let _ = self.commands.send(MixerCommand::StopAll);
    }
}

impl AudioClock for MixerHandle {
    fn current_time(&self) -> f64 {
        self.clock.current_time()
    }
}

impl PlaybackSink for MixerHandle {
    fn start(&mut self, id: SourceId, chunk: &AudioChunk, when: f64) {
        let start_frame = self.clock.secs_to_frames(when);
        if self
            .commands
            .send(MixerCommand::Start {
                id,
                chunk: chunk.clone(),
                start_frame,
            })
            .is_err()
        {
            log::warn!("Mixer is gone, source {} not started", id);
        }
    }

    fn stop(&mut self, id: SourceId) {
        let _ = self.commands.send(MixerCommand::Stop(id));
    }
}
