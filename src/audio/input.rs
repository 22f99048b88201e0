//! 麦克风输入（cpal）
//!
//! 输入回调把设备数据混成单声道，写入输入分析器 tap，并把样本块投递到
//! 采集通道。控制线程跟不上时丢块（有界通道，`try_send`），回调从不阻塞。
//!
//! 块缓冲区循环使用：控制线程用完后通过 `recycle` 还回来，回调从池里取，
//! 池空时才分配。

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use super::analyser::AnalyserTap;
use super::output::{device_name, pick_by_name, DeviceInfo};

/// 采集通道容量（块数）
const CAPTURE_QUEUE: usize = 64;

/// 预分配的单块样本容量
const BLOCK_CAPACITY: usize = 4096;

/// 麦克风错误
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("no default audio input device")]
    NoDefaultDevice,
    #[error("audio input device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to enumerate devices: {0}")]
    Devices(#[from] cpal::DevicesError),
    #[error("failed to query input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),
    #[error("microphone unavailable (is access permitted?): {0}")]
    PermissionDenied(String),
    #[error("failed to build input stream: {0}")]
    BuildStream(cpal::BuildStreamError),
    #[error("failed to start input stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(cpal::SampleFormat),
}

impl From<cpal::BuildStreamError> for InputError {
    fn from(e: cpal::BuildStreamError) -> Self {
        // 系统拒绝访问麦克风时通常表现为设备不可用或后端错误
        if matches!(
            e,
            cpal::BuildStreamError::DeviceNotAvailable | cpal::BuildStreamError::BackendSpecific { .. }
        ) {
            Self::PermissionDenied(e.to_string())
        } else {
            Self::BuildStream(e)
        }
    }
}

/// 麦克风输入
pub struct AudioInput {
    stream: cpal::Stream,
    device_name: String,
    sample_rate: u32,
    channels: u16,
    receiver: Receiver<Vec<f32>>,
    recycler: Sender<Vec<f32>>,
}

impl AudioInput {
    /// 获取所有输入设备
    pub fn get_all_input_devices() -> Result<Vec<DeviceInfo>, InputError> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().map(|d| device_name(&d));

        let mut devices = Vec::new();
        for device in host.input_devices()? {
            let Ok(config) = device.default_input_config() else {
                continue;
            };
            let name = device_name(&device);
            devices.push(DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                sample_rate: config.sample_rate(),
                channels: config.channels(),
            });
        }
        Ok(devices)
    }

    /// 打开麦克风并开始采集
    ///
    /// `tap` 为输入分析器的写入端
    pub fn start(device: Option<&str>, tap: Option<AnalyserTap>) -> Result<Self, InputError> {
        let host = cpal::default_host();
        let device = match device {
            Some(name) => pick_by_name(host.input_devices()?, name)
                .ok_or_else(|| InputError::DeviceNotFound(name.to_string()))?,
            None => host
                .default_input_device()
                .ok_or(InputError::NoDefaultDevice)?,
        };
        let name = device_name(&device);
        let supported = device.default_input_config()?;
        let sample_rate = supported.sample_rate();
        let channels = supported.channels();

        let (sender, receiver) = bounded(CAPTURE_QUEUE);
        let (recycler, pool) = bounded(CAPTURE_QUEUE);
        for _ in 0..CAPTURE_QUEUE {
            let _ = recycler.try_send(Vec::with_capacity(BLOCK_CAPACITY));
        }
        let blocks = BlockQueue { sender, pool };
        let stream_config: cpal::StreamConfig = supported.config();

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => run::<f32>(&device, &stream_config, blocks, tap)?,
            cpal::SampleFormat::I16 => run::<i16>(&device, &stream_config, blocks, tap)?,
            cpal::SampleFormat::U16 => run::<u16>(&device, &stream_config, blocks, tap)?,
            cpal::SampleFormat::I32 => run::<i32>(&device, &stream_config, blocks, tap)?,
            other => return Err(InputError::UnsupportedFormat(other)),
        };
        stream.play()?;

        log::info!("Input started: {} | {} Hz {}ch", name, sample_rate, channels);

        Ok(Self {
            stream,
            device_name: name,
            sample_rate,
            channels,
            receiver,
            recycler,
        })
    }

    /// 已采集的单声道样本块（设备采样率）
    pub fn receiver(&self) -> &Receiver<Vec<f32>> {
        &self.receiver
    }

    /// 用完的块还给回调复用
    pub fn recycle(&self, block: Vec<f32>) {
        let _ = self.recycler.try_send(block);
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn stop(self) {
        if let Err(e) = self.stream.pause() {
            log::debug!("Failed to pause input stream: {}", e);
        }
        log::info!("Input stopped: {}", self.device_name);
    }
}

/// 回调端：已填好的块发往控制线程，空块从池里取
struct BlockQueue {
    sender: Sender<Vec<f32>>,
    pool: Receiver<Vec<f32>>,
}

impl BlockQueue {
    fn take(&self) -> Vec<f32> {
        match self.pool.try_recv() {
            Ok(mut block) => {
                block.clear();
                block
            }
            Err(_) => Vec::with_capacity(BLOCK_CAPACITY),
        }
    }
}

/// 多声道帧混成单声道，追加到 `out`
fn downmix_into<T>(data: &[T], channels: usize, out: &mut Vec<f32>)
where
    T: Sample,
    f32: FromSample<T>,
{
    out.extend(data.chunks(channels).map(|frame| {
        frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / channels as f32
    }));
}

fn run<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    blocks: BlockQueue,
    tap: Option<AnalyserTap>,
) -> Result<cpal::Stream, InputError>
where
    T: Sample + SizedSample,
    f32: FromSample<T>,
{
    let channels = (config.channels as usize).max(1);
    let mut dropped: u64 = 0;

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mut mono = blocks.take();
            downmix_into(data, channels, &mut mono);

            if let Some(ref tap) = tap {
                tap.push(&mono);
            }

            match blocks.sender.try_send(mono) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped.is_power_of_two() {
                        log::warn!("Capture queue full, {} mic blocks dropped", dropped);
                    }
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        },
        |err| log::error!("Input stream error: {}", err),
        None,
    )?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_into_appends_mono() {
        let mut out = Vec::new();
        downmix_into(&[1.0f32, 0.0, 0.5, 0.5], 2, &mut out);
        assert_eq!(out, vec![0.5, 0.5]);

        downmix_into(&[i16::MAX, i16::MAX], 2, &mut out);
        assert_eq!(out.len(), 3);
        assert!((out[2] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_block_queue_reuses_returned_buffers() {
        let (sender, receiver) = bounded(4);
        let (recycler, pool) = bounded(4);
        let blocks = BlockQueue { sender, pool };

        let mut block = blocks.take();
        block.extend_from_slice(&[0.25; 100]);
        let ptr = block.as_ptr();
        blocks.sender.try_send(block).unwrap();

        // 控制线程用完后归还
        let used = receiver.try_recv().unwrap();
        recycler.try_send(used).unwrap();

        let again = blocks.take();
        assert!(again.is_empty());
        assert_eq!(again.as_ptr(), ptr);
        assert!(again.capacity() >= 100);
    }
}
