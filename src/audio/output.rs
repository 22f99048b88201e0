//! 音频输出（cpal）
//!
//! 输出回调只调用 `Mixer::render_interleaved`，再按设备样本格式转换。
//! 设备采样率由硬件决定，混音器在声部内部做重采样。

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};

use super::mixer::Mixer;

/// 设备信息
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub is_default: bool,
}

/// 输出配置
#[derive(Clone, Debug, Default)]
pub struct OutputConfig {
    /// 设备名（None 表示系统默认；支持不区分大小写的部分匹配）
    pub device: Option<String>,
}

/// 音频输出错误
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("no default audio output device")]
    NoDefaultDevice,
    #[error("audio device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to enumerate devices: {0}")]
    Devices(#[from] cpal::DevicesError),
    #[error("failed to query device config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),
    #[error("failed to build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),
    #[error("failed to start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(cpal::SampleFormat),
}

#[allow(deprecated)]
pub(crate) fn device_name(device: &cpal::Device) -> String {
    device.name().unwrap_or_else(|_| "<unknown>".to_string())
}

/// 按名称挑选设备：先精确匹配，再部分匹配（都不区分大小写）
pub(crate) fn pick_by_name<I>(devices: I, name: &str) -> Option<cpal::Device>
where
    I: IntoIterator<Item = cpal::Device>,
{
    let wanted = name.to_lowercase();
    let named: Vec<(String, cpal::Device)> = devices
        .into_iter()
        .map(|d| (device_name(&d).to_lowercase(), d))
        .collect();

    let exact = named.iter().position(|(n, _)| *n == wanted);
    let index = exact.or_else(|| named.iter().position(|(n, _)| n.contains(&wanted)))?;
    named.into_iter().nth(index).map(|(_, d)| d)
}

/// 音频输出
pub struct AudioOutput {
    stream: cpal::Stream,
    device_name: String,
    sample_rate: u32,
    channels: u16,
}

impl AudioOutput {
    /// 获取所有输出设备
    pub fn get_all_output_devices() -> Result<Vec<DeviceInfo>, OutputError> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().map(|d| device_name(&d));

        let mut devices = Vec::new();
        for device in host.output_devices()? {
            // 某些设备查询配置会失败（被占用、虚拟设备），跳过
            let Ok(config) = device.default_output_config() else {
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

    /// 按名称查找设备（支持部分匹配）
    pub fn find_device_by_name(name: &str) -> Option<DeviceInfo> {
        let devices = Self::get_all_output_devices().ok()?;
        let wanted = name.to_lowercase();

        devices
            .iter()
            .find(|d| d.name.to_lowercase() == wanted)
            .or_else(|| devices.iter().find(|d| d.name.to_lowercase().contains(&wanted)))
            .cloned()
    }

    /// 查询将要使用的设备的采样率（创建混音器前需要知道）
    pub fn probe(config: &OutputConfig) -> Result<DeviceInfo, OutputError> {
        let (device, stream_config) = Self::select(config)?;
        Ok(DeviceInfo {
            name: device_name(&device),
            sample_rate: stream_config.sample_rate(),
            channels: stream_config.channels(),
            is_default: config.device.is_none(),
        })
    }

    fn select(
        config: &OutputConfig,
    ) -> Result<(cpal::Device, cpal::SupportedStreamConfig), OutputError> {
        let host = cpal::default_host();
        let device = match config.device {
            Some(ref name) => pick_by_name(host.output_devices()?, name)
                .ok_or_else(|| OutputError::DeviceNotFound(name.clone()))?,
            None => host
                .default_output_device()
                .ok_or(OutputError::NoDefaultDevice)?,
        };
        let stream_config = device.default_output_config()?;
        Ok((device, stream_config))
    }

    /// 打开设备并开始输出
    ///
    /// 混音器的帧时钟必须按 `probe` 得到的采样率创建
    pub fn start(config: &OutputConfig, mixer: Mixer) -> Result<Self, OutputError> {
        let (device, supported) = Self::select(config)?;
        let name = device_name(&device);
        let sample_rate = supported.sample_rate();
        let channels = supported.channels();

        if mixer.clock().sample_rate() != sample_rate {
            log::warn!(
                "Mixer clock runs at {} Hz but device {} is {} Hz",
                mixer.clock().sample_rate(),
                name,
                sample_rate
            );
        }

        let stream_config: cpal::StreamConfig = supported.config();
        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => run::<f32>(&device, &stream_config, mixer)?,
            cpal::SampleFormat::I16 => run::<i16>(&device, &stream_config, mixer)?,
            cpal::SampleFormat::U16 => run::<u16>(&device, &stream_config, mixer)?,
            cpal::SampleFormat::I32 => run::<i32>(&device, &stream_config, mixer)?,
            other => return Err(OutputError::UnsupportedFormat(other)),
        };
        stream.play()?;

        log::info!(
            "Output started: {} | {} Hz {}ch {}",
            name,
            sample_rate,
            channels,
            supported.sample_format()
        );

        Ok(Self {
            stream,
            device_name: name,
            sample_rate,
            channels,
        })
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

    /// 停止输出（混音器随流一起销毁）
    pub fn stop(self) {
        if let Err(e) = self.stream.pause() {
            log::debug!("Failed to pause output stream: {}", e);
        }
        log::info!("Output stopped: {}", self.device_name);
    }
}

fn run<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut mixer: Mixer,
) -> Result<cpal::Stream, OutputError>
where
    T: Sample + SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    // 预分配，回调里一般不会再扩容
    let mut buffer: Vec<f32> = Vec::with_capacity(8192);

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            buffer.resize(data.len(), 0.0);
            mixer.render_interleaved(&mut buffer, channels);
            for (dst, &src) in data.iter_mut().zip(buffer.iter()) {
                *dst = T::from_sample(src);
            }
        },
        |err| log::error!("Output stream error: {}", err),
        None,
    )?;

    Ok(stream)
}
