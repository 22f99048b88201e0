//! 音频解码
//!
//! 两条路径：
//! - `decode`：会话下发的原始 PCM16 负载（`audio/pcm;rate=N`），热路径，无外部依赖
//! - `AudioDecoder`：用 symphonia 打开本地应答音频文件（WAV/FLAC/AIFF/MP3），
//!   统一转成单声道 f32

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::audio::format::{downmix_to_mono, pcm16_to_f32, PcmFormat};
use crate::audio::AudioChunk;

/// 解码错误
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),
    #[error("unsupported audio format")]
    UnsupportedFormat,
    #[error("unsupported payload type: {0}")]
    UnsupportedMime(String),
    #[error("no audio track found")]
    NoAudioTrack,
    #[error("failed to create decoder: {0}")]
    DecoderCreation(String),
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    #[error("truncated PCM16 payload ({0} bytes)")]
    TruncatedPcm(usize),
}

/// 解码一段 PCM16 LE 负载
///
/// 多声道负载会被混为单声道；字节数不是整帧时报错而不是静默截断
pub fn decode(bytes: &[u8], format: PcmFormat) -> Result<AudioChunk, DecodeError> {
    if bytes.len() % format.bytes_per_frame() != 0 {
        return Err(DecodeError::TruncatedPcm(bytes.len()));
    }

    let mut interleaved = Vec::with_capacity(bytes.len() / 2);
    pcm16_to_f32(bytes, &mut interleaved);

    let samples = if format.channels > 1 {
        let mut mono = Vec::with_capacity(interleaved.len() / format.channels as usize);
        downmix_to_mono(&interleaved, format.channels as usize, &mut mono);
        mono
    } else {
        interleaved
    };

    Ok(AudioChunk::new(samples, format.sample_rate))
}

/// 按 MIME 解码（会话消息里的 inline data）
pub fn decode_inline(bytes: &[u8], mime: &str, default_rate: u32) -> Result<AudioChunk, DecodeError> {
    let format = PcmFormat::from_mime(mime, default_rate)
        .ok_or_else(|| DecodeError::UnsupportedMime(mime.to_string()))?;
    decode(bytes, format)
}

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u32,
    pub total_frames: Option<u64>,
    pub duration_secs: Option<f64>,
    pub codec: String,
}

/// 音频文件解码器
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    sample_buf: Option<SampleBuffer<f32>>,
    mono: Vec<f32>,
}

impl AudioDecoder {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();

        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|_| DecodeError::UnsupportedFormat)?;

        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let sample_rate = codec_params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u32)
            .unwrap_or(1);
        let total_frames = codec_params.n_frames;
        let duration_secs = total_frames.map(|f| f as f64 / sample_rate as f64);

        let codec = symphonia::default::get_codecs()
            .get_codec(codec_params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            info: AudioInfo {
                sample_rate,
                channels,
                total_frames,
                duration_secs,
                codec,
            },
            sample_buf: None,
            mono: Vec::new(),
        })
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    /// 解码下一个 packet，返回单声道样本
    ///
    /// 返回空切片表示文件结束
    pub fn decode_next(&mut self) -> Result<&[f32], DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.mono.clear();
                    return Ok(&self.mono);
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // 跳过损坏的帧
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count();
            let needed = decoded.capacity() * channels;
            if self.sample_buf.as_ref().map_or(true, |b| b.capacity() < needed) {
                self.sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
            }

            self.mono.clear();
            if let Some(buf) = self.sample_buf.as_mut() {
                buf.copy_interleaved_ref(decoded);
                downmix_to_mono(buf.samples(), channels, &mut self.mono);
            }
            return Ok(&self.mono);
        }
    }

    /// 解码整个文件为一个音频块
    pub fn decode_all(mut self) -> Result<AudioChunk, DecodeError> {
        let mut samples = Vec::with_capacity(self.info.total_frames.unwrap_or(0) as usize);
        loop {
            let block = self.decode_next()?;
            if block.is_empty() {
                break;
            }
            samples.extend_from_slice(block);
        }
        Ok(AudioChunk::new(samples, self.info.sample_rate))
    }
}
