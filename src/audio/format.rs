//! 音频格式和样本编解码
//!
//! 会话线上格式是 16-bit little-endian PCM，单声道：
//! - 上行（麦克风）：16 kHz
//! - 下行（模型语音）：24 kHz
//!
//! 内部统一使用 f32 [-1.0, 1.0]

/// PCM 流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub const fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// 每帧的字节数（PCM16）
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        2 * self.channels as usize
    }

    /// MIME 描述，形如 `audio/pcm;rate=16000`
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// 从 `audio/pcm;rate=N` 解析，缺省 rate 时使用 `default_rate`
    pub fn from_mime(mime: &str, default_rate: u32) -> Option<Self> {
        let mut parts = mime.split(';').map(str::trim);
        let kind = parts.next()?;
        if !kind.eq_ignore_ascii_case("audio/pcm") && !kind.eq_ignore_ascii_case("audio/l16") {
            return None;
        }

        let rate = parts
            .filter_map(|p| p.strip_prefix("rate="))
            .find_map(|r| r.parse::<u32>().ok())
            .unwrap_or(default_rate);

        Some(Self::mono(rate))
    }
}

/// PCM16 LE 字节 → f32 样本
///
/// 返回写入的样本数；奇数结尾的半个样本被忽略
pub fn pcm16_to_f32(bytes: &[u8], output: &mut Vec<f32>) -> usize {
    let before = output.len();
    output.extend(
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0),
    );
    output.len() - before
}

/// f32 样本 → PCM16 LE 字节（超出范围的样本会被钳位）
pub fn f32_to_pcm16(samples: &[f32], output: &mut Vec<u8>) {
    output.reserve(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        output.extend_from_slice(&v.to_le_bytes());
    }
}

/// 交错多声道 → 单声道（取平均）
pub fn downmix_to_mono(interleaved: &[f32], channels: usize, output: &mut Vec<f32>) {
    if channels <= 1 {
        output.extend_from_slice(interleaved);
        return;
    }
    let scale = 1.0 / channels as f32;
    output.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() * scale),
    );
}
