//! 上行采集
//!
//! - 视频：固定间隔（默认 500 ms）抓一帧，缩放到质量档位对应的尺寸，JPEG 编码后发送
//! - 麦克风：设备采样率 → 16 kHz，切成固定时长的 PCM16 块发送；闸门关闭时丢弃
//!
//! 发送失败只记录日志并丢掉这一帧 / 这一块，不重试，采集循环继续。

use std::fmt;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

use crate::audio::format::{f32_to_pcm16, PcmFormat};
use crate::audio::resample::{make_resampler, Resampler};
use crate::session::{LiveSession, RealtimeInput, SessionError};

/// 默认抓帧间隔
pub const FRAME_INTERVAL: Duration = Duration::from_millis(500);

const JPEG_QUALITY: u8 = 80;

/// 采集错误
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),
    #[error("frame source unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to send frame: {0}")]
    Send(#[from] SessionError),
}

/// 视频质量档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum VideoQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl VideoQuality {
    /// (宽, 高)
    pub const fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Low => (640, 480),
            Self::Medium => (1280, 720),
            Self::High => (1920, 1080),
        }
    }
}

impl fmt::Display for VideoQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, h) = self.dimensions();
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        write!(f, "{} ({}x{})", name, w, h)
    }
}

/// 固定间隔节拍器
///
/// 落后超过一个间隔时不补发，直接从当前时刻重新计时
#[derive(Debug, Clone)]
pub struct FramePacer {
    interval: Duration,
    next_due: Option<Instant>,
}

impl FramePacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 到点了吗？到点则排下一次
    pub fn due(&mut self, now: Instant) -> bool {
        match self.next_due {
            Some(next) if now < next => false,
            Some(next) => {
                let following = next + self.interval;
                self.next_due = Some(if following <= now {
                    now + self.interval
                } else {
                    following
                });
                true
            }
            None => {
                self.next_due = Some(now + self.interval);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.next_due = None;
    }
}

/// 帧来源（摄像头 / 屏幕共享 / 测试图案）
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    fn grab(&mut self) -> Result<RgbImage, CaptureError>;
}

/// 合成测试图案：滚动的彩条
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame: u32,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            frame: 0,
        }
    }
}

impl FrameSource for TestPatternSource {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn grab(&mut self) -> Result<RgbImage, CaptureError> {
        const BARS: [[u8; 3]; 7] = [
            [192, 192, 192],
            [192, 192, 0],
            [0, 192, 192],
            [0, 192, 0],
            [192, 0, 192],
            [192, 0, 0],
            [0, 0, 192],
        ];

        let offset = self.frame.wrapping_mul(8);
        let bar_width = (self.width / BARS.len() as u32).max(1);
        let image = RgbImage::from_fn(self.width, self.height, |x, _| {
            let bar = ((x.wrapping_add(offset) / bar_width) as usize) % BARS.len();
            Rgb(BARS[bar])
        });

        self.frame = self.frame.wrapping_add(1);
        Ok(image)
    }
}

/// JPEG 编码后的一帧
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl From<EncodedFrame> for RealtimeInput {
    fn from(frame: EncodedFrame) -> Self {
        RealtimeInput::Image {
            jpeg: frame.jpeg,
            width: frame.width,
            height: frame.height,
        }
    }
}

/// 缩放到档位尺寸并编码
pub fn encode_frame(image: &RgbImage, quality: VideoQuality) -> Result<EncodedFrame, CaptureError> {
    let (width, height) = quality.dimensions();

    let resized;
    let image = if image.dimensions() == (width, height) {
        image
    } else {
        resized = imageops::resize(image, width, height, FilterType::Triangle);
        &resized
    };

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode_image(image)?;

    Ok(EncodedFrame {
        jpeg,
        width,
        height,
    })
}

/// 视频采集循环的一步
pub struct VideoCapture {
    source: Box<dyn FrameSource>,
    quality: VideoQuality,
    pacer: FramePacer,
    frames_sent: u64,
    frames_dropped: u64,
}

impl VideoCapture {
    pub fn new(source: Box<dyn FrameSource>, quality: VideoQuality, interval: Duration) -> Self {
        log::info!(
            "Video capture from {} at {}, every {} ms",
            source.name(),
            quality,
            interval.as_millis()
        );
        Self {
            source,
            quality,
            pacer: FramePacer::new(interval),
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    /// 到点就抓一帧发送；返回这一步是否发出了帧
    pub fn tick(&mut self, now: Instant, session: &dyn LiveSession) -> bool {
        if !self.pacer.due(now) {
            return false;
        }

        match self.capture_and_send(session) {
            Ok(()) => {
                self.frames_sent += 1;
                true
            }
            Err(e) => {
                log::warn!("Dropping video frame: {}", e);
                self.frames_dropped += 1;
                false
            }
        }
    }

    fn capture_and_send(&mut self, session: &dyn LiveSession) -> Result<(), CaptureError> {
        let image = self.source.grab()?;
        let frame = encode_frame(&image, self.quality)?;
        session.send_realtime_input(frame.into())?;
        Ok(())
    }

    pub fn quality(&self) -> VideoQuality {
        self.quality
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}

/// 麦克风上行
pub struct MicCapture {
    resampler: Box<dyn Resampler>,
    format: PcmFormat,
    chunk_frames: usize,
    pending: Vec<f32>,
    pcm: Vec<u8>,
    chunks_sent: u64,
    chunks_muted: u64,
    chunks_failed: u64,
}

impl MicCapture {
    pub fn new(device_rate: u32, wire_rate: u32, chunk: Duration) -> Self {
        let chunk_frames = ((wire_rate as f64 * chunk.as_secs_f64()).round() as usize).max(1);
        log::debug!(
            "Mic capture {} Hz -> {} Hz, {} frames per chunk",
            device_rate,
            wire_rate,
            chunk_frames
        );
        Self {
            resampler: make_resampler(device_rate, wire_rate),
            format: PcmFormat::mono(wire_rate),
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * 2),
            pcm: Vec::with_capacity(chunk_frames * 2),
            chunks_sent: 0,
            chunks_muted: 0,
            chunks_failed: 0,
        }
    }

    /// 喂入设备采样率的单声道样本
    ///
    /// 每凑满一块：闸门打开就发送，否则丢弃。返回本次发出的块数
    pub fn push(&mut self, samples: &[f32], gate_open: bool, session: &dyn LiveSession) -> usize {
        self.resampler.process(samples, &mut self.pending);

        let mut sent = 0;
        let mut consumed = 0;
        while self.pending.len() - consumed >= self.chunk_frames {
            let chunk = &self.pending[consumed..consumed + self.chunk_frames];
            consumed += self.chunk_frames;

            if !gate_open {
                self.chunks_muted += 1;
                continue;
            }

            self.pcm.clear();
            f32_to_pcm16(chunk, &mut self.pcm);
            let input = RealtimeInput::Audio {
                pcm: self.pcm.clone(),
                format: self.format,
            };
            match session.send_realtime_input(input) {
                Ok(()) => {
                    self.chunks_sent += 1;
                    sent += 1;
                }
                Err(e) => {
                    log::warn!("Dropping mic chunk: {}", e);
                    self.chunks_failed += 1;
                }
            }
        }
        self.pending.drain(..consumed);
        sent
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    pub fn chunks_muted(&self) -> u64 {
        self.chunks_muted
    }

    pub fn chunks_failed(&self) -> u64 {
        self.chunks_failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEvent;
    use crossbeam_channel::{unbounded, Receiver};
    use std::cell::{Cell, RefCell};

    struct FakeSession {
        sent: RefCell<Vec<RealtimeInput>>,
        fail: Cell<bool>,
        events: Receiver<SessionEvent>,
    }

    impl FakeSession {
        fn new() -> Self {
            let (_tx, rx) = unbounded();
            Self {
                sent: RefCell::new(Vec::new()),
                fail: Cell::new(false),
                events: rx,
            }
        }
    }

    impl LiveSession for FakeSession {
        fn send_realtime_input(&self, input: RealtimeInput) -> Result<(), SessionError> {
            if self.fail.get() {
                return Err(SessionError::Closed);
            }
            self.sent.borrow_mut().push(input);
            Ok(())
        }

        fn events(&self) -> &Receiver<SessionEvent> {
            &self.events
        }

        fn request_response(&self) -> Result<(), SessionError> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct BrokenCamera;

    impl FrameSource for BrokenCamera {
        fn name(&self) -> &str {
            "broken"
        }

        fn grab(&mut self) -> Result<RgbImage, CaptureError> {
            Err(CaptureError::PermissionDenied("camera".into()))
        }
    }

    #[test]
    fn test_quality_presets() {
        assert_eq!(VideoQuality::Low.dimensions(), (640, 480));
        assert_eq!(VideoQuality::Medium.dimensions(), (1280, 720));
        assert_eq!(VideoQuality::High.dimensions(), (1920, 1080));
        assert_eq!(VideoQuality::default(), VideoQuality::Medium);
    }

    #[test]
    fn test_pacer_fires_every_interval() {
        let mut pacer = FramePacer::new(Duration::from_millis(500));
        let t0 = Instant::now();
        assert!(pacer.due(t0));
        assert!(!pacer.due(t0 + Duration::from_millis(100)));
        assert!(!pacer.due(t0 + Duration::from_millis(499)));
        assert!(pacer.due(t0 + Duration::from_millis(500)));
        assert!(!pacer.due(t0 + Duration::from_millis(900)));
        assert!(pacer.due(t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_pacer_does_not_burst_after_stall() {
        let mut pacer = FramePacer::new(Duration::from_millis(500));
        let t0 = Instant::now();
        assert!(pacer.due(t0));
        // 卡了 3 秒
        let late = t0 + Duration::from_secs(3);
        assert!(pacer.due(late));
        assert!(!pacer.due(late + Duration::from_millis(10)));
        assert!(pacer.due(late + Duration::from_millis(500)));
    }

    #[test]
    fn test_encode_frame_resizes_to_preset() {
        let mut source = TestPatternSource::new(320, 240);
        let image = source.grab().unwrap();
        let frame = encode_frame(&image, VideoQuality::Low).unwrap();

        assert_eq!((frame.width, frame.height), (640, 480));
        // JPEG SOI 标记
        assert_eq!(&frame.jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_video_capture_sends_on_schedule() {
        let session = FakeSession::new();
        let mut capture = VideoCapture::new(
            Box::new(TestPatternSource::new(64, 48)),
            VideoQuality::Low,
            FRAME_INTERVAL,
        );

        let t0 = Instant::now();
        assert!(capture.tick(t0, &session));
        assert!(!capture.tick(t0 + Duration::from_millis(200), &session));
        assert!(capture.tick(t0 + Duration::from_millis(500), &session));

        let sent = session.sent.borrow();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].mime_type(), "image/jpeg");
    }

    #[test]
    fn test_video_send_failure_drops_frame() {
        let session = FakeSession::new();
        session.fail.set(true);
        let mut capture = VideoCapture::new(
            Box::new(TestPatternSource::new(64, 48)),
            VideoQuality::Low,
            FRAME_INTERVAL,
        );

        let t0 = Instant::now();
        assert!(!capture.tick(t0, &session));
        assert_eq!(capture.frames_dropped(), 1);

        // 下一拍照常进行
        session.fail.set(false);
        assert!(capture.tick(t0 + FRAME_INTERVAL, &session));
        assert_eq!(capture.frames_sent(), 1);
    }

    #[test]
    fn test_grab_failure_is_not_fatal() {
        let session = FakeSession::new();
        let mut capture = VideoCapture::new(Box::new(BrokenCamera), VideoQuality::Low, FRAME_INTERVAL);
        assert!(!capture.tick(Instant::now(), &session));
        assert_eq!(capture.frames_dropped(), 1);
        assert!(session.sent.borrow().is_empty());
    }

    #[test]
    fn test_mic_chunks_at_wire_rate() {
        let session = FakeSession::new();
        let mut mic = MicCapture::new(16_000, 16_000, Duration::from_millis(100));

        // 250 ms → 两块，余 50 ms
        let sent = mic.push(&vec![0.25; 4000], true, &session);
        assert_eq!(sent, 2);

        let sent_inputs = session.sent.borrow();
        match &sent_inputs[0] {
            RealtimeInput::Audio { pcm, format } => {
                assert_eq!(pcm.len(), 1600 * 2);
                assert_eq!(format.sample_rate, 16_000);
            }
            other => panic!("unexpected input {:?}", other),
        }
        drop(sent_inputs);

        // 再来 50 ms 凑满第三块
        assert_eq!(mic.push(&vec![0.25; 800], true, &session), 1);
        assert_eq!(mic.chunks_sent(), 3);
    }

    #[test]
    fn test_mic_resamples_device_rate() {
        let session = FakeSession::new();
        let mut mic = MicCapture::new(48_000, 16_000, Duration::from_millis(100));
        // 1 秒 48 kHz → 大约 10 块 16 kHz
        mic.push(&vec![0.1; 48_000], true, &session);
        let sent = mic.chunks_sent();
        assert!((9..=10).contains(&sent), "sent {}", sent);
    }

    #[test]
    fn test_mic_drops_chunks_while_muted() {
        let session = FakeSession::new();
        let mut mic = MicCapture::new(16_000, 16_000, Duration::from_millis(100));

        assert_eq!(mic.push(&vec![0.5; 3200], false, &session), 0);
        assert_eq!(mic.chunks_muted(), 2);
        assert!(session.sent.borrow().is_empty());

        // 静音期间的数据不会在解除后补发
        assert_eq!(mic.push(&vec![0.5; 1600], true, &session), 1);
        assert_eq!(mic.chunks_sent(), 1);
    }

    #[test]
    fn test_mic_send_failure_is_counted() {
        let session = FakeSession::new();
        session.fail.set(true);
        let mut mic = MicCapture::new(16_000, 16_000, Duration::from_millis(100));
        assert_eq!(mic.push(&vec![0.5; 1600], true, &session), 0);
        assert_eq!(mic.chunks_failed(), 1);
    }
}
