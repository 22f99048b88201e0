//! 波形采样 / 绘制
//!
//! 每个渲染帧由宿主循环调用一次 `sample_tick`：刷新输入、输出两个分析器的快照，
//! 按频点合成柱状图画到绘制表面上。分析器或表面还没准备好时静默跳过这一帧
//! （启动阶段的正常竞态，不是错误）。
//!
//! 绘制规则：
//! - 第 i 个频点的合成幅度 = (in[i] + out[i]) / 2
//! - 柱高与合成幅度成线性关系，最高为表面高度的 90%
//! - 色相 = i / N × 360°，饱和度 / 亮度固定
//! - 高度为 0 的柱子不画

use crate::audio::Analyser;

/// 柱高上限（占表面高度的比例）
pub const MAX_FILL: f32 = 0.9;

const DEFAULT_SATURATION: f32 = 0.7;
const DEFAULT_LIGHTNESS: f32 = 0.6;

/// 一根柱子（表面坐标，原点左下，单位由表面决定）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub index: usize,
    pub x: f32,
    pub width: f32,
    pub height: f32,
    /// 0..360
    pub hue: f32,
    pub saturation: f32,
    pub lightness: f32,
}

impl Bar {
    pub fn rgb(&self) -> (u8, u8, u8) {
        hsl_to_rgb(self.hue, self.saturation, self.lightness)
    }
}

/// 绘制表面
pub trait Surface {
    /// 可绘制区域 (宽, 高)；还没准备好时返回 None
    fn extent(&self) -> Option<(f32, f32)>;

    fn clear(&mut self);

    fn fill_bar(&mut self, bar: &Bar);
}

/// 按绘制规则计算柱子
///
/// 两个快照长度不一致时按较短的计算。结果总是 N 根（包括高度为 0 的）
pub fn compute_bars(
    input: &[u8],
    output: &[u8],
    width: f32,
    height: f32,
    saturation: f32,
    lightness: f32,
    bars: &mut Vec<Bar>,
) {
    bars.clear();

    let n = input.len().min(output.len());
    if n == 0 {
        return;
    }

    let bar_width = width / n as f32;
    let max_height = height * MAX_FILL;

    bars.extend(input.iter().zip(output).take(n).enumerate().map(|(i, (&a, &b))| {
        let combined = (a as f32 + b as f32) / 2.0;
        Bar {
            index: i,
            x: i as f32 * bar_width,
            width: bar_width,
            height: (combined / 255.0 * max_height).min(max_height),
            hue: i as f32 / n as f32 * 360.0,
            saturation,
            lightness,
        }
    }));
}

/// 波形采样器
pub struct WaveformSampler {
    saturation: f32,
    lightness: f32,
    bars: Vec<Bar>,
    frames_drawn: u64,
    frames_skipped: u64,
}

impl WaveformSampler {
    pub fn new() -> Self {
        Self {
            saturation: DEFAULT_SATURATION,
            lightness: DEFAULT_LIGHTNESS,
            bars: Vec::new(),
            frames_drawn: 0,
            frames_skipped: 0,
        }
    }

    /// 一帧：刷新两个分析器并绘制
    pub fn sample_tick(
        &mut self,
        input: Option<&mut Analyser>,
        output: Option<&mut Analyser>,
        surface: Option<&mut dyn Surface>,
    ) {
        let (Some(input), Some(output), Some(surface)) = (input, output, surface) else {
            self.frames_skipped += 1;
            return;
        };
        let Some((width, height)) = surface.extent() else {
            self.frames_skipped += 1;
            return;
        };

        input.refresh();
        output.refresh();

        self.draw(
            input.byte_frequency_data(),
            output.byte_frequency_data(),
            width,
            height,
            surface,
        );
    }

    /// 用现成的快照绘制（分析器之外的数据源也可以用）
    pub fn draw(
        &mut self,
        input: &[u8],
        output: &[u8],
        width: f32,
        height: f32,
        surface: &mut dyn Surface,
    ) {
        compute_bars(
            input,
            output,
            width,
            height,
            self.saturation,
            self.lightness,
            &mut self.bars,
        );

        surface.clear();
        for bar in self.bars.iter().filter(|b| b.height > 0.0) {
            surface.fill_bar(bar);
        }
        self.frames_drawn += 1;
    }

    /// 最近一帧计算出的柱子
    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped
    }
}

impl Default for WaveformSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// HSL → RGB（h: 度，s/l: 0..1）
pub fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (u8, u8, u8) {
    let h = h.rem_euclid(360.0) / 60.0;
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let m = l - c / 2.0;

    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    let to_u8 = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    (to_u8(r), to_u8(g), to_u8(b))
}
