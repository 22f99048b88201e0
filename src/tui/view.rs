use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
    Frame,
};

use super::model::App;
use crate::sampler::{Bar, Surface};
use crate::session::{SessionStatus, Speaker};

/// 竖向八分之一格字符，索引 = 高度（1..=8）
const EIGHTHS: [&str; 9] = [" ", "▁", "▂", "▃", "▄", "▅", "▆", "▇", "█"];

/// 终端缓冲区上的绘制表面
///
/// 宽度单位是字符列，高度单位是八分之一行。频点多于列数时
/// 同一列会收到多根柱子，每列只保留最高的一根
pub struct BufferSurface<'a> {
    buf: &'a mut Buffer,
    area: Rect,
    /// 每列已画的高度（八分之一行）
    columns: Vec<u16>,
}

impl<'a> BufferSurface<'a> {
    pub fn new(buf: &'a mut Buffer, area: Rect) -> Self {
        Self {
            buf,
            area,
            columns: vec![0; area.width as usize],
        }
    }
}

impl Surface for BufferSurface<'_> {
    fn extent(&self) -> Option<(f32, f32)> {
        if self.area.width == 0 || self.area.height == 0 {
            return None;
        }
        Some((self.area.width as f32, self.area.height as f32 * 8.0))
    }

    fn clear(&mut self) {
        for y in self.area.top()..self.area.bottom() {
            for x in self.area.left()..self.area.right() {
                self.buf.get_mut(x, y).reset();
            }
        }
        self.columns.fill(0);
    }

    fn fill_bar(&mut self, bar: &Bar) {
        let (r, g, b) = bar.rgb();
        let color = Color::Rgb(r, g, b);

        let first = bar.x.floor() as u16;
        let last = ((bar.x + bar.width).floor() as u16).max(first + 1);
        let eighths = bar.height.round() as u16;

        for col in first..last.min(self.area.width) {
            let drawn = &mut self.columns[col as usize];
            if eighths <= *drawn {
                continue;
            }
            *drawn = eighths;

            let x = self.area.left() + col;
            let mut remaining = eighths;
            for row in (self.area.top()..self.area.bottom()).rev() {
                if remaining == 0 {
                    break;
                }
                let step = remaining.min(8);
                self.buf
                    .get_mut(x, row)
                    .set_symbol(EIGHTHS[step as usize])
                    .set_fg(color);
                remaining -= step;
            }
        }
    }
}

pub fn draw(f: &mut Frame, app: &mut App) {
    // 垂直布局：Header, Waveform, Transcript, Footer
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),      // Header
            Constraint::Percentage(40), // Waveform
            Constraint::Min(5),         // Transcript
            Constraint::Length(3),      // Footer
        ])
        .split(f.size());

    draw_header(f, app, chunks[0]);
    draw_waveform(f, app, chunks[1]);
    draw_transcript(f, app, chunks[2]);
    draw_footer(f, chunks[3]);

    if app.show_help {
        draw_help(f);
    }
}

fn draw_header(f: &mut Frame, app: &App, area: Rect) {
    let status = app.engine.status();
    let (state_str, state_color) = match status {
        SessionStatus::Connecting => ("[CONNECTING]".to_string(), Color::Yellow),
        SessionStatus::Listening => ("[LISTENING]".to_string(), Color::Green),
        SessionStatus::Responding => ("[RESPONDING]".to_string(), Color::Cyan),
        SessionStatus::Closed(_) => ("[STOPPED]".to_string(), Color::DarkGray),
    };

    let mut tags = Vec::new();
    if let Some(state) = app.engine.session_state() {
        if let Some(err) = state.last_error() {
            tags.push(format!("[ERROR: {}]", err));
        }
        if state.gate().is_manually_muted() {
            tags.push("[MIC OFF]".to_string());
        } else if let Some(left) = state.gate().remaining(std::time::Instant::now()) {
            tags.push(format!("[MIC HOLD {:.1}s]", left.as_secs_f64()));
        }
    }
    if app.engine.input().is_none() && app.engine.is_running() {
        tags.push("[NO MIC]".to_string());
    }
    let tags_str = tags.join(" ");

    let title = "Alex Live";
    let help_hint = "(h: Help)";
    let right_len = tags_str.len() + state_str.len() + 1;
    let left_len = title.len() + 2 + help_hint.len();
    let spaces = " ".repeat(area.width.saturating_sub((left_len + right_len + 2) as u16) as usize);

    let header_line = Line::from(vec![
        Span::raw(title),
        Span::raw("  "),
        Span::styled(help_hint, Style::default().fg(Color::DarkGray)),
        Span::raw(spaces),
        Span::styled(tags_str, Style::default().fg(Color::Yellow)),
        Span::raw(" "),
        Span::styled(state_str, Style::default().fg(state_color)),
    ]);

    let block = Block::default().borders(Borders::ALL);
    f.render_widget(Paragraph::new(header_line).block(block), area);
}

fn draw_waveform(f: &mut Frame, app: &mut App, area: Rect) {
    let stats = &app.cached_stats;
    let title = format!(
        " Audio  queued {:.2}s | chunks {} | underruns {} | interrupts {} ",
        stats.queued_secs, stats.chunks_scheduled, stats.underrun_count, stats.interrupt_count
    );
    let block = Block::default().borders(Borders::ALL).title(title);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let mut surface = BufferSurface::new(f.buffer_mut(), inner);
    app.engine.sample_tick(Some(&mut surface));
}

fn draw_transcript(f: &mut Frame, app: &App, area: Rect) {
    let lines = app.transcript_lines();
    let visible = area.height.saturating_sub(2) as usize;
    let skip = lines.len().saturating_sub(visible);

    let text: Vec<Line> = lines
        .iter()
        .skip(skip)
        .map(|line| {
            let (who, color) = match line.speaker {
                Some(Speaker::User) => ("You", Color::Green),
                Some(Speaker::Model) => ("Alex", Color::Cyan),
                None => ("--", Color::DarkGray),
            };
            Line::from(vec![
                Span::styled(format!("[{}] ", line.time), Style::default().fg(Color::DarkGray)),
                Span::styled(format!("{:>4} ", who), Style::default().fg(color).add_modifier(Modifier::BOLD)),
                Span::raw(line.text.clone()),
            ])
        })
        .collect();

    let block = Block::default().borders(Borders::ALL).title("Transcript");
    let paragraph = Paragraph::new(text).block(block).wrap(Wrap { trim: false });
    f.render_widget(paragraph, area);
}

fn draw_footer(f: &mut Frame, area: Rect) {
    let info = "s: Start/Stop | m: Mute | i: Interrupt | r: Respond | h: Help | q: Quit";
    let block = Block::default().borders(Borders::ALL);
    let paragraph = Paragraph::new(info)
        .block(block)
        .style(Style::default().fg(Color::DarkGray));
    f.render_widget(paragraph, area);
}

fn draw_help(f: &mut Frame) {
    let area = f.size();
    let width = 52u16.min(area.width.saturating_sub(4));
    let height = 12u16.min(area.height.saturating_sub(4));
    let x = area.width.saturating_sub(width) / 2;
    let y = area.height.saturating_sub(height) / 2;
    let help_area = Rect::new(x, y, width, height);

    f.render_widget(Clear, help_area);

    let key = |k: &'static str| Span::styled(k, Style::default().fg(Color::Cyan));
    let lines = vec![
        Line::from(""),
        Line::from(vec![key("  s  "), Span::raw("start / stop the session")]),
        Line::from(vec![key("  m  "), Span::raw("mute / unmute the microphone")]),
        Line::from(vec![key("  i  "), Span::raw("stop the current answer")]),
        Line::from(vec![key("  r  "), Span::raw("ask for an answer now")]),
        Line::from(vec![key("  q  "), Span::raw("quit")]),
        Line::from(""),
        Line::from(Span::styled(
            "  The mic is held closed briefly when Alex starts talking",
            Style::default().fg(Color::DarkGray),
        )),
    ];

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .style(Style::default().bg(Color::Black))
        .title(" Help ");
    f.render_widget(Paragraph::new(lines).block(block), help_area);
}
