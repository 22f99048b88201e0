//! Alex Live - 终端里的实时语音助手
//!
//! 麦克风上行，模型语音下行，波形实时显示。

use std::ffi::OsStr;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use alex_live::audio::{AudioInput, AudioOutput};
use alex_live::capture::VideoQuality;
use alex_live::config::SessionConfig;
use alex_live::engine::Engine;
use alex_live::session::{
    LiveSession, ReplayConfig, ReplaySession, ResponseClip, SessionError, SessionStatus,
};
use alex_live::tui::{self, App};

/// Alex Live - real-time voice assistant in the terminal
#[derive(Parser)]
#[command(name = "alex-live")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Select output device by name (use 'devices' command to list)
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Select input (microphone) device by name
    #[arg(long, global = true)]
    input_device: Option<String>,

    /// Microphone hold time after the assistant starts talking (0 disables)
    #[arg(long, default_value = "2000", global = true)]
    mute_ms: u64,

    /// FFT size of the waveform analysers
    #[arg(long, default_value = "256", global = true)]
    fft_size: usize,

    /// Video frame quality preset
    #[arg(long, value_enum, default_value_t = VideoQuality::Medium, global = true)]
    quality: VideoQuality,

    /// Send video frames (synthetic test pattern) alongside audio
    #[arg(long, global = true)]
    video: bool,

    /// Do not open the microphone
    #[arg(long, global = true)]
    no_mic: bool,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show audio device information
    Devices,

    /// Interactive voice session
    Chat {
        /// Response clips (files or directories) the local session answers with
        #[arg(long = "responses", value_name = "PATH")]
        responses: Vec<PathBuf>,
    },

    /// Stream a file through the session pipeline and exit
    Play {
        /// Audio file to play
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Some(Commands::Devices) => show_device_info()?,
        Some(Commands::Play { ref file }) => simple_play(file, &cli)?,
        Some(Commands::Chat { ref responses }) => chat(responses, &cli)?,
        None => chat(&[], &cli)?,
    }

    Ok(())
}

/// 显示设备信息
fn show_device_info() -> anyhow::Result<()> {
    println!("=== Audio Output Devices ===\n");
    for device in AudioOutput::get_all_output_devices()? {
        let default_mark = if device.is_default { " *" } else { "" };
        println!(
            "  {} ({} Hz, {}ch){}",
            device.name, device.sample_rate, device.channels, default_mark
        );
    }

    println!("\n=== Audio Input Devices ===\n");
    match AudioInput::get_all_input_devices() {
        Ok(devices) => {
            for device in devices {
                let default_mark = if device.is_default { " *" } else { "" };
                println!(
                    "  {} ({} Hz, {}ch){}",
                    device.name, device.sample_rate, device.channels, default_mark
                );
            }
        }
        Err(e) => println!("  unavailable: {}", e),
    }

    println!();
    println!("* = system default");
    println!("Select device: alex-live -d <NAME> chat");
    Ok(())
}

/// 支持的音频文件扩展名
const AUDIO_EXTENSIONS: &[&str] = &["flac", "wav", "aiff", "aif", "mp3"];

/// 检查文件是否为支持的音频格式
fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// 展开应答片段路径（目录按文件名排序）
fn collect_clip_paths(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|p| p.is_file() && is_audio_file(p))
                .collect();
            found.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn load_clips(paths: &[PathBuf], wire_rate: u32) -> anyhow::Result<Vec<ResponseClip>> {
    let mut clips = Vec::new();
    for path in collect_clip_paths(paths)? {
        match ResponseClip::from_file(&path, wire_rate) {
            Ok(clip) => clips.push(clip),
            Err(e) => eprintln!("Skipping {}: {}", path.display(), e),
        }
    }
    Ok(clips)
}

/// 创建会话配置
fn create_session_config(cli: &Cli) -> SessionConfig {
    if let Some(ref name) = cli.device {
        match AudioOutput::find_device_by_name(name) {
            Some(device) => println!("Found device: {}", device.name),
            None => eprintln!("Warning: Device '{}' not found", name),
        }
    }

    SessionConfig {
        mute_window: Duration::from_millis(cli.mute_ms),
        fft_size: cli.fft_size,
        video_quality: cli.quality,
        video_enabled: cli.video,
        mic_enabled: !cli.no_mic,
        output_device: cli.device.clone(),
        input_device: cli.input_device.clone(),
        ..SessionConfig::default()
    }
}

/// 交互式会话
fn chat(responses: &[PathBuf], cli: &Cli) -> anyhow::Result<()> {
    let config = create_session_config(cli);
    let replay = ReplayConfig {
        wire_rate: config.output_rate,
        ..ReplayConfig::default()
    };
    let clips = load_clips(responses, replay.wire_rate)?;

    let connect: tui::SessionFactory = Box::new(move || -> Result<Box<dyn LiveSession>, SessionError> {
        let session = ReplaySession::connect(clips.clone(), replay.clone())?;
        Ok(Box::new(session) as Box<dyn LiveSession>)
    });

    let app = App::new(Engine::new(config), connect);
    tui::run(app)?;
    Ok(())
}

/// 无界面播放：文件作为一次模型应答，走完整的会话 → 调度 → 设备路径
fn simple_play(file: &Path, cli: &Cli) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut config = create_session_config(cli);
    // 播放模式不听麦克风，避免外放被当成插话
    config.mic_enabled = false;

    let replay = ReplayConfig {
        wire_rate: config.output_rate,
        auto_respond: false,
        ..ReplayConfig::default()
    };
    let clip = ResponseClip::from_file(file, replay.wire_rate)?;
    println!(
        "Alex Live - Loading: {} ({:.1}s)",
        file.display(),
        clip.duration(replay.wire_rate)
    );

    let session = ReplaySession::connect(vec![clip], replay)?;
    let mut engine = Engine::new(config);
    engine.start(Box::new(session))?;
    engine.request_response()?;

    if let Some(output) = engine.output() {
        println!(
            "Output: {} | {} Hz {}ch",
            output.device_name(),
            output.sample_rate(),
            output.channels()
        );
    }
    println!("Playing. Press Ctrl+C to stop.\n");

    loop {
        if !running.load(Ordering::SeqCst) {
            println!("\nPlayback interrupted.");
            break;
        }

        engine.pump(Instant::now());

        let finished = engine
            .session_state()
            .map_or(true, |s| s.turns() > 0 && engine.is_idle());
        let closed = matches!(engine.status(), SessionStatus::Closed(_));
        if finished || closed {
            break;
        }

        let stats = engine.stats();
        print!(
            "\r  {:7.2}s  |  Queued: {:5.2}s  |  Chunks: {:4}  |  Underruns: {}  ",
            stats.clock_secs, stats.queued_secs, stats.chunks_scheduled, stats.underrun_count
        );
        io::stdout().flush()?;

        std::thread::sleep(Duration::from_millis(20));
    }

    println!();
    let status = engine.status();
    let playback = Arc::clone(engine.playback_stats());
    let sample_rate = engine.output().map_or(0, |o| o.sample_rate());
    engine.stop();

    let callbacks = playback.callback_count().max(1);
    let frames_per_callback = (playback.frames_rendered() / callbacks) as u32;
    println!("Session: {}\n", status);
    print!("{}", playback.report(frames_per_callback, sample_rate));

    Ok(())
}
