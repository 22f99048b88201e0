//! Alex Live Library
//!
//! 实时语音会话的音频核心：无缝排程模型语音、打断、波形可视化。

pub mod audio;
pub mod capture;
pub mod config;
pub mod decode;
pub mod engine;
pub mod sampler;
pub mod scheduler;
pub mod session;
pub mod tui;
