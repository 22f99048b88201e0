//! 解码模块

mod decoder;

pub use decoder::{decode, decode_inline, AudioDecoder, AudioInfo, DecodeError};
