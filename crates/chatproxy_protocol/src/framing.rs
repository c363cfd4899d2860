#![forbid(unsafe_code)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum text frame size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024; // 256 KiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Encode a message into a JSON text frame.
pub fn encode_frame<M: Serialize>(msg: &M, max_frame_size: usize) -> Result<String, FramingError> {
	let out = serde_json::to_string(msg)?;
	if out.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: out.len(),
			max: max_frame_size,
		});
	}
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<M: Serialize>(msg: &M) -> Result<String, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode a single JSON text frame. The size check runs before parsing.
pub fn decode_frame<M: DeserializeOwned>(src: &str, max_frame_size: usize) -> Result<M, FramingError> {
	if src.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: src.len(),
			max: max_frame_size,
		});
	}

	Ok(serde_json::from_str(src)?)
}
