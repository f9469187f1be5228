//! Length-prefixed MessagePack frames over byte streams.
//!
//! A frame is a big-endian `u32` payload length followed by the payload. The
//! process pool speaks this over a child's stdin/stdout.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stellwerk_core::{CallError, Value};
use thiserror::Error;

/// Upper bound on a single frame, guarding against a corrupted length prefix.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

/// One task for a child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcRequest {
    pub callable: String,
    pub args: Vec<Value>,
}

/// A child's answer to a [`ProcRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcResponse {
    Ok(Value),
    Err(CallError),
}

pub fn write_frame<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<(), FrameError> {
    let payload = rmp_serde::to_vec_named(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the stream ended cleanly between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<Option<T>, FrameError> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Some(rmp_serde::from_slice(&payload)?))
}
