//! Length-prefixed JSON framing
//!
//! Control messages are small JSON values, each prefixed with a 16-bit
//! big-endian length on the wire.

use std::io::{self, Read, Write};

use derive_more::{Display, Error, From};
use serde_json::Value;

#[derive(Debug, Display, From, Error)]
pub enum WireError {
    Io(io::Error),
    Json(serde_json::Error),
}

type Result<T> = std::result::Result<T, WireError>;

pub fn read_frame<R: Read>(stream: &mut R) -> Result<Value> {
    let mut len_buffer = [0; 2];
    stream.read_exact(&mut len_buffer)?;
    let len = u16::from_be_bytes(len_buffer) as usize;

    let mut payload = vec![0; len];
    stream.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

pub fn write_frame<W: Write>(stream: &mut W, value: &Value) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() > u16::MAX as usize {
        return Err(WireError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes is too large", payload.len()),
        )));
    }
    stream.write_all(&(payload.len() as u16).to_be_bytes())?;
    stream.write_all(&payload)?;
    stream.flush()?;
    Ok(())
}
