//! Framing: one JSON document per line, UTF-8, newline-terminated.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Upper bound on a single line. Anything larger is treated as hostile.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Encode a message as a single line: JSON followed by `\n`.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<Vec<u8>, WireError> {
    let mut out = serde_json::to_vec(msg)?;
    if out.len() > MAX_LINE_LEN {
        return Err(WireError::TooLarge);
    }
    out.push(b'\n');
    Ok(out)
}

/// Decode one line (trailing newline optional) into a message.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, WireError> {
    if line.len() > MAX_LINE_LEN {
        return Err(WireError::TooLarge);
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Err(WireError::Empty);
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Error encoding or decoding a wire line.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line too large")]
    TooLarge,
    #[error("empty line")]
    Empty,
}
