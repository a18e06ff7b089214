//! Line-delimited JSON codec for the worker channel.
//!
//! Each envelope is one JSON document followed by a newline. The child's
//! stdout is reserved for frames; diagnostics must go to stderr.

use thiserror::Error;

use crate::envelope::Envelope;

/// Codec failure: an envelope could not be encoded, or a line on the channel
/// was not a well-formed envelope.
#[derive(Debug, Error)]
#[error("malformed protocol frame: {0}")]
pub struct WireError(#[from] serde_json::Error);

/// Encode an envelope as one newline-terminated JSON line.
pub fn encode_line(envelope: &Envelope) -> Result<String, WireError> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line from the channel into an envelope.
pub fn decode_line(line: &str) -> Result<Envelope, WireError> {
    Ok(serde_json::from_str(line.trim_end())?)
}
