//! Newline-delimited JSON framing
//!
//! A client writes one command object on one line, for example
//! `{"id":"42","command":"MULTRUN","exposure_ms":1000,"count":2}`, and reads
//! back `{"type":"ack",...}` lines followed by exactly one
//! `{"type":"done",...}` line.

use spectrograph_engine::{Command, Done, Message, UNKNOWN_COMMAND_ERROR_CODE};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Correlation id of a reply to input that carried no usable id
pub const UNKNOWN_ID: &str = "unknown";

/// Parse one inbound line. A line that is not a command yields the
/// DONE-FAILURE to send back instead.
pub fn decode_command(line: &str) -> Result<Command, Done> {
    serde_json::from_str::<Command>(line).map_err(|e| {
        let id = serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|value| value.get("id").and_then(|id| id.as_str()).map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_ID.to_string());
        Done::failure(id, UNKNOWN_COMMAND_ERROR_CODE, format!("Malformed command: {}", e))
    })
}

pub fn encode_message(message: &Message) -> io::Result<String> {
    let mut line = serde_json::to_string(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    Ok(line)
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(encode_message(message)?.as_bytes()).await?;
    writer.flush().await
}
