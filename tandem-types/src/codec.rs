//! Control channel framing.
//!
//! Preferred framing is an ASCII decimal length, a newline, then exactly
//! that many bytes of UTF-8 JSON:
//!
//! ```text
//! 42\n{"v":1,"type":"cmd","id":1,"command":"x"}
//! ```
//!
//! Legacy peers send one JSON document per line with no length prefix. The
//! decoder tells the two apart by whether the first line is all digits.
//! Legacy lines may also omit `v` and `type`; both are inferred.

use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CodecError;
use crate::messages::{ControlMessage, PROTOCOL_VERSION};

/// Default upper bound on a single message body (4 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Longest length prefix accepted before it is treated as garbage.
const MAX_PREFIX_DIGITS: usize = 20;

/// How a message is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// `"{len}\n{json}"`.
    #[default]
    LengthPrefixed,
    /// `"{json}\n"`.
    Legacy,
}

/// Encode a message with the given framing.
pub fn encode(msg: &ControlMessage, framing: Framing) -> Result<Vec<u8>, CodecError> {
    let body = to_json(msg)?;
    let mut out = Vec::with_capacity(body.len() + MAX_PREFIX_DIGITS + 1);
    match framing {
        Framing::LengthPrefixed => {
            out.extend_from_slice(body.len().to_string().as_bytes());
            out.push(b'\n');
            out.extend_from_slice(&body);
        }
        Framing::Legacy => {
            out.extend_from_slice(&body);
            out.push(b'\n');
        }
    }
    Ok(out)
}

fn to_json(msg: &ControlMessage) -> Result<Vec<u8>, CodecError> {
    let value = serde_json::to_value(msg).map_err(|e| CodecError::malformed(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(CodecError::malformed("message did not serialize to an object"));
    };
    obj.insert("v".into(), Value::from(PROTOCOL_VERSION));
    serde_json::to_vec(&obj).map_err(|e| CodecError::malformed(e.to_string()))
}

/// Parse one JSON document into a message.
fn parse_body(bytes: &[u8], framing: Framing) -> Result<ControlMessage, CodecError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| CodecError::malformed(format!("invalid UTF-8: {e}")))?;
    let value: Value = serde_json::from_str(text)
        .map_err(|e| CodecError::malformed(format!("invalid JSON: {e}")))?;
    let Value::Object(mut obj) = value else {
        return Err(CodecError::malformed("message is not a JSON object"));
    };

    match obj.remove("v") {
        Some(v) if v.as_u64() == Some(PROTOCOL_VERSION) => {}
        Some(v) => return Err(CodecError::malformed(format!("unsupported version: {v}"))),
        None if framing == Framing::Legacy => {}
        None => return Err(CodecError::malformed("missing field `v`")),
    }

    if !obj.contains_key("type") {
        if framing != Framing::Legacy {
            return Err(CodecError::malformed("missing field `type`"));
        }
        let kind = infer_type(&obj)
            .ok_or_else(|| CodecError::malformed("cannot infer message type"))?;
        obj.insert("type".into(), Value::from(kind));
    }

    serde_json::from_value(Value::Object(obj)).map_err(|e| CodecError::malformed(e.to_string()))
}

fn infer_type(obj: &Map<String, Value>) -> Option<&'static str> {
    if obj.contains_key("command") {
        Some("cmd")
    } else if obj.contains_key("ack_id") && obj.contains_key("code") {
        Some("error")
    } else if obj.contains_key("ack_id") {
        Some("ack")
    } else if obj.contains_key("name") {
        Some("event")
    } else {
        None
    }
}

fn parse_length(line: &[u8], max_len: usize) -> Result<Option<usize>, CodecError> {
    if line.is_empty() || !line.iter().all(u8::is_ascii_digit) {
        return Ok(None);
    }
    if line.len() > MAX_PREFIX_DIGITS {
        return Err(CodecError::malformed("length prefix too long"));
    }
    // all-digit ASCII, so utf8 and parse can only fail on overflow
    let len: usize = std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CodecError::malformed("length prefix overflows"))?;
    if len > max_len {
        return Err(CodecError::malformed(format!(
            "frame too large: {len} > {max_len}"
        )));
    }
    Ok(Some(len))
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Decode one message from the front of `buf`.
///
/// Returns the message and the number of bytes consumed, or `None` if `buf`
/// does not yet hold a complete message. Blank lines between messages are
/// skipped and counted as consumed.
pub fn decode_frame(
    buf: &[u8],
    max_len: usize,
) -> Result<Option<(ControlMessage, usize)>, CodecError> {
    let mut start = 0;
    loop {
        let rest = &buf[start..];
        let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
            if rest.len() > max_len + MAX_PREFIX_DIGITS {
                return Err(CodecError::malformed("line exceeds maximum frame length"));
            }
            return Ok(None);
        };
        let line = trim_line(&rest[..=nl]);

        if line.iter().all(u8::is_ascii_whitespace) {
            start += nl + 1;
            continue;
        }

        if let Some(len) = parse_length(line, max_len)? {
            let body_start = nl + 1;
            if rest.len() < body_start + len {
                return Ok(None);
            }
            let msg = parse_body(&rest[body_start..body_start + len], Framing::LengthPrefixed)?;
            return Ok(Some((msg, start + body_start + len)));
        }

        if line.len() > max_len {
            return Err(CodecError::malformed("line exceeds maximum frame length"));
        }
        let msg = parse_body(line, Framing::Legacy)?;
        return Ok(Some((msg, start + nl + 1)));
    }
}

/// Read exactly one message from an async stream.
///
/// Leaves the reader positioned at the next message boundary. Returns
/// [`CodecError::Closed`] on a clean EOF before any byte of a message.
pub async fn read_message<R>(reader: &mut R, max_len: usize) -> Result<ControlMessage, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        let limit = (max_len + MAX_PREFIX_DIGITS + 1) as u64;
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(CodecError::Closed);
        }
        if line.last() != Some(&b'\n') {
            if line.len() as u64 >= limit {
                return Err(CodecError::malformed("line exceeds maximum frame length"));
            }
            return Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-message",
            )));
        }

        let trimmed = trim_line(&line);
        if trimmed.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        if let Some(len) = parse_length(trimmed, max_len)? {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            return parse_body(&body, Framing::LengthPrefixed);
        }

        if trimmed.len() > max_len {
            return Err(CodecError::malformed("line exceeds maximum frame length"));
        }
        return parse_body(trimmed, Framing::Legacy);
    }
}

/// Encode and write one message, then flush.
pub async fn write_message<W>(
    writer: &mut W,
    msg: &ControlMessage,
    framing: Framing,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(msg, framing)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
