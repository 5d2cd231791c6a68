//! Line codec for the Kaleidescape control protocol.
//!
//! Wire format:
//! ```text
//! command:  <addr>/<seq>/<NAME>:<param>:...:\r
//! reply:    <addr>/<seq|!>/<status>:<NAME>:<field>:...:/<checksum>\r\n
//! ```
//!
//! `:` separates fields, `/` introduces the checksum.  Either character (and
//! the backslash itself) is escaped with a leading `\` when it appears inside
//! a field; control characters travel as `\r`, `\n` and `\t`.
//!
//! The checksum is the sum of every byte before the final `/`, modulo 100,
//! written as two decimal digits.  It is optional on input but is verified
//! whenever present.

use crate::protocol::messages::{DeviceCommand, DeviceReply, Sequence, DEVICE_ADDRESS};
use thiserror::Error;

/// Longest line the decoder will buffer before giving up on finding a terminator.
pub const MAX_LINE_LEN: usize = 1024;

/// Errors that can occur during line encoding or decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// No complete line is buffered yet.
    #[error("insufficient data: no line terminator in {available} buffered bytes")]
    InsufficientData { available: usize },

    /// No terminator was found within [`MAX_LINE_LEN`] bytes.
    #[error("line exceeds {limit} bytes without a terminator")]
    LineTooLong { limit: usize },

    /// The line does not follow the `addr/seq/body` structure.
    #[error("malformed line: {0}")]
    MalformedLine(String),

    /// The sequence slot is neither a digit nor `!`.
    #[error("invalid sequence: {0:?}")]
    InvalidSequence(String),

    /// The checksum trailer does not match the line contents.
    #[error("checksum mismatch: computed {expected:02}, line carries {actual:02}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// The command name contains characters the device does not accept.
    #[error("invalid command name: {0:?}")]
    InvalidCommand(String),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a command line using sequence digit `seq`.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidSequence`] when `seq` is outside `1..=9`
/// and [`ProtocolError::InvalidCommand`] when the name is empty or contains
/// anything but upper-case letters, digits and underscores.
///
/// # Examples
///
/// ```rust
/// use kscape_core::protocol::{encode_command, DeviceCommand};
///
/// let bytes = encode_command(&DeviceCommand::new("PLAY"), 3).unwrap();
/// assert_eq!(bytes, b"01/3/PLAY:\r");
/// ```
pub fn encode_command(command: &DeviceCommand, seq: u8) -> Result<Vec<u8>, ProtocolError> {
    if !(1..=9).contains(&seq) {
        return Err(ProtocolError::InvalidSequence(seq.to_string()));
    }
    if !is_valid_name(&command.name) {
        return Err(ProtocolError::InvalidCommand(command.name.clone()));
    }

    let mut line = format!("{DEVICE_ADDRESS}/{seq}/{}:", command.name);
    for param in &command.params {
        push_escaped(&mut line, param);
        line.push(':');
    }
    line.push('\r');
    Ok(line.into_bytes())
}

/// Encodes a reply or event line with its checksum trailer.
///
/// This is the device side of the protocol; the integration only needs it to
/// drive simulated players in tests and benchmarks.
pub fn encode_reply(reply: &DeviceReply) -> Vec<u8> {
    let mut line = format!("{DEVICE_ADDRESS}/{}/{:03}:", reply.sequence, reply.status);
    if !reply.name.is_empty() || !reply.fields.is_empty() {
        push_escaped(&mut line, &reply.name);
        line.push(':');
        for field in &reply.fields {
            push_escaped(&mut line, field);
            line.push(':');
        }
    }
    let sum = checksum(line.as_bytes());
    line.push_str(&format!("/{sum:02}\r\n"));
    line.into_bytes()
}

/// Decodes one reply from the beginning of `bytes`.
///
/// Returns the decoded reply and the number of bytes consumed, including any
/// leading blank terminators and the trailing `\r`, `\n` or `\r\n`.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] while the line is still
/// incomplete; any other variant means the line itself is bad.
///
/// # Examples
///
/// ```rust
/// use kscape_core::protocol::{decode_reply, Sequence};
///
/// let (reply, consumed) = decode_reply(b"01/!/000:DEVICE_POWER_STATE:1:/95\r\n").unwrap();
/// assert_eq!(reply.sequence, Sequence::Event);
/// assert_eq!(reply.fields, vec!["1".to_string()]);
/// assert_eq!(consumed, 35);
/// ```
pub fn decode_reply(bytes: &[u8]) -> Result<(DeviceReply, usize), ProtocolError> {
    let (line, consumed) = next_line(bytes)?;
    Ok((parse_reply_line(line)?, consumed))
}

/// Decodes one command from the beginning of `bytes`, returning the command,
/// its sequence digit and the number of bytes consumed.
///
/// Like [`encode_reply`], this is the device side of the protocol.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] while the line is incomplete.
pub fn decode_command(bytes: &[u8]) -> Result<(DeviceCommand, u8, usize), ProtocolError> {
    let (line, consumed) = next_line(bytes)?;
    let (seq, body) = split_header(line)?;
    let seq = match seq {
        Sequence::Request(digit) if digit > 0 => digit,
        other => return Err(ProtocolError::InvalidSequence(other.to_string())),
    };

    let (tokens, _) = tokenize(body)?;
    let mut tokens = tokens.into_iter();
    let name = tokens.next().unwrap_or_default();
    if !is_valid_name(&name) {
        return Err(ProtocolError::InvalidCommand(name));
    }
    Ok((
        DeviceCommand {
            name,
            params: tokens.collect(),
        },
        seq,
        consumed,
    ))
}

/// Splits the first complete line off `bytes`.
///
/// Returns the line without its terminator and the total number of bytes it
/// occupied, so a reader can drop a bad line and keep going.
///
/// # Errors
///
/// [`ProtocolError::InsufficientData`] when no terminator is buffered yet,
/// [`ProtocolError::LineTooLong`] when the line will never fit, and
/// [`ProtocolError::MalformedLine`] when it is not valid UTF-8.
pub fn next_line(bytes: &[u8]) -> Result<(&str, usize), ProtocolError> {
    let skip = bytes.iter().take_while(|b| is_terminator(**b)).count();
    let rest = &bytes[skip..];

    let Some(end) = rest.iter().position(|b| is_terminator(*b)) else {
        if rest.len() > MAX_LINE_LEN {
            return Err(ProtocolError::LineTooLong {
                limit: MAX_LINE_LEN,
            });
        }
        return Err(ProtocolError::InsufficientData {
            available: bytes.len(),
        });
    };
    if end > MAX_LINE_LEN {
        return Err(ProtocolError::LineTooLong {
            limit: MAX_LINE_LEN,
        });
    }

    let mut consumed = skip + end + 1;
    if rest[end] == b'\r' && rest.get(end + 1) == Some(&b'\n') {
        consumed += 1;
    }
    let line = std::str::from_utf8(&rest[..end])
        .map_err(|e| ProtocolError::MalformedLine(format!("not UTF-8: {e}")))?;
    Ok((line, consumed))
}

/// Parses a single reply line (without its terminator).
///
/// # Errors
///
/// Returns [`ProtocolError`] when the structure, sequence, status or checksum
/// is invalid.
pub fn parse_reply_line(line: &str) -> Result<DeviceReply, ProtocolError> {
    let (sequence, body) = split_header(line)?;
    let header_len = line.len() - body.len();

    let (tokens, checksum_at) = tokenize(body)?;
    if let Some(slash) = checksum_at {
        let digits = &body[slash + 1..];
        let actual = parse_checksum(digits)?;
        let expected = checksum(&line.as_bytes()[..header_len + slash]);
        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }
    }

    let mut tokens = tokens.into_iter();
    let status_text = tokens
        .next()
        .ok_or_else(|| ProtocolError::MalformedLine("missing status".to_string()))?;
    let status = parse_status(&status_text)?;
    let name = tokens.next().unwrap_or_default();

    Ok(DeviceReply {
        sequence,
        status,
        name,
        fields: tokens.collect(),
    })
}

/// Sum of `bytes` modulo 100.
pub fn checksum(bytes: &[u8]) -> u8 {
    let total: u32 = bytes.iter().map(|b| u32::from(*b)).sum();
    (total % 100) as u8
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn is_terminator(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

fn push_escaped(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            ':' | '/' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
}

/// Splits `addr/seq/` off the front of a line.
fn split_header(line: &str) -> Result<(Sequence, &str), ProtocolError> {
    let (address, rest) = line
        .split_once('/')
        .ok_or_else(|| ProtocolError::MalformedLine(format!("no address in {line:?}")))?;
    if address.is_empty() || !address.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::MalformedLine(format!(
            "bad device address {address:?}"
        )));
    }

    let (seq, body) = rest
        .split_once('/')
        .ok_or_else(|| ProtocolError::MalformedLine(format!("no sequence in {line:?}")))?;
    let sequence = match seq.as_bytes() {
        [b'!'] => Sequence::Event,
        [d] if d.is_ascii_digit() => Sequence::Request(d - b'0'),
        _ => return Err(ProtocolError::InvalidSequence(seq.to_string())),
    };
    Ok((sequence, body))
}

/// Splits a body on unescaped `:` and stops at the first unescaped `/`.
///
/// Returns the unescaped tokens and the byte offset of the checksum slash.
fn tokenize(body: &str) -> Result<(Vec<String>, Option<usize>), ProtocolError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut checksum_at = None;

    let mut chars = body.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'r')) => current.push('\r'),
                Some((_, 'n')) => current.push('\n'),
                Some((_, 't')) => current.push('\t'),
                Some((_, escaped)) => current.push(escaped),
                None => {
                    return Err(ProtocolError::MalformedLine(
                        "dangling escape at end of line".to_string(),
                    ))
                }
            },
            ':' => tokens.push(std::mem::take(&mut current)),
            '/' => {
                checksum_at = Some(idx);
                break;
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok((tokens, checksum_at))
}

fn parse_checksum(digits: &str) -> Result<u8, ProtocolError> {
    if digits.len() != 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::MalformedLine(format!(
            "bad checksum trailer {digits:?}"
        )));
    }
    digits
        .parse()
        .map_err(|_| ProtocolError::MalformedLine(format!("bad checksum trailer {digits:?}")))
}

fn parse_status(text: &str) -> Result<u16, ProtocolError> {
    if text.len() != 3 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::MalformedLine(format!(
            "bad status code {text:?}"
        )));
    }
    text.parse()
        .map_err(|_| ProtocolError::MalformedLine(format!("bad status code {text:?}")))
}
