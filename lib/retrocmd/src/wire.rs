//! Wire dialect of the emulator command channel.
//!
//! Commands and replies are ASCII, newline-terminated, whitespace-separated.
//! Addresses render as decimal when numerically ≤ 9 and as lowercase hex with
//! no prefix otherwise; payload bytes are lowercase hex; a single `-1` token
//! in place of payload signals an emulator-side failure.

/// Read command verb, echoed back in replies.
pub const READ_VERB: &str = "READ_CORE_MEMORY";
/// Write command verb, echoed back in replies.
pub const WRITE_VERB: &str = "WRITE_CORE_MEMORY";
/// Connection-probe verb. The reply is uncorrelated (a bare version string).
pub const VERSION_VERB: &str = "VERSION";

/// Failure sentinel used by emulator cores in place of payload bytes.
pub const ERROR_SENTINEL: &str = "-1";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("emulator signaled failure")]
    EmulatorSignaled,
    #[error("invalid hex byte: \"{0}\"")]
    InvalidHexByte(String),
    #[error("truncated reply: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("malformed reply line: \"{0}\"")]
    Malformed(String),
}

/// Renders an address token: decimal for values ≤ 9, lowercase hex otherwise.
pub fn format_addr(addr: u32) -> String {
    if addr <= 9 {
        addr.to_string()
    } else {
        format!("{:x}", addr)
    }
}

/// Builds a `READ_CORE_MEMORY` command line.
pub fn read_command(addr: u32, len: usize) -> String {
    format!("{} {} {}\n", READ_VERB, format_addr(addr), len)
}

/// Builds a `WRITE_CORE_MEMORY` command line.
pub fn write_command(addr: u32, bytes: &[u8]) -> String {
    let mut cmd = format!("{} {}", WRITE_VERB, format_addr(addr));
    for b in bytes {
        cmd.push_str(&format!(" {:02x}", b));
    }
    cmd.push('\n');
    cmd
}

/// A reply line split into its correlation head and payload tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub verb: String,
    pub addr_token: String,
    pub payload: Vec<String>,
}

/// Splits a raw reply line into `(verb, addr, payload...)`.
///
/// Returns `None` for lines that cannot carry a correlation head, such as
/// the bare version string answering a `VERSION` probe.
pub fn parse_reply_line(line: &str) -> Option<ReplyLine> {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next()?;
    if verb != READ_VERB && verb != WRITE_VERB {
        return None;
    }
    let addr_token = tokens.next()?;
    Some(ReplyLine {
        verb: verb.to_string(),
        addr_token: addr_token.to_string(),
        payload: tokens.map(str::to_string).collect(),
    })
}

/// Decodes the payload of a read reply into bytes.
pub fn parse_read_payload(payload: &[String], expected: usize) -> Result<Vec<u8>, WireError> {
    if payload.first().map(String::as_str) == Some(ERROR_SENTINEL) {
        return Err(WireError::EmulatorSignaled);
    }
    let mut bytes = Vec::with_capacity(payload.len());
    for token in payload {
        let b = u8::from_str_radix(token, 16)
            .map_err(|_| WireError::InvalidHexByte(token.clone()))?;
        bytes.push(b);
    }
    if bytes.len() < expected {
        return Err(WireError::Truncated {
            expected,
            got: bytes.len(),
        });
    }
    // Some cores pad the tail of the last chunk; never return more than asked.
    bytes.truncate(expected);
    Ok(bytes)
}

/// Checks the status word of a write reply.
pub fn parse_write_status(payload: &[String]) -> Result<(), WireError> {
    match payload.first().map(String::as_str) {
        Some(ERROR_SENTINEL) => Err(WireError::EmulatorSignaled),
        Some(_) => Ok(()),
        None => Err(WireError::Malformed("write reply without status".into())),
    }
}
