//! BraggMeter line protocol.
//!
//! Requests are ASCII commands terminated by `\r\n`. Every reply carries an
//! `ACK` field; the payload starts after the `:` that follows it and ends
//! [`TRAILER_LEN`] bytes before the end of the frame, the last of which is the
//! `\n` the reader stops on.
//!
//! ```text
//! > :ACQU:WAVE:CHAN:0?\r\n
//! < :ACQU:WAVE:CHAN:0:ACK:1545.112,1550.031\r\n
//! ```
//!
//! Request and response are not symmetric, so there is no `decode(encode(..))`
//! identity. [`encode_response`] builds well-formed replies for fake devices
//! and tests.

use std::fmt;
use thiserror::Error;

/// Field that marks an accepted command.
pub const ACK_TOKEN: &str = "ACK";

/// Bytes at the end of every reply that are not part of the payload.
pub const TRAILER_LEN: usize = 2;

/// Request terminator.
pub const TERMINATOR: &str = "\r\n";

/// Byte the reader stops on.
pub const RESPONSE_DELIMITER: u8 = b'\n';

/// Errors produced while decoding a device reply.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The reply is missing its `ACK` field or the payload does not parse.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The device answered with an error token instead of `ACK`.
    #[error("Device rejected command: {0}")]
    Rejected(String),

    /// The status code is not part of the documented table.
    #[error("Unknown status code {0}")]
    UnknownStatus(i64),
}

/// Fixed command vocabulary understood by the interrogator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `:STAT?`
    Status,
    /// `:ACQU:STAR`
    Start,
    /// `:ACQU:STOP`
    Stop,
    /// `:ACQU:OSAT:CHAN:<n>?`, optical spectrum trace of one channel
    Trace(u8),
    /// `:ACQU:WAVE:CHAN:<n>?`, detected peak wavelengths of one channel
    Peaks(u8),
}

/// Shape of the payload a command answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Acknowledgement only, payload ignored.
    Ack,
    /// One integer status code.
    Status,
    /// Comma-separated floating point values.
    Values,
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// Command accepted.
    Ack,
    /// Raw status code, see [`crate::instrument::DeviceStatus::from_code`].
    Status(i64),
    /// Peak wavelengths (nm) or trace intensities.
    Values(Vec<f64>),
}

impl Command {
    /// Command text without terminator.
    pub fn text(&self) -> String {
        match self {
            Command::Status => ":STAT?".to_string(),
            Command::Start => ":ACQU:STAR".to_string(),
            Command::Stop => ":ACQU:STOP".to_string(),
            Command::Trace(channel) => format!(":ACQU:OSAT:CHAN:{}?", channel),
            Command::Peaks(channel) => format!(":ACQU:WAVE:CHAN:{}?", channel),
        }
    }

    /// Wire bytes of the request.
    pub fn encode(&self) -> Vec<u8> {
        format!("{}{}", self.text(), TERMINATOR).into_bytes()
    }

    /// Payload shape expected in reply to this command.
    pub fn response_kind(&self) -> ResponseKind {
        match self {
            Command::Status => ResponseKind::Status,
            Command::Start | Command::Stop => ResponseKind::Ack,
            Command::Trace(_) | Command::Peaks(_) => ResponseKind::Values,
        }
    }

    /// Recognises a request line, with or without terminator.
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim_end();
        match line {
            ":STAT?" => return Some(Command::Status),
            ":ACQU:STAR" => return Some(Command::Start),
            ":ACQU:STOP" => return Some(Command::Stop),
            _ => {}
        }
        let channel = |rest: &str| rest.strip_suffix('?').and_then(|n| n.parse::<u8>().ok());
        if let Some(rest) = line.strip_prefix(":ACQU:OSAT:CHAN:") {
            return channel(rest).map(Command::Trace);
        }
        if let Some(rest) = line.strip_prefix(":ACQU:WAVE:CHAN:") {
            return channel(rest).map(Command::Peaks);
        }
        None
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Decodes a reply to a command of the given kind.
pub fn decode(raw: &[u8], kind: ResponseKind) -> Result<ParsedResponse, ProtocolError> {
    if !raw.is_ascii() {
        return Err(ProtocolError::Malformed(
            "response contains non-ASCII bytes".to_string(),
        ));
    }
    let text = String::from_utf8_lossy(raw);
    let payload = extract_payload(&text)?;

    match kind {
        ResponseKind::Ack => Ok(ParsedResponse::Ack),
        ResponseKind::Status => parse_status(payload).map(ParsedResponse::Status),
        ResponseKind::Values => parse_values(payload).map(ParsedResponse::Values),
    }
}

/// Builds a well-formed reply to `command` carrying `payload`.
pub fn encode_response(command: &Command, payload: &str) -> Vec<u8> {
    let echo = command.text();
    let echo = echo.trim_end_matches('?');
    format!("{}:{}:{}{}", echo, ACK_TOKEN, payload, TERMINATOR).into_bytes()
}

/// Builds an error reply to `command`.
pub fn encode_rejection(command: &Command, reason: &str) -> Vec<u8> {
    let echo = command.text();
    let echo = echo.trim_end_matches('?');
    format!("{}:NACK:{}{}", echo, reason, TERMINATOR).into_bytes()
}

fn extract_payload(text: &str) -> Result<&str, ProtocolError> {
    if !text.ends_with(RESPONSE_DELIMITER as char) {
        return Err(ProtocolError::Malformed(format!(
            "unterminated response '{}'",
            text.trim()
        )));
    }

    let mut offset = 0;
    let mut payload_start = None;
    for field in text.split(':') {
        let token = field.trim_end();
        if token == ACK_TOKEN {
            payload_start = Some(offset + field.len() + 1);
            break;
        }
        if token == "NACK" || token.starts_with("ERR") {
            return Err(ProtocolError::Rejected(text.trim().to_string()));
        }
        offset += field.len() + 1;
    }

    let start = payload_start.ok_or_else(|| {
        ProtocolError::Malformed(format!("no {} token in '{}'", ACK_TOKEN, text.trim()))
    })?;
    let end = text.len().saturating_sub(TRAILER_LEN);
    if start >= end {
        return Ok("");
    }
    text.get(start..end)
        .ok_or_else(|| ProtocolError::Malformed(format!("cannot slice payload of '{}'", text.trim())))
}

fn parse_status(payload: &str) -> Result<i64, ProtocolError> {
    let field = payload.split(':').next().unwrap_or_default().trim();
    field
        .parse::<i64>()
        .map_err(|_| ProtocolError::Malformed(format!("status '{}' is not an integer", field)))
}

fn parse_values(payload: &str) -> Result<Vec<f64>, ProtocolError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    payload
        .split(',')
        .map(|value| {
            let value = value.trim();
            match value.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(v),
                _ => Err(ProtocolError::Malformed(format!(
                    "'{}' is not a finite number",
                    value
                ))),
            }
        })
        .collect()
}
