//! Control Line Parser
//!
//! Turns one control line (already stripped of its terminator by the
//! transport) into a [`ControlMessage`].
//!
//! ## Rules
//!
//! 1. Bare tokens (`HEARTBEAT`, `READY`, ...) must match exactly.
//! 2. `IMAGE:<type>:<filename>:<size>` takes the type up to the first `:` and
//!    the size after the last `:`, so the filename may itself contain `:`.
//! 3. Sizes are base-10 and capped at [`MAX_PAYLOAD_SIZE`].
//! 4. Filenames are stored as bare names, so anything that could escape the
//!    storage directory is rejected.
//! 5. Unrecognized lines are not an error: they come back as
//!    [`ControlMessage::Unknown`] and the caller decides.

use crate::protocol::types::{token, ControlMessage, ImageAnnounce, Modality, ResultAnnounce};
use thiserror::Error;

/// Errors that can occur while parsing a control line.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// A field is missing from a structured message
    #[error("malformed {kind} message: {line:?}")]
    Malformed { kind: &'static str, line: String },

    /// Unknown image type tag
    #[error("unknown image type: {0:?}")]
    UnknownModality(String),

    /// Size field is not a valid integer
    #[error("invalid size: {0:?}")]
    InvalidSize(String),

    /// Declared payload exceeds the maximum allowed size
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    /// Filename that can't be stored as a bare name
    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size of a single announced payload (512 MB)
pub const MAX_PAYLOAD_SIZE: u64 = 512 * 1024 * 1024;

/// Parses a single control line.
pub fn parse_control(line: &str) -> ParseResult<ControlMessage> {
    let msg = match line {
        token::ACCEPTED => ControlMessage::Accepted,
        token::HEARTBEAT => ControlMessage::Heartbeat,
        token::ALIVE => ControlMessage::Alive,
        token::READY => ControlMessage::Ready,
        token::RECEIVED => ControlMessage::Received,
        token::FAILED => ControlMessage::Failed,
        token::RESULT_FAILED => ControlMessage::ResultFailed,
        token::RESULTS_DONE => ControlMessage::ResultsDone,
        _ => {
            if let Some(rest) = line.strip_prefix(token::CLIENT) {
                ControlMessage::Client(rest.to_string())
            } else if let Some(rest) = line.strip_prefix(token::IMAGE) {
                ControlMessage::Image(parse_image(line, rest)?)
            } else if let Some(rest) = line.strip_prefix(token::RESULT_IMAGE) {
                ControlMessage::ResultImage(parse_result(line, rest)?)
            } else {
                ControlMessage::Unknown(line.to_string())
            }
        }
    };

    Ok(msg)
}

/// Parses the body of `IMAGE:<type>:<filename>:<size>`.
fn parse_image(line: &str, rest: &str) -> ParseResult<ImageAnnounce> {
    let malformed = || ParseError::Malformed {
        kind: "IMAGE",
        line: line.to_string(),
    };

    let (kind, rest) = rest.split_once(':').ok_or_else(malformed)?;
    let (filename, size) = rest.rsplit_once(':').ok_or_else(malformed)?;

    let modality = kind
        .parse::<Modality>()
        .map_err(ParseError::UnknownModality)?;

    Ok(ImageAnnounce {
        modality,
        filename: validate_filename(filename)?.to_string(),
        size: parse_size(size)?,
    })
}

/// Parses the body of `RESULT_IMAGE:<filename>:<size>`.
fn parse_result(line: &str, rest: &str) -> ParseResult<ResultAnnounce> {
    let (filename, size) = rest.rsplit_once(':').ok_or_else(|| ParseError::Malformed {
        kind: "RESULT_IMAGE",
        line: line.to_string(),
    })?;

    Ok(ResultAnnounce {
        filename: validate_filename(filename)?.to_string(),
        size: parse_size(size)?,
    })
}

fn parse_size(s: &str) -> ParseResult<u64> {
    let size: u64 = s
        .trim()
        .parse()
        .map_err(|_| ParseError::InvalidSize(s.to_string()))?;

    if size > MAX_PAYLOAD_SIZE {
        return Err(ParseError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    Ok(size)
}

/// Checks that a filename is a bare name that stays inside its directory
/// and fits on one control line.
pub fn validate_filename(name: &str) -> ParseResult<&str> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);

    if bad {
        Err(ParseError::InvalidFilename(name.to_string()))
    } else {
        Ok(name)
    }
}
