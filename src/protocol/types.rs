//! Control Message Types
//!
//! This module defines the vocabulary exchanged between the producer and the
//! consumer. Every control message travels as a single UTF-8 line terminated
//! by `\n`; raw payload bytes only ever follow an announce/`READY` exchange
//! that fixes their length.
//!
//! ## Vocabulary
//!
//! ```text
//! producer -> consumer   CLIENT:<identity>                 -> ACCEPTED
//! producer -> consumer   HEARTBEAT                         -> ALIVE
//! producer -> consumer   IMAGE:<type>:<filename>:<size>    -> READY, <bytes>, RECEIVED | FAILED
//! consumer -> producer   RESULT_IMAGE:<filename>:<size>    -> READY, <bytes>, RECEIVED
//! consumer -> producer   RESULT_FAILED
//! consumer -> producer   RESULTS_DONE
//! ```

use std::fmt;
use std::str::FromStr;

/// Line terminator for control messages
pub const LINE_END: u8 = b'\n';

/// Control message tokens
pub mod token {
    pub const CLIENT: &str = "CLIENT:";
    pub const ACCEPTED: &str = "ACCEPTED";
    pub const HEARTBEAT: &str = "HEARTBEAT";
    pub const ALIVE: &str = "ALIVE";
    pub const IMAGE: &str = "IMAGE:";
    pub const READY: &str = "READY";
    pub const RECEIVED: &str = "RECEIVED";
    pub const FAILED: &str = "FAILED";
    pub const RESULT_IMAGE: &str = "RESULT_IMAGE:";
    pub const RESULT_FAILED: &str = "RESULT_FAILED";
    pub const RESULTS_DONE: &str = "RESULTS_DONE";
}

/// The image modality carried by an `IMAGE:` announcement.
///
/// A pair always consists of one image of each modality, sent in the
/// order given by [`Modality::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    /// Visible-spectrum image
    Visible,
    /// Thermal (infrared) image
    Thermal,
}

impl Modality {
    /// Both modalities in transfer order: visible first, then thermal.
    pub const ALL: [Modality; 2] = [Modality::Visible, Modality::Thermal];

    /// Returns the wire tag, which is also the storage subdirectory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Visible => "visible",
            Modality::Thermal => "thermal",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "visible" => Ok(Modality::Visible),
            "thermal" => Ok(Modality::Thermal),
            other => Err(other.to_string()),
        }
    }
}

/// An announced image payload (`IMAGE:<type>:<filename>:<size>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAnnounce {
    pub modality: Modality,
    pub filename: String,
    pub size: u64,
}

/// An announced result payload (`RESULT_IMAGE:<filename>:<size>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultAnnounce {
    pub filename: String,
    pub size: u64,
}

/// A single control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Handshake opener carrying the producer's identity
    Client(String),
    Accepted,
    Heartbeat,
    Alive,
    Image(ImageAnnounce),
    Ready,
    Received,
    Failed,
    ResultImage(ResultAnnounce),
    ResultFailed,
    /// End of the result list for the current pair
    ResultsDone,
    /// Anything we don't recognize. Kept verbatim for logging.
    Unknown(String),
}

impl ControlMessage {
    /// Creates a handshake message.
    pub fn client(identity: impl Into<String>) -> Self {
        ControlMessage::Client(identity.into())
    }

    /// Creates an image announcement.
    pub fn image(modality: Modality, filename: impl Into<String>, size: u64) -> Self {
        ControlMessage::Image(ImageAnnounce {
            modality,
            filename: filename.into(),
            size,
        })
    }

    /// Creates a result announcement.
    pub fn result_image(filename: impl Into<String>, size: u64) -> Self {
        ControlMessage::ResultImage(ResultAnnounce {
            filename: filename.into(),
            size,
        })
    }

    /// Encodes the message as a control line, without the terminator.
    pub fn encode(&self) -> String {
        match self {
            ControlMessage::Client(identity) => format!("{}{}", token::CLIENT, identity),
            ControlMessage::Accepted => token::ACCEPTED.to_string(),
            ControlMessage::Heartbeat => token::HEARTBEAT.to_string(),
            ControlMessage::Alive => token::ALIVE.to_string(),
            ControlMessage::Image(img) => format!(
                "{}{}:{}:{}",
                token::IMAGE,
                img.modality,
                img.filename,
                img.size
            ),
            ControlMessage::Ready => token::READY.to_string(),
            ControlMessage::Received => token::RECEIVED.to_string(),
            ControlMessage::Failed => token::FAILED.to_string(),
            ControlMessage::ResultImage(res) => {
                format!("{}{}:{}", token::RESULT_IMAGE, res.filename, res.size)
            }
            ControlMessage::ResultFailed => token::RESULT_FAILED.to_string(),
            ControlMessage::ResultsDone => token::RESULTS_DONE.to_string(),
            ControlMessage::Unknown(line) => line.clone(),
        }
    }

    /// Short name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Client(_) => "CLIENT",
            ControlMessage::Accepted => "ACCEPTED",
            ControlMessage::Heartbeat => "HEARTBEAT",
            ControlMessage::Alive => "ALIVE",
            ControlMessage::Image(_) => "IMAGE",
            ControlMessage::Ready => "READY",
            ControlMessage::Received => "RECEIVED",
            ControlMessage::Failed => "FAILED",
            ControlMessage::ResultImage(_) => "RESULT_IMAGE",
            ControlMessage::ResultFailed => "RESULT_FAILED",
            ControlMessage::ResultsDone => "RESULTS_DONE",
            ControlMessage::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
