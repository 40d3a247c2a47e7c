//! Command protocol between a host and the simulated device.
//!
//! Request (host -> device), one ASCII line per command:
//!   C<nonce hex:64>      sign challenge
//!   H                    create checkpoint
//!   M<kind>[:<value>]    apply tamper mutation
//!   V                    verify state against checkpoint
//!   I                    report public identity
//!
//! Response (device -> host):
//!   [status:1][payload_length:4 BE][payload:N]

use attestation_core::device::UnknownMutation;
use attestation_core::{Mutation, Nonce};
use std::fmt;
use thiserror::Error;

/// Largest payload a response frame may declare.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Size of the response frame header.
pub const RESPONSE_HEADER_BYTES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Sign the raw nonce bytes with the secure element.
    Challenge(Nonce),
    /// Hash and sign the current state as the new checkpoint.
    Checkpoint,
    /// Tamper with the device state.
    Mutate {
        kind: Mutation,
        value: Option<String>,
    },
    /// Compare the current state with the checkpoint.
    Verify,
    /// Report the public key and its hash.
    Identity,
}

impl Command {
    pub fn tag(&self) -> char {
        match self {
            Self::Challenge(_) => 'C',
            Self::Checkpoint => 'H',
            Self::Mutate { .. } => 'M',
            Self::Verify => 'V',
            Self::Identity => 'I',
        }
    }
}

/// Renders the command line without its terminator.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Challenge(nonce) => write!(f, "C{}", nonce),
            Self::Mutate { kind, value: None } => write!(f, "M{}", kind),
            Self::Mutate {
                kind,
                value: Some(value),
            } => write!(f, "M{}:{}", kind, value),
            other => write!(f, "{}", other.tag()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty command")]
    Empty,

    #[error("command is not valid UTF-8")]
    NotUtf8,

    #[error("unknown command tag: {0:?}")]
    UnknownTag(char),

    #[error("invalid challenge nonce: {0}")]
    InvalidNonce(String),

    #[error(transparent)]
    InvalidMutation(#[from] UnknownMutation),

    #[error("unexpected payload after {0:?} command")]
    UnexpectedPayload(char),

    #[error("command exceeds {0} bytes")]
    LineTooLong(usize),
}

/// Parse one command line (terminator already stripped).
pub fn parse_command(line: &[u8]) -> Result<Command, ProtocolError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::NotUtf8)?
        .trim();

    let mut chars = line.chars();
    let tag = chars.next().ok_or(ProtocolError::Empty)?;
    let payload = chars.as_str();

    let no_payload = |command: Command| {
        if payload.is_empty() {
            Ok(command)
        } else {
            Err(ProtocolError::UnexpectedPayload(tag))
        }
    };

    match tag {
        'C' => payload
            .parse::<Nonce>()
            .map(Command::Challenge)
            .map_err(|e| ProtocolError::InvalidNonce(e.to_string())),
        'M' => {
            let (kind, value) = match payload.split_once(':') {
                Some((kind, value)) => (kind, Some(value.to_string())),
                None => (payload, None),
            };
            Ok(Command::Mutate {
                kind: kind.parse()?,
                value,
            })
        }
        'H' => no_payload(Command::Checkpoint),
        'V' => no_payload(Command::Verify),
        'I' => no_payload(Command::Identity),
        other => Err(ProtocolError::UnknownTag(other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    /// Unparseable command; the session continues.
    Malformed = 0x01,
    /// Verify requested before any checkpoint exists.
    NoCheckpoint = 0x02,
    /// Secure element unusable; the session is closed after this frame.
    Fatal = 0x03,
}

impl Status {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Ok),
            0x01 => Some(Self::Malformed),
            0x02 => Some(Self::NoCheckpoint),
            0x03 => Some(Self::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Malformed => write!(f, "MALFORMED"),
            Self::NoCheckpoint => write!(f, "NO_CHECKPOINT"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    pub fn error(status: Status, reason: impl fmt::Display) -> Self {
        Self {
            status,
            payload: reason.to_string().into_bytes(),
        }
    }

    /// Payload as text, for error frames.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
