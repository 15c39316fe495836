//! Frame codec for the helper channel.
//!
//! A frame is an 8-byte header followed by an optional payload:
//!
//! ```text
//! +----------------+----------------+-----------------+
//! | code (u32, BE) | length (u32,BE)| payload (length) |
//! +----------------+----------------+-----------------+
//! ```
//!
//! `code` is a command in requests and a status in responses. A length of
//! `u32::MAX` means the frame carries no payload, which is distinct from an
//! empty one. Payloads larger than [`MAX_PAYLOAD`] are rejected before any
//! allocation.

use std::io::{self, Read, Write};

use prefstore_core::PrefsError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::messages::{Command, ErrorReply, Status};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Largest accepted payload.
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Sent when an [`ErrorReply`] cannot be encoded.
const FALLBACK_ERROR_PAYLOAD: &[u8] = br#"{"message":"error detail could not be encoded"}"#;

fn error_payload(reply: &ErrorReply) -> Vec<u8> {
    serde_json::to_vec(reply).unwrap_or_else(|_| FALLBACK_ERROR_PAYLOAD.to_vec())
}

/// Length value marking an absent payload.
pub const NO_PAYLOAD: u32 = u32::MAX;

/// Errors reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error on helper channel: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection at a frame boundary.
    #[error("connection closed")]
    Closed,

    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD} byte limit")]
    TooLarge(u32),
}

/// Errors interpreting frame contents.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing payload")]
    MissingPayload,

    #[error("unknown command {0}")]
    UnknownCommand(u32),

    #[error("unknown status {0}")]
    UnknownStatus(u32),
}

impl From<FrameError> for PrefsError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(source) => PrefsError::io_context("helper channel", source),
            other => PrefsError::Protocol(other.to_string()),
        }
    }
}

impl From<CodecError> for PrefsError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Json(err) => PrefsError::Serialize(err.to_string()),
            other => PrefsError::Protocol(other.to_string()),
        }
    }
}

/// One request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u32,
    pub payload: Option<Vec<u8>>,
}

impl Frame {
    pub fn request(command: Command, payload: Option<Vec<u8>>) -> Self {
        Self {
            code: command.code(),
            payload,
        }
    }

    pub fn response(status: Status, payload: Option<Vec<u8>>) -> Self {
        Self {
            code: status.code(),
            payload,
        }
    }

    /// Response for a failed operation. The payload is always present.
    pub fn error(err: &PrefsError) -> Self {
        let payload = error_payload(&ErrorReply::from(err));
        Self::response(Status::for_error(err), Some(payload))
    }

    pub fn command(&self) -> Result<Command, CodecError> {
        Command::from_code(self.code).ok_or(CodecError::UnknownCommand(self.code))
    }

    pub fn status(&self) -> Result<Status, CodecError> {
        Status::from_code(self.code).ok_or(CodecError::UnknownStatus(self.code))
    }

    /// Decode the JSON payload, which must be present.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let payload = self.payload.as_deref().ok_or(CodecError::MissingPayload)?;
        Ok(serde_json::from_slice(payload)?)
    }

    /// Interpret a response: the decoded error for a failed status, or the
    /// raw payload for `Ok`.
    pub fn into_result(self) -> Result<Option<Vec<u8>>, PrefsError> {
        let status = self.status()?;
        if status == Status::Ok {
            return Ok(self.payload);
        }

        let message = self
            .decode::<ErrorReply>()
            .map(|reply| reply.message)
            .unwrap_or_default();
        match status.into_error(message) {
            Some(err) => Err(err),
            None => Ok(self.payload),
        }
    }

    /// Serialize the header and payload.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let len = match &self.payload {
            None => NO_PAYLOAD,
            Some(payload) => checked_len(payload.len())?,
        };

        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.as_ref().map_or(0, Vec::len));
        bytes.extend_from_slice(&self.code.to_be_bytes());
        bytes.extend_from_slice(&len.to_be_bytes());
        if let Some(payload) = &self.payload {
            bytes.extend_from_slice(payload);
        }
        Ok(bytes)
    }
}

/// Encode a payload as JSON.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

fn checked_len(len: usize) -> Result<u32, FrameError> {
    match u32::try_from(len) {
        Ok(len) if len <= MAX_PAYLOAD => Ok(len),
        Ok(len) => Err(FrameError::TooLarge(len)),
        Err(_) => Err(FrameError::TooLarge(u32::MAX)),
    }
}

/// Parse a header into the code and the payload length, `None` meaning no
/// payload.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(u32, Option<u32>), FrameError> {
    let code = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    match len {
        NO_PAYLOAD => Ok((code, None)),
        len if len > MAX_PAYLOAD => Err(FrameError::TooLarge(len)),
        len => Ok((code, Some(len))),
    }
}

/// Read one frame from a blocking stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Closed
        } else {
            FrameError::Io(err)
        }
    })?;

    let (code, len) = parse_header(&header)?;
    let payload = match len {
        None => None,
        Some(len) => {
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload)?;
            Some(payload)
        }
    };
    Ok(Frame { code, payload })
}

/// Write one frame to a blocking stream.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()?)?;
    writer.flush()?;
    Ok(())
}
