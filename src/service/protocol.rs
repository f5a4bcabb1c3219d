use crate::common::{FaceAuthError, Result};
use crate::core::types::{FaceDescriptor, Frame, LandmarkSet};
use crate::liveness::engine::{FailureKind, LivenessVerdict};
use crate::service::stats::DaemonStats;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Largest message body accepted in either direction.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

pub type AttemptId = u64;

// Requests
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Request {
    Ping,
    GetEncoding(EncodingRequest),
    DetectFaces { frame: Frame },
    GetStats,
    Status,
    /// Privileged. The daemon drains and exits.
    Shutdown,
    /// `user` subjects the attempt to that user's lockout and failure count.
    BeginAttempt { user: Option<String> },
    SubmitFrames { attempt: AttemptId, frames: Vec<Frame> },
    CancelAttempt { attempt: AttemptId },
    GetTemplates { user: String },
    InvalidateTemplates { user: String },
    /// The caller compared descriptors and found no match.
    RecordMismatch { user: String },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::GetEncoding(_) => "get_encoding",
            Request::DetectFaces { .. } => "detect_faces",
            Request::GetStats => "get_stats",
            Request::Status => "status",
            Request::Shutdown => "shutdown",
            Request::BeginAttempt { .. } => "begin_attempt",
            Request::SubmitFrames { .. } => "submit_frames",
            Request::CancelAttempt { .. } => "cancel_attempt",
            Request::GetTemplates { .. } => "get_templates",
            Request::InvalidateTemplates { .. } => "invalidate_templates",
            Request::RecordMismatch { .. } => "record_mismatch",
        }
    }

    /// Observability requests are not counted as served traffic.
    pub fn is_observability(&self) -> bool {
        matches!(self, Request::Ping | Request::GetStats | Request::Status)
    }

    /// Requests that run the models and so wait for a worker.
    pub fn needs_worker(&self) -> bool {
        matches!(self, Request::GetEncoding(_) | Request::DetectFaces { .. } | Request::SubmitFrames { .. })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EncodingRequest {
    pub frame: Frame,
    pub landmarks: LandmarkSet,
}

// Responses
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Response {
    Pong,
    Encoding(FaceDescriptor),
    Faces(Vec<LandmarkSet>),
    Stats(DaemonStats),
    Status(DaemonStatus),
    Ack,
    AttemptStarted(AttemptId),
    AttemptUpdate(AttemptUpdate),
    Templates(Vec<FaceDescriptor>),
    Error(ErrorResponse),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DaemonStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub model_loaded: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FrameDescriptor {
    pub sequence: u64,
    pub descriptor: FaceDescriptor,
}

/// Progress of one attempt after a batch of frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AttemptUpdate {
    pub attempt: AttemptId,
    pub verdict: LivenessVerdict,
    /// Descriptors for frames processed in this batch, in sequence order.
    pub descriptors: Vec<FrameDescriptor>,
    pub frames_processed: usize,
    /// Of those, frames the quality filter kept from the detector.
    pub frames_skipped: usize,
    /// Set on a terminal rejection.
    pub failure: Option<FailureKind>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    UnknownAttempt,
    Busy,
    PermissionDenied,
    Cancelled,
    LockedOut,
    NotEnrolled,
    Model,
    Internal,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: Option<AttemptId>,
    /// Lockout time left, for `LockedOut`.
    pub retry_after_secs: Option<u64>,
}

impl ErrorResponse {
    pub fn from_error(error: &FaceAuthError) -> Self {
        let (kind, attempt) = match error {
            FaceAuthError::InvalidRequest(_) => (ErrorKind::InvalidRequest, None),
            FaceAuthError::UnknownAttempt(id) => (ErrorKind::UnknownAttempt, Some(*id)),
            FaceAuthError::Busy(_) => (ErrorKind::Busy, None),
            FaceAuthError::PermissionDenied(_) => (ErrorKind::PermissionDenied, None),
            FaceAuthError::AttemptCancelled => (ErrorKind::Cancelled, None),
            FaceAuthError::LockedOut { .. } => (ErrorKind::LockedOut, None),
            FaceAuthError::NotEnrolled(_) => (ErrorKind::NotEnrolled, None),
            FaceAuthError::Model(_) | FaceAuthError::ModelLoad(_) | FaceAuthError::Ort(_) => (ErrorKind::Model, None),
            _ => (ErrorKind::Internal, None),
        };
        let retry_after_secs = match error {
            FaceAuthError::LockedOut { remaining_secs, .. } => Some(*remaining_secs),
            _ => None,
        };
        Self { kind, message: error.to_string(), attempt, retry_after_secs }
    }

    /// Rebuilds a typed error on the client side.
    pub fn into_error(self) -> FaceAuthError {
        match self.kind {
            ErrorKind::InvalidRequest => FaceAuthError::InvalidRequest(self.message),
            ErrorKind::UnknownAttempt => FaceAuthError::UnknownAttempt(self.attempt.unwrap_or_default()),
            ErrorKind::Busy => FaceAuthError::Busy(0),
            ErrorKind::PermissionDenied => FaceAuthError::PermissionDenied(0),
            ErrorKind::Cancelled => FaceAuthError::AttemptCancelled,
            ErrorKind::LockedOut => FaceAuthError::LockedOut {
                user: String::new(),
                remaining_secs: self.retry_after_secs.unwrap_or_default(),
            },
            ErrorKind::NotEnrolled => FaceAuthError::NotEnrolled(self.message),
            ErrorKind::Model => FaceAuthError::Model(self.message),
            ErrorKind::Internal => FaceAuthError::Other(anyhow::anyhow!("daemon error: {}", self.message)),
        }
    }
}

impl From<FaceAuthError> for Response {
    fn from(error: FaceAuthError) -> Self {
        Response::Error(ErrorResponse::from_error(&error))
    }
}

/// Writes a 4-byte little-endian length followed by the bincode body.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = bincode::serialize(message)
        .map_err(|e| FaceAuthError::Other(anyhow::anyhow!("Failed to serialize message: {}", e)))?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(FaceAuthError::InvalidRequest(format!("Message too large: {} bytes", body.len())));
    }

    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one framed message. Oversized or undecodable bodies are
/// `InvalidRequest` and leave the stream at the next message boundary;
/// transport failures stay `Io`.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        let skipped = io::copy(&mut reader.by_ref().take(len as u64), &mut io::sink())?;
        if skipped < len as u64 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        return Err(FaceAuthError::InvalidRequest(format!("Message too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    bincode::deserialize(&body)
        .map_err(|e| FaceAuthError::InvalidRequest(format!("Failed to deserialize message: {}", e)))
}
