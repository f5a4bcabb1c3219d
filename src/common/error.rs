use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceAuthError {
    /// Models missing or unreadable at startup. Fatal for the daemon.
    #[error("Model load failure: {0}")]
    ModelLoad(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("Daemon did not answer within {0:?}")]
    DaemonTimeout(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Permission denied for uid {0}")]
    PermissionDenied(u32),

    #[error("Unknown attempt: {0}")]
    UnknownAttempt(u64),

    #[error("Attempt cancelled")]
    AttemptCancelled,

    #[error("Too many concurrent attempts ({0})")]
    Busy(usize),

    #[error("Too many failed attempts, locked out for another {remaining_secs}s")]
    LockedOut { user: String, remaining_secs: u64 },

    #[error("No enrolled templates for {0}")]
    NotEnrolled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl FaceAuthError {
    /// Errors after which the caller should switch to the in-process path.
    pub fn is_daemon_failure(&self) -> bool {
        matches!(
            self,
            FaceAuthError::DaemonUnavailable(_) | FaceAuthError::DaemonTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FaceAuthError>;
