use crate::common::{Config, FaceAuthError, Result};
use crate::core::types::{FaceDescriptor, Frame, LandmarkSet};
use crate::service::protocol::{
    read_message, write_message, AttemptId, AttemptUpdate, DaemonStatus, EncodingRequest, Request, Response,
};
use crate::service::stats::DaemonStats;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection to the model daemon. One request in flight at a time.
pub struct IpcClient {
    stream: UnixStream,
    socket_path: PathBuf,
    request_timeout: Duration,
    /// Set after a transport failure; the stream may hold a stale response.
    broken: bool,
}

impl IpcClient {
    pub fn from_config(config: &Config, socket_path: &Path) -> Result<Self> {
        Self::connect(
            socket_path,
            Duration::from_millis(config.daemon.connect_timeout_ms),
            Duration::from_millis(config.daemon.request_timeout_ms),
        )
    }

    /// Connects and completes a ping handshake within `connect_timeout`.
    pub fn connect(socket_path: &Path, connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        if !socket_path.exists() {
            return Err(FaceAuthError::DaemonUnavailable(format!(
                "socket {} not found", socket_path.display()
            )));
        }

        let stream = UnixStream::connect(socket_path).map_err(|e| {
            FaceAuthError::DaemonUnavailable(format!("connect to {} failed: {}", socket_path.display(), e))
        })?;
        stream.set_write_timeout(Some(request_timeout))?;

        let mut client = Self {
            stream,
            socket_path: socket_path.to_path_buf(),
            request_timeout: connect_timeout,
            broken: false,
        };
        match client.call(&Request::Ping) {
            Ok(Response::Pong) => {}
            Ok(other) => return Err(unexpected(other)),
            Err(FaceAuthError::DaemonTimeout(_)) => {
                return Err(FaceAuthError::DaemonUnavailable("handshake timed out".into()));
            }
            Err(e) => return Err(e),
        }
        client.request_timeout = request_timeout;
        tracing::debug!("Connected to daemon at {}", socket_path.display());
        Ok(client)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn call(&mut self, request: &Request) -> Result<Response> {
        if self.broken {
            return Err(FaceAuthError::DaemonUnavailable("connection is no longer usable".into()));
        }
        self.stream.set_read_timeout(Some(self.request_timeout))?;

        let exchange = write_message(&mut self.stream, request).and_then(|_| read_message::<_, Response>(&mut self.stream));
        let response = exchange.map_err(|e| {
            let e = self.classify(e);
            if e.is_daemon_failure() {
                self.broken = true;
            }
            e
        })?;

        match response {
            Response::Error(error) => Err(error.into_error()),
            response => Ok(response),
        }
    }

    fn classify(&self, error: FaceAuthError) -> FaceAuthError {
        match error {
            FaceAuthError::Io(e) => match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    FaceAuthError::DaemonTimeout(self.request_timeout)
                }
                _ => FaceAuthError::DaemonUnavailable(e.to_string()),
            },
            other => other,
        }
    }

    pub fn ping(&mut self) -> Result<()> {
        match self.call(&Request::Ping)? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_encoding(&mut self, frame: &Frame, landmarks: &LandmarkSet) -> Result<FaceDescriptor> {
        let request = Request::GetEncoding(EncodingRequest { frame: frame.clone(), landmarks: landmarks.clone() });
        match self.call(&request)? {
            Response::Encoding(descriptor) => Ok(descriptor),
            other => Err(unexpected(other)),
        }
    }

    pub fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<LandmarkSet>> {
        match self.call(&Request::DetectFaces { frame: frame.clone() })? {
            Response::Faces(faces) => Ok(faces),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_stats(&mut self) -> Result<DaemonStats> {
        match self.call(&Request::GetStats)? {
            Response::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    pub fn status(&mut self) -> Result<DaemonStatus> {
        match self.call(&Request::Status)? {
            Response::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub fn shutdown(&mut self) -> Result<()> {
        match self.call(&Request::Shutdown)? {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn begin_attempt(&mut self, user: Option<&str>) -> Result<AttemptId> {
        match self.call(&Request::BeginAttempt { user: user.map(str::to_string) })? {
            Response::AttemptStarted(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub fn submit_frames(&mut self, attempt: AttemptId, frames: Vec<Frame>) -> Result<AttemptUpdate> {
        match self.call(&Request::SubmitFrames { attempt, frames })? {
            Response::AttemptUpdate(update) => Ok(update),
            other => Err(unexpected(other)),
        }
    }

    pub fn cancel_attempt(&mut self, attempt: AttemptId) -> Result<()> {
        match self.call(&Request::CancelAttempt { attempt })? {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_templates(&mut self, user: &str) -> Result<Vec<FaceDescriptor>> {
        match self.call(&Request::GetTemplates { user: user.to_string() })? {
            Response::Templates(templates) => Ok(templates),
            other => Err(unexpected(other)),
        }
    }

    pub fn invalidate_templates(&mut self, user: &str) -> Result<()> {
        match self.call(&Request::InvalidateTemplates { user: user.to_string() })? {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn record_mismatch(&mut self, user: &str) -> Result<()> {
        match self.call(&Request::RecordMismatch { user: user.to_string() })? {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> FaceAuthError {
    FaceAuthError::Other(anyhow::anyhow!("Unexpected response from daemon: {:?}", response))
}
