//! Remote (daemon) and in-process strategies behind one interface.

use crate::common::{Config, Result};
use crate::core::model::ModelHost;
use crate::core::types::{FaceDescriptor, Frame, LandmarkSet};
use crate::service::attempts::{AttemptRegistry, AttemptSettings};
use crate::service::client::IpcClient;
use crate::service::protocol::{AttemptId, AttemptUpdate};
use crate::service::stats::StatsRegistry;
use crate::storage::templates::TemplateCache;
use std::path::Path;
use std::sync::Arc;

pub trait AuthBackend {
    fn name(&self) -> &'static str;

    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<LandmarkSet>>;

    fn get_encoding(&mut self, frame: &Frame, landmarks: &LandmarkSet) -> Result<FaceDescriptor>;

    /// With a `user`, the attempt is refused while that user is locked out.
    fn begin_attempt(&mut self, user: Option<&str>) -> Result<AttemptId>;

    fn submit_frames(&mut self, attempt: AttemptId, frames: Vec<Frame>) -> Result<AttemptUpdate>;

    fn cancel_attempt(&mut self, attempt: AttemptId) -> Result<()>;

    /// Enrolled descriptors for `user`, for the caller's own comparison.
    fn get_templates(&mut self, user: &str) -> Result<Vec<FaceDescriptor>>;

    fn record_mismatch(&mut self, user: &str) -> Result<()>;
}

pub struct RemoteBackend {
    client: IpcClient,
}

impl RemoteBackend {
    pub fn new(client: IpcClient) -> Self {
        Self { client }
    }
}

impl AuthBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "daemon"
    }

    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<LandmarkSet>> {
        self.client.detect_faces(frame)
    }

    fn get_encoding(&mut self, frame: &Frame, landmarks: &LandmarkSet) -> Result<FaceDescriptor> {
        self.client.get_encoding(frame, landmarks)
    }

    fn begin_attempt(&mut self, user: Option<&str>) -> Result<AttemptId> {
        self.client.begin_attempt(user)
    }

    fn submit_frames(&mut self, attempt: AttemptId, frames: Vec<Frame>) -> Result<AttemptUpdate> {
        self.client.submit_frames(attempt, frames)
    }

    fn cancel_attempt(&mut self, attempt: AttemptId) -> Result<()> {
        self.client.cancel_attempt(attempt)
    }

    fn get_templates(&mut self, user: &str) -> Result<Vec<FaceDescriptor>> {
        self.client.get_templates(user)
    }

    fn record_mismatch(&mut self, user: &str) -> Result<()> {
        self.client.record_mismatch(user)
    }
}

/// Runs the same model, pipeline and liveness engine inside the caller.
pub struct LocalBackend {
    host: Arc<ModelHost>,
    attempts: AttemptRegistry,
    templates: TemplateCache,
}

impl LocalBackend {
    pub fn new(config: &Config, host: Arc<ModelHost>) -> Self {
        let stats = Arc::new(StatsRegistry::new());
        let attempts = AttemptRegistry::new(
            AttemptSettings::from_config(config),
            Arc::clone(&host),
            Arc::clone(&stats),
            None,
        );
        let templates = TemplateCache::new(config.templates.dir.clone(), stats);
        Self { host, attempts, templates }
    }
}

impl AuthBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<LandmarkSet>> {
        self.host.detect(frame)
    }

    fn get_encoding(&mut self, frame: &Frame, landmarks: &LandmarkSet) -> Result<FaceDescriptor> {
        self.host.get_encoding(frame, landmarks)
    }

    fn begin_attempt(&mut self, user: Option<&str>) -> Result<AttemptId> {
        self.attempts.begin(user)
    }

    fn submit_frames(&mut self, attempt: AttemptId, frames: Vec<Frame>) -> Result<AttemptUpdate> {
        self.attempts.submit(attempt, frames)
    }

    fn cancel_attempt(&mut self, attempt: AttemptId) -> Result<()> {
        self.attempts.cancel(attempt)
    }

    fn get_templates(&mut self, user: &str) -> Result<Vec<FaceDescriptor>> {
        Ok(self.templates.get(user)?.as_ref().clone())
    }

    fn record_mismatch(&mut self, user: &str) -> Result<()> {
        self.attempts.record_mismatch(user)
    }
}

type LocalFactory = Box<dyn FnMut() -> Result<LocalBackend>>;

/// Prefers the daemon and switches to the local path on `DaemonUnavailable`
/// or `DaemonTimeout`. Stateless calls are retried locally; an attempt that
/// lived in the daemon is lost, but the next `begin_attempt` runs locally.
pub struct FallbackBackend {
    remote: Option<RemoteBackend>,
    local: Option<LocalBackend>,
    make_local: LocalFactory,
}

impl FallbackBackend {
    pub fn new(remote: Option<RemoteBackend>, make_local: LocalFactory) -> Self {
        Self { remote, local: None, make_local }
    }

    fn local(&mut self) -> Result<&mut LocalBackend> {
        let local = match self.local.take() {
            Some(local) => local,
            None => {
                tracing::info!("Using in-process models");
                (self.make_local)()?
            }
        };
        Ok(self.local.insert(local))
    }

    /// Runs `op` against the daemon if present; on a daemon failure drops it
    /// and reruns `op` locally when `retry_locally` is set.
    fn route<T>(
        &mut self,
        retry_locally: bool,
        mut op: impl FnMut(&mut dyn AuthBackend) -> Result<T>,
    ) -> Result<T> {
        if let Some(remote) = self.remote.as_mut() {
            let remote: &mut dyn AuthBackend = remote;
            match op(remote) {
                Err(e) if e.is_daemon_failure() => {
                    tracing::warn!("Daemon failed, falling back to local models: {}", e);
                    self.remote = None;
                    if !retry_locally {
                        return Err(e);
                    }
                }
                other => return other,
            }
        }
        let local: &mut dyn AuthBackend = self.local()?;
        op(local)
    }
}

impl AuthBackend for FallbackBackend {
    fn name(&self) -> &'static str {
        if self.remote.is_some() {
            "daemon"
        } else {
            "local"
        }
    }

    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<LandmarkSet>> {
        self.route(true, |backend| backend.detect_faces(frame))
    }

    fn get_encoding(&mut self, frame: &Frame, landmarks: &LandmarkSet) -> Result<FaceDescriptor> {
        self.route(true, |backend| backend.get_encoding(frame, landmarks))
    }

    fn begin_attempt(&mut self, user: Option<&str>) -> Result<AttemptId> {
        self.route(true, |backend| backend.begin_attempt(user))
    }

    fn submit_frames(&mut self, attempt: AttemptId, frames: Vec<Frame>) -> Result<AttemptUpdate> {
        // Not retried, so `op` runs once.
        let mut frames = Some(frames);
        self.route(false, |backend| backend.submit_frames(attempt, frames.take().unwrap_or_default()))
    }

    fn cancel_attempt(&mut self, attempt: AttemptId) -> Result<()> {
        self.route(false, |backend| backend.cancel_attempt(attempt))
    }

    fn get_templates(&mut self, user: &str) -> Result<Vec<FaceDescriptor>> {
        self.route(true, |backend| backend.get_templates(user))
    }

    fn record_mismatch(&mut self, user: &str) -> Result<()> {
        self.route(false, |backend| backend.record_mismatch(user))
    }
}

/// Capability check at session start: a daemon that answers the handshake
/// is used, anything else means in-process models. A handshake refused by
/// whatever listens on the socket is logged and treated the same way.
pub fn select_backend(config: &Config, socket_path: &Path, make_local: LocalFactory) -> Result<FallbackBackend> {
    let remote = if config.daemon.enabled {
        match IpcClient::from_config(config, socket_path) {
            Ok(client) => Some(RemoteBackend::new(client)),
            Err(e) if e.is_daemon_failure() => {
                tracing::warn!("Daemon unavailable, using local models: {}", e);
                None
            }
            Err(e) => {
                tracing::warn!(socket = %socket_path.display(), "Daemon handshake refused, using local models: {}", e);
                None
            }
        }
    } else {
        None
    };
    Ok(FallbackBackend::new(remote, make_local))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FaceAuthError;
    use crate::core::synthetic::BlobFaceModel;
    use crate::service::protocol::{read_message, write_message, Request, Response};
    use std::os::unix::net::UnixListener;
    use std::time::SystemTime;

    fn local_factory() -> LocalFactory {
        Box::new(|| {
            let host = Arc::new(ModelHost::with_model(Arc::new(BlobFaceModel::new())));
            Ok(LocalBackend::new(&Config::default(), host))
        })
    }

    #[test]
    fn missing_daemon_selects_local() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = select_backend(&Config::default(), &dir.path().join("gone.sock"), local_factory()).unwrap();
        let frame = Frame::new(vec![10; 32 * 32], 32, 32, 0, SystemTime::now()).unwrap();
        assert!(backend.detect_faces(&frame).unwrap().is_empty());
        assert_eq!(backend.name(), "local");
    }

    #[test]
    fn disabled_daemon_is_not_contacted() {
        let mut config = Config::default();
        config.daemon.enabled = false;
        let backend = select_backend(&config, Path::new("/nonexistent/daemon.sock"), local_factory()).unwrap();
        assert!(backend.remote.is_none());
    }

    #[test]
    fn refused_handshake_selects_local() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("other.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _: Request = read_message(&mut stream).unwrap();
            write_message(&mut stream, &Response::from(FaceAuthError::PermissionDenied(1000))).unwrap();
        });

        let backend = select_backend(&Config::default(), &socket, local_factory()).unwrap();
        server.join().unwrap();
        assert!(backend.remote.is_none());
        assert_eq!(backend.name(), "local");
    }

    #[test]
    fn local_templates_come_from_the_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alice.json"), r#"[{"label": "Initial", "data": [[0.5, 0.25]]}]"#).unwrap();
        let mut config = Config::default();
        config.templates.dir = dir.path().to_path_buf();
        let host = Arc::new(ModelHost::with_model(Arc::new(BlobFaceModel::new())));
        let mut backend = LocalBackend::new(&config, host);

        assert_eq!(backend.get_templates("alice").unwrap(), vec![FaceDescriptor(vec![0.5, 0.25])]);
        assert!(matches!(backend.get_templates("bob"), Err(FaceAuthError::NotEnrolled(_))));
    }

    #[test]
    fn local_attempts_run_the_full_path() {
        let mut backend = (local_factory())().unwrap();
        let attempt = backend.begin_attempt(None).unwrap();
        let frame = Frame::new(vec![10; 32 * 32], 32, 32, 0, SystemTime::now()).unwrap();
        let update = backend.submit_frames(attempt, vec![frame]).unwrap();
        assert_eq!(update.frames_processed, 1);
        backend.cancel_attempt(attempt).unwrap();
    }
}
