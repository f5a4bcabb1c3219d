use crate::common::{Config, FaceAuthError, Result};
use crate::core::model::ModelHost;
use crate::service::attempts::AttemptRegistry;
use crate::service::protocol::{read_message, write_message, DaemonStatus, Request, Response};
use crate::service::stats::StatsRegistry;
use crate::storage::templates::TemplateCache;
use anyhow::Context as _;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const REAPER_TICK: Duration = Duration::from_millis(250);
const REFUSE_READ_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct PeerCredentials {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

pub fn peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    use std::mem;
    use std::os::unix::io::AsRawFd;

    #[repr(C)]
    struct UCred {
        pid: libc::pid_t,
        uid: libc::uid_t,
        gid: libc::gid_t,
    }

    unsafe {
        let mut cred: UCred = mem::zeroed();
        let mut cred_len = mem::size_of::<UCred>() as libc::socklen_t;

        let ret = libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut cred_len,
        );

        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(PeerCredentials {
            pid: cred.pid as u32,
            uid: cred.uid as u32,
            gid: cred.gid as u32,
        })
    }
}

/// Who may talk to the daemon, and who may stop it.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    allowed_uids: Vec<u32>,
    daemon_uid: u32,
    dev_mode: bool,
}

impl AccessPolicy {
    pub fn new(allowed_uids: Vec<u32>, dev_mode: bool) -> Self {
        let daemon_uid = unsafe { libc::geteuid() } as u32;
        Self { allowed_uids, daemon_uid, dev_mode }
    }

    pub fn allows(&self, uid: u32) -> bool {
        uid == 0 || self.allowed_uids.contains(&uid) || (self.dev_mode && uid == self.daemon_uid)
    }

    pub fn may_shutdown(&self, uid: u32) -> bool {
        uid == 0 || (self.dev_mode && uid == self.daemon_uid)
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub socket_path: PathBuf,
    /// Model requests served at once. Other requests never wait for these.
    pub workers: usize,
    /// Open connections beyond this are answered `Busy` and closed.
    pub max_connections: usize,
    /// Connections silent for this long are closed.
    pub idle_timeout: Duration,
    pub access: AccessPolicy,
}

impl ServerOptions {
    pub fn from_config(config: &Config, socket_path: PathBuf, dev_mode: bool) -> Self {
        Self {
            socket_path,
            workers: config.daemon.workers,
            max_connections: config.daemon.max_connections,
            idle_timeout: Duration::from_secs(config.daemon.idle_timeout_secs),
            access: AccessPolicy::new(config.daemon.allowed_uids.clone(), dev_mode),
        }
    }
}

/// Stops a running server from another thread or a signal handler.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    socket_path: PathBuf,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            tracing::info!("Shutdown requested");
            // Wake the accept loop.
            let _ = UnixStream::connect(&self.socket_path);
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Counting gate over model work shared by every connection.
struct WorkGate {
    busy: Mutex<usize>,
    limit: usize,
    freed: Condvar,
}

struct WorkPermit<'a> {
    gate: &'a WorkGate,
}

impl WorkGate {
    fn new(limit: usize) -> Self {
        Self { busy: Mutex::new(0), limit: limit.max(1), freed: Condvar::new() }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self) -> WorkPermit<'_> {
        let mut busy = self.lock();
        while *busy >= self.limit {
            busy = self.freed.wait(busy).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *busy += 1;
        WorkPermit { gate: self }
    }

    fn in_use(&self) -> usize {
        *self.lock()
    }
}

impl Drop for WorkPermit<'_> {
    fn drop(&mut self) {
        let mut busy = self.gate.lock();
        *busy = busy.saturating_sub(1);
        self.gate.freed.notify_one();
    }
}

struct ServerContext {
    host: Arc<ModelHost>,
    stats: Arc<StatsRegistry>,
    attempts: Arc<AttemptRegistry>,
    templates: Arc<TemplateCache>,
    work: WorkGate,
    access: AccessPolicy,
    idle_timeout: Duration,
    shutdown: ShutdownHandle,
    next_connection: AtomicU64,
    /// Read halves of open connections, closed on shutdown to unblock idle readers.
    connections: Mutex<HashMap<u64, UnixStream>>,
}

impl ServerContext {
    fn track(&self, id: u64, stream: &UnixStream) {
        match stream.try_clone() {
            Ok(clone) => {
                self.connections.lock().unwrap_or_else(|p| p.into_inner()).insert(id, clone);
            }
            Err(e) => tracing::warn!(connection = id, "Could not track connection: {}", e),
        }
    }

    fn untrack(&self, id: u64) {
        self.connections.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
    }

    fn close_idle_readers(&self) {
        for stream in self.connections.lock().unwrap_or_else(|p| p.into_inner()).values() {
            let _ = stream.shutdown(Shutdown::Read);
        }
    }

    fn handle_connection(&self, id: u64, mut stream: UnixStream) {
        let peer = match peer_credentials(&stream) {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!("Could not read peer credentials: {}", e);
                return;
            }
        };
        if !self.access.allows(peer.uid) {
            tracing::warn!(uid = peer.uid, pid = peer.pid, "Rejected connection");
            self.stats.record_failure();
            let _ = write_message(&mut stream, &Response::from(FaceAuthError::PermissionDenied(peer.uid)));
            return;
        }
        tracing::debug!(uid = peer.uid, pid = peer.pid, gid = peer.gid, "Connection accepted");

        if let Err(e) = stream
            .set_read_timeout(Some(self.idle_timeout))
            .and_then(|_| stream.set_write_timeout(Some(WRITE_TIMEOUT)))
        {
            tracing::warn!("Failed to set socket timeouts: {}", e);
            return;
        }

        self.track(id, &stream);
        while !self.shutdown.is_triggered() {
            let request: Request = match read_message(&mut stream) {
                Ok(request) => request,
                Err(FaceAuthError::Io(e)) => {
                    match e.kind() {
                        io::ErrorKind::UnexpectedEof => {}
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                            tracing::debug!(uid = peer.uid, "Closing idle connection");
                        }
                        _ => tracing::warn!(uid = peer.uid, "Connection read failed: {}", e),
                    }
                    break;
                }
                Err(e) => {
                    self.stats.record_invalid();
                    tracing::warn!(uid = peer.uid, "Bad request: {}", e);
                    if write_message(&mut stream, &Response::from(e)).is_err() {
                        break;
                    }
                    continue;
                }
            };

            let stopping = matches!(request, Request::Shutdown);
            let response = self.dispatch(request, peer);
            let acknowledged = matches!(response, Response::Ack);
            if let Err(e) = write_message(&mut stream, &response) {
                tracing::warn!(uid = peer.uid, "Failed to send response: {}", e);
                break;
            }
            if stopping && acknowledged {
                self.shutdown.trigger();
                break;
            }
        }
        self.untrack(id);
    }

    fn dispatch(&self, request: Request, peer: PeerCredentials) -> Response {
        let name = request.name();
        let counted = !request.is_observability();
        let started = Instant::now();
        let _permit = request.needs_worker().then(|| self.work.acquire());

        let result = match request {
            Request::Ping => Ok(Response::Pong),
            Request::GetStats => Ok(Response::Stats(self.stats.snapshot())),
            Request::Status => Ok(Response::Status(DaemonStatus {
                running: !self.shutdown.is_triggered(),
                uptime_secs: self.stats.uptime_secs(),
                model_loaded: self.host.is_loaded(),
            })),
            Request::Shutdown => {
                if self.access.may_shutdown(peer.uid) {
                    Ok(Response::Ack)
                } else {
                    Err(FaceAuthError::PermissionDenied(peer.uid))
                }
            }
            Request::GetEncoding(req) => self.host.get_encoding(&req.frame, &req.landmarks).map(|descriptor| {
                self.stats.record_encoding();
                Response::Encoding(descriptor)
            }),
            Request::DetectFaces { frame } => self.host.detect(&frame).map(Response::Faces),
            Request::BeginAttempt { user } => self.attempts.begin(user.as_deref()).map(Response::AttemptStarted),
            Request::SubmitFrames { attempt, frames } => {
                self.attempts.submit(attempt, frames).map(Response::AttemptUpdate)
            }
            Request::CancelAttempt { attempt } => self.attempts.cancel(attempt).map(|_| Response::Ack),
            Request::GetTemplates { user } => {
                self.templates.get(&user).map(|templates| Response::Templates(templates.as_ref().clone()))
            }
            Request::InvalidateTemplates { user } => self.templates.invalidate(&user).map(|_| Response::Ack),
            Request::RecordMismatch { user } => self.attempts.record_mismatch(&user).map(|_| Response::Ack),
        };

        match result {
            Ok(response) => {
                if counted {
                    self.stats.record_served();
                }
                tracing::debug!(
                    request = name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    busy_workers = self.work.in_use(),
                    "Request served"
                );
                response
            }
            Err(e) => {
                match &e {
                    FaceAuthError::InvalidRequest(_) => self.stats.record_invalid(),
                    FaceAuthError::AttemptCancelled
                    | FaceAuthError::LockedOut { .. }
                    | FaceAuthError::NotEnrolled(_) => {}
                    _ => self.stats.record_failure(),
                }
                tracing::warn!(request = name, uid = peer.uid, "Request failed: {}", e);
                Response::from(e)
            }
        }
    }
}

pub struct IpcServer {
    listener: UnixListener,
    options: ServerOptions,
    context: Arc<ServerContext>,
}

impl IpcServer {
    /// Binds the socket (mode 0600), replacing a stale one.
    pub fn bind(
        options: ServerOptions,
        host: Arc<ModelHost>,
        stats: Arc<StatsRegistry>,
        attempts: Arc<AttemptRegistry>,
        templates: Arc<TemplateCache>,
    ) -> Result<Self> {
        let path = options.socket_path.as_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind {}", path.display()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        tracing::info!("Listening on {}", path.display());

        let context = Arc::new(ServerContext {
            host,
            stats,
            attempts,
            templates,
            work: WorkGate::new(options.workers),
            access: options.access.clone(),
            idle_timeout: options.idle_timeout,
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                socket_path: options.socket_path.clone(),
            },
            next_connection: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
        });

        Ok(Self { listener, options, context })
    }

    pub fn socket_path(&self) -> &Path {
        &self.options.socket_path
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.context.shutdown.clone()
    }

    /// Serves until shutdown, then drains in-flight requests, cancels open
    /// attempts and removes the socket. Each connection gets its own thread.
    pub fn serve(self) -> Result<()> {
        let reaper_context = Arc::clone(&self.context);
        let reaper = thread::Builder::new()
            .name("faceguard-reaper".into())
            .spawn(move || {
                while !reaper_context.shutdown.is_triggered() {
                    thread::sleep(REAPER_TICK);
                    reaper_context.attempts.reap();
                }
            })?;

        let limit = self.options.max_connections.max(1);
        let mut connections: Vec<JoinHandle<()>> = Vec::new();
        for stream in self.listener.incoming() {
            if self.context.shutdown.is_triggered() {
                break;
            }
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!("Connection error: {}", e);
                    continue;
                }
            };

            connections.retain(|handle| !handle.is_finished());
            if connections.len() >= limit {
                tracing::warn!(limit, "Connection limit reached, refusing client");
                // Answer the client's first request so it sees Busy rather than a reset.
                let _ = stream.set_read_timeout(Some(REFUSE_READ_TIMEOUT));
                let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));
                let _ = read_message::<_, Request>(&mut stream);
                let _ = write_message(&mut stream, &Response::from(FaceAuthError::Busy(limit)));
                continue;
            }

            let id = self.context.next_connection.fetch_add(1, Ordering::Relaxed);
            let context = Arc::clone(&self.context);
            match thread::Builder::new()
                .name(format!("faceguard-conn-{}", id))
                .spawn(move || context.handle_connection(id, stream))
            {
                Ok(handle) => connections.push(handle),
                Err(e) => tracing::error!("Failed to spawn connection thread: {}", e),
            }
        }

        tracing::info!(open = connections.len(), "Draining connections");
        self.context.close_idle_readers();
        for handle in connections {
            let _ = handle.join();
        }
        let _ = reaper.join();
        self.context.attempts.cancel_all();

        if self.options.socket_path.exists() {
            fs::remove_file(&self.options.socket_path)?;
        }
        tracing::info!("Daemon stopped");
        Ok(())
    }
}
