use crate::common::{Config, FaceAuthError, Result};
use crate::common::config::SecurityConfig;
use crate::core::model::ModelHost;
use crate::core::types::Frame;
use crate::liveness::engine::{FailureKind, LivenessEngine, LivenessPhase, LivenessSettings, LivenessVerdict};
use crate::liveness::frequency::FrequencyAnalyzer;
use crate::pipeline::{CancelToken, FramePipeline, PipelineSettings};
use crate::service::lockout::LockoutTracker;
use crate::service::protocol::{AttemptId, AttemptUpdate, FrameDescriptor};
use crate::service::stats::StatsRegistry;
use crate::storage::attempt_log::{AttemptLog, AttemptRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct AttemptSettings {
    pub max_sessions: usize,
    /// Lifetime bound, and the idle time after which an attempt is expired.
    pub attempt_timeout: Duration,
    pub end_report: bool,
    pub security: SecurityConfig,
    pub pipeline: PipelineSettings,
}

impl AttemptSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_sessions: config.daemon.max_sessions,
            attempt_timeout: Duration::from_secs(config.video.timeout_secs),
            end_report: config.video.end_report,
            security: config.security.clone(),
            pipeline: PipelineSettings::from_config(config),
        }
    }
}

struct AttemptSession {
    engine: LivenessEngine,
    pipeline: FramePipeline,
    user: Option<String>,
    started: Instant,
    frames: usize,
    skipped: usize,
    snapshot: Option<Frame>,
}

struct AttemptEntry {
    token: CancelToken,
    last_activity: Mutex<Instant>,
    session: Mutex<AttemptSession>,
}

/// How long the verdict of a reaped attempt waits for its owner.
const CLOSED_RETENTION: Duration = Duration::from_secs(60);

fn update(
    attempt: AttemptId,
    verdict: LivenessVerdict,
    descriptors: Vec<FrameDescriptor>,
    frames_processed: usize,
    frames_skipped: usize,
) -> AttemptUpdate {
    let failure = match &verdict {
        LivenessVerdict::Reject { reason, .. } => Some(reason.failure_kind()),
        _ => None,
    };
    AttemptUpdate { attempt, verdict, descriptors, frames_processed, frames_skipped, failure }
}

/// Live authentication attempts held by the daemon.
pub struct AttemptRegistry {
    attempts: Mutex<HashMap<AttemptId, Arc<AttemptEntry>>>,
    /// Attempts the reaper ended, with their verdicts.
    closed: Mutex<HashMap<AttemptId, (Instant, LivenessVerdict)>>,
    next_id: AtomicU64,
    settings: AttemptSettings,
    host: Arc<ModelHost>,
    frequency: Arc<FrequencyAnalyzer>,
    stats: Arc<StatsRegistry>,
    lockout: LockoutTracker,
    /// Present only when failed attempts are saved.
    log: Option<AttemptLog>,
}

impl AttemptRegistry {
    pub fn new(
        settings: AttemptSettings,
        host: Arc<ModelHost>,
        stats: Arc<StatsRegistry>,
        log: Option<AttemptLog>,
    ) -> Self {
        let lockout = LockoutTracker::new(
            settings.security.max_failures,
            Duration::from_secs(settings.security.lockout_secs),
        );
        Self {
            attempts: Mutex::new(HashMap::new()),
            closed: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            settings,
            host,
            frequency: Arc::new(FrequencyAnalyzer::new()),
            stats,
            lockout,
            log,
        }
    }

    pub fn active(&self) -> usize {
        lock(&self.attempts).len()
    }

    /// Opens an attempt. With a `user`, a locked-out user is refused and
    /// liveness rejections count toward their lockout.
    pub fn begin(&self, user: Option<&str>) -> Result<AttemptId> {
        self.reap();
        if let Some(user) = user {
            if let Some(remaining) = self.lockout.locked_for(user) {
                self.stats.record_lockout_refused();
                tracing::warn!(user, remaining_secs = remaining.as_secs(), "Attempt refused, user locked out");
                return Err(FaceAuthError::LockedOut {
                    user: user.to_string(),
                    remaining_secs: remaining.as_secs().max(1),
                });
            }
        }
        if self.active() >= self.settings.max_sessions {
            return Err(FaceAuthError::Busy(self.settings.max_sessions));
        }

        let model = self.host.model()?;
        let pipeline = FramePipeline::new(model, Arc::clone(&self.frequency), self.settings.pipeline.clone())?;
        let workers = pipeline.worker_threads();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let liveness = LivenessSettings::from_config(&self.settings.security, rand::random());
        let engine = LivenessEngine::new(id, liveness);

        let now = Instant::now();
        let entry = Arc::new(AttemptEntry {
            token: pipeline.cancel_token(),
            last_activity: Mutex::new(now),
            session: Mutex::new(AttemptSession {
                engine,
                pipeline,
                user: user.map(str::to_string),
                started: now,
                frames: 0,
                skipped: 0,
                snapshot: None,
            }),
        });

        {
            let mut attempts = lock(&self.attempts);
            if attempts.len() >= self.settings.max_sessions {
                return Err(FaceAuthError::Busy(self.settings.max_sessions));
            }
            attempts.insert(id, entry);
        }
        self.stats.session_opened();
        tracing::info!(attempt_id = id, user = user.unwrap_or("-"), workers, "Attempt started");
        Ok(id)
    }

    fn entry(&self, id: AttemptId) -> Result<Arc<AttemptEntry>> {
        lock(&self.attempts).get(&id).cloned().ok_or(FaceAuthError::UnknownAttempt(id))
    }

    /// Runs a batch through the attempt's pipeline and liveness engine.
    /// Frames after a terminal verdict are not evaluated. An attempt the
    /// reaper ended reports its verdict to the next submit, once.
    pub fn submit(&self, id: AttemptId, frames: Vec<Frame>) -> Result<AttemptUpdate> {
        let entry = match self.entry(id) {
            Ok(entry) => entry,
            Err(e) => {
                return match lock(&self.closed).remove(&id) {
                    Some((_, verdict)) => Ok(update(id, verdict, Vec::new(), 0, 0)),
                    None => Err(e),
                }
            }
        };
        *lock(&entry.last_activity) = Instant::now();
        let mut session = lock(&entry.session);

        let mut descriptors = Vec::new();
        let mut processed = 0;
        let mut skipped = 0;
        if !session.engine.verdict().is_terminal() {
            let results = session.pipeline.process_batch(frames)?;
            for result in results {
                processed += 1;
                session.frames += 1;
                if result.skipped {
                    skipped += 1;
                    session.skipped += 1;
                    if session.snapshot.is_none() {
                        session.snapshot = Some(result.frame);
                    }
                    continue;
                }
                let verdict = session.engine.observe(result.observation())?;
                if let Some(descriptor) = result.descriptor {
                    descriptors.push(FrameDescriptor { sequence: result.sequence, descriptor });
                }
                if result.landmarks.is_some() || session.snapshot.is_none() {
                    session.snapshot = Some(result.frame);
                }
                if verdict.is_terminal() {
                    break;
                }
            }
        }
        if skipped > 0 {
            self.stats.record_frames_skipped(skipped);
        }

        if !session.engine.verdict().is_terminal() && session.started.elapsed() > self.settings.attempt_timeout {
            session.engine.finish();
        }

        let verdict = session.engine.verdict();
        if verdict.is_terminal() {
            self.finalize(id, &entry, &mut session, &verdict);
        }
        Ok(update(id, verdict, descriptors, processed, skipped))
    }

    /// Ends an attempt without logging it as a failure. Cancelling an
    /// attempt the reaper already ended succeeds.
    pub fn cancel(&self, id: AttemptId) -> Result<()> {
        let Some(entry) = lock(&self.attempts).remove(&id) else {
            return match lock(&self.closed).remove(&id) {
                Some(_) => Ok(()),
                None => Err(FaceAuthError::UnknownAttempt(id)),
            };
        };
        // Unblocks a submit stuck waiting for slots before we take the lock.
        entry.token.cancel();
        let mut session = lock(&entry.session);
        session.pipeline.cancel();
        session.engine.cancel();
        session.snapshot = None;
        self.stats.session_closed();
        tracing::info!(attempt_id = id, "Attempt cancelled");
        Ok(())
    }

    pub fn cancel_all(&self) {
        let ids: Vec<AttemptId> = lock(&self.attempts).keys().copied().collect();
        for id in ids {
            let _ = self.cancel(id);
        }
        lock(&self.closed).clear();
    }

    /// A failed match reported by the caller. Counts toward lockout.
    pub fn record_mismatch(&self, user: &str) -> Result<()> {
        if user.is_empty() {
            return Err(FaceAuthError::InvalidRequest("empty user name".into()));
        }
        tracing::info!(user, "Recognition failed");
        self.lockout.record_failure(user);
        Ok(())
    }

    /// One reaper pass: idle attempts, overdue challenges, stale verdicts.
    pub fn reap(&self) -> usize {
        let expired = self.expire_idle() + self.expire_challenges(SystemTime::now());
        lock(&self.closed).retain(|_, (closed_at, _)| closed_at.elapsed() < CLOSED_RETENTION);
        expired
    }

    fn snapshot_entries(&self) -> Vec<(AttemptId, Arc<AttemptEntry>)> {
        lock(&self.attempts).iter().map(|(id, entry)| (*id, Arc::clone(entry))).collect()
    }

    /// Expires attempts idle past the attempt timeout with the verdict the
    /// engine reaches on running out of input. Attempts busy in a submit are
    /// not idle and are skipped.
    pub fn expire_idle(&self) -> usize {
        let mut expired = 0;
        for (id, entry) in self.snapshot_entries() {
            if lock(&entry.last_activity).elapsed() <= self.settings.attempt_timeout {
                continue;
            }
            let Ok(mut session) = entry.session.try_lock() else {
                continue;
            };
            let verdict = session.engine.finish();
            if self.close(id, &entry, &mut session, verdict) {
                tracing::info!(attempt_id = id, "Attempt expired");
                expired += 1;
            }
        }
        expired
    }

    /// Rejects attempts whose pending challenge deadline passed while the
    /// client sent nothing.
    pub fn expire_challenges(&self, now: SystemTime) -> usize {
        let mut expired = 0;
        for (id, entry) in self.snapshot_entries() {
            let Ok(mut session) = entry.session.try_lock() else {
                continue;
            };
            if session.engine.phase() != LivenessPhase::AwaitingResponse {
                continue;
            }
            let verdict = session.engine.expire(now);
            if verdict.is_terminal() && self.close(id, &entry, &mut session, verdict) {
                tracing::info!(attempt_id = id, "Challenge expired");
                expired += 1;
            }
        }
        expired
    }

    fn close(&self, id: AttemptId, entry: &Arc<AttemptEntry>, session: &mut AttemptSession, verdict: LivenessVerdict) -> bool {
        entry.token.cancel();
        session.pipeline.cancel();
        if !self.finalize(id, entry, session, &verdict) {
            return false;
        }
        lock(&self.closed).insert(id, (Instant::now(), verdict));
        true
    }

    /// Removes a finished attempt. False if someone else already did.
    fn finalize(&self, id: AttemptId, entry: &Arc<AttemptEntry>, session: &mut AttemptSession, verdict: &LivenessVerdict) -> bool {
        {
            let mut attempts = lock(&self.attempts);
            match attempts.get(&id) {
                Some(current) if Arc::ptr_eq(current, entry) => {
                    attempts.remove(&id);
                }
                _ => return false,
            }
        }
        self.stats.session_closed();

        if let LivenessVerdict::Reject { reason, .. } = verdict {
            self.stats.record_attempt_rejected();
            if let (Some(user), FailureKind::LivenessFailed) = (&session.user, reason.failure_kind()) {
                self.lockout.record_failure(user);
            }
            if let Some(log) = &self.log {
                log.record(AttemptRecord {
                    attempt_id: id,
                    reason: *reason,
                    frames: session.frames,
                    finished_at: SystemTime::now(),
                    snapshot: session.snapshot.take(),
                });
            }
        }

        if self.settings.end_report {
            let scan_time = session.started.elapsed();
            let fps = session.frames as f32 / scan_time.as_secs_f32().max(f32::EPSILON);
            let passive = session.engine.passive_scores();
            tracing::info!(
                attempt_id = id,
                frames = session.frames,
                skipped = session.skipped,
                scan_time_ms = scan_time.as_millis() as u64,
                fps,
                frequency = ?passive.and_then(|p| p.frequency),
                temporal = ?passive.and_then(|p| p.temporal),
                outcome = verdict.label(),
                "End report"
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::synthetic::BlobFaceModel;
    use crate::liveness::engine::RejectReason;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::fs;

    fn config(max_sessions: usize) -> Config {
        let mut config = Config::default();
        config.daemon.max_sessions = max_sessions;
        config.pipeline.max_workers = 2;
        config
    }

    /// Passive analysis off so a full window always earns a challenge.
    fn challenge_config(challenge_timeout_secs: f32) -> Config {
        let mut config = config(2);
        config.security.frequency_analysis = false;
        config.security.temporal_analysis = false;
        config.security.challenge_timeout_secs = challenge_timeout_secs;
        config.security.challenge_seed = Some(5);
        config
    }

    fn registry_with(config: &Config, timeout: Duration, log: Option<AttemptLog>, stats: Arc<StatsRegistry>) -> AttemptRegistry {
        let host = Arc::new(ModelHost::with_model(Arc::new(BlobFaceModel::new())));
        let mut settings = AttemptSettings::from_config(config);
        settings.attempt_timeout = timeout;
        AttemptRegistry::new(settings, host, stats, log)
    }

    fn registry(max_sessions: usize, timeout: Duration, log: Option<AttemptLog>, stats: Arc<StatsRegistry>) -> AttemptRegistry {
        registry_with(&config(max_sessions), timeout, log, stats)
    }

    fn dark_frame(sequence: u64) -> Frame {
        Frame::new(vec![10; 64 * 48], 64, 48, sequence, SystemTime::now()).unwrap()
    }

    /// A bright noisy square on a noisy dark background.
    fn face_frame(rng: &mut StdRng, sequence: u64) -> Frame {
        let data = (0..64u32 * 48)
            .map(|i| {
                let (x, y) = (i % 64, i / 64);
                let base: u8 = if (16..48).contains(&x) && (8..40).contains(&y) { 180 } else { 20 };
                base + rng.gen_range(0..12)
            })
            .collect();
        Frame::new(data, 64, 48, sequence, SystemTime::now()).unwrap()
    }

    fn face_frames(count: u64) -> Vec<Frame> {
        let mut rng = StdRng::seed_from_u64(9);
        (1..=count).map(|i| face_frame(&mut rng, i)).collect()
    }

    #[test]
    fn session_limit_reports_busy() {
        let stats = Arc::new(StatsRegistry::new());
        let registry = registry(2, Duration::from_secs(8), None, stats.clone());
        registry.begin(None).unwrap();
        registry.begin(None).unwrap();
        assert!(matches!(registry.begin(None), Err(FaceAuthError::Busy(2))));
        assert_eq!(stats.active_sessions(), 2);
    }

    #[test]
    fn unknown_attempt_is_reported() {
        let registry = registry(2, Duration::from_secs(8), None, Arc::new(StatsRegistry::new()));
        assert!(matches!(registry.submit(99, vec![]), Err(FaceAuthError::UnknownAttempt(99))));
        assert!(matches!(registry.cancel(99), Err(FaceAuthError::UnknownAttempt(99))));
    }

    #[test]
    fn cancel_closes_without_logging_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(StatsRegistry::new());
        let log = AttemptLog::start(dir.path(), 4, stats.clone()).unwrap();
        let registry = registry(2, Duration::from_secs(8), Some(log), stats.clone());

        let id = registry.begin(None).unwrap();
        registry.submit(id, vec![dark_frame(0), dark_frame(1)]).unwrap();
        registry.cancel(id).unwrap();

        assert_eq!(registry.active(), 0);
        assert_eq!(stats.snapshot()["active_sessions"], 0);
        assert_eq!(stats.snapshot()["attempts_rejected"], 0);
        drop(registry);
        assert!(!dir.path().join("attempts.log").exists());
    }

    #[test]
    fn dark_frames_are_skipped_but_counted() {
        let stats = Arc::new(StatsRegistry::new());
        let registry = registry(2, Duration::from_secs(8), None, stats.clone());
        let id = registry.begin(None).unwrap();

        let update = registry.submit(id, vec![dark_frame(0), dark_frame(1), dark_frame(2)]).unwrap();
        assert_eq!(update.frames_processed, 3);
        assert_eq!(update.frames_skipped, 3);
        assert!(matches!(update.verdict, LivenessVerdict::Indeterminate { .. }));
        assert_eq!(stats.snapshot()["frames_skipped"], 3);
    }

    #[test]
    fn faceless_idle_attempts_expire_as_no_face() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(StatsRegistry::new());
        let log = AttemptLog::start(dir.path(), 4, stats.clone()).unwrap();
        let registry = registry(2, Duration::from_millis(200), Some(log), stats.clone());

        let id = registry.begin(None).unwrap();
        registry.submit(id, vec![dark_frame(0)]).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(registry.expire_idle(), 1);
        assert_eq!(registry.active(), 0);

        // The owner learns the verdict once, then the id is gone.
        let update = registry.submit(id, vec![dark_frame(1)]).unwrap();
        assert_eq!(
            update.verdict,
            LivenessVerdict::Reject { reason: RejectReason::NoFaceDetected, confidence: 0.0 }
        );
        assert_eq!(update.failure, Some(FailureKind::NoFaceDetected));
        assert!(matches!(registry.submit(id, vec![dark_frame(2)]), Err(FaceAuthError::UnknownAttempt(_))));

        drop(registry);
        let contents = fs::read_to_string(dir.path().join("attempts.log")).unwrap();
        assert!(contents.contains("\"reason\":\"no_face_detected\""));
    }

    #[test]
    fn idle_attempts_with_a_face_expire_as_timed_out() {
        let registry = registry(2, Duration::from_millis(200), None, Arc::new(StatsRegistry::new()));
        let id = registry.begin(None).unwrap();
        let update = registry.submit(id, face_frames(1)).unwrap();
        assert_eq!(update.frames_skipped, 0);

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(registry.reap(), 1);
        let update = registry.submit(id, vec![]).unwrap();
        assert!(matches!(update.verdict, LivenessVerdict::Reject { reason: RejectReason::TimedOut, .. }));
    }

    #[test]
    fn unanswered_challenge_expires_on_the_wall_clock() {
        let stats = Arc::new(StatsRegistry::new());
        let registry = registry_with(&challenge_config(0.5), Duration::from_secs(60), None, stats.clone());
        let id = registry.begin(None).unwrap();

        let update = registry.submit(id, face_frames(15)).unwrap();
        assert!(matches!(update.verdict, LivenessVerdict::Challenge { round: 1, .. }), "{:?}", update.verdict);
        // Deadline not reached yet.
        assert_eq!(registry.expire_challenges(SystemTime::now()), 0);

        std::thread::sleep(Duration::from_millis(800));
        assert_eq!(registry.reap(), 1);
        assert_eq!(registry.active(), 0);
        assert_eq!(stats.snapshot()["attempts_rejected"], 1);

        let update = registry.submit(id, vec![]).unwrap();
        assert!(matches!(update.verdict, LivenessVerdict::Reject { reason: RejectReason::ChallengeTimeout, .. }));
        assert_eq!(update.failure, Some(FailureKind::LivenessFailed));
    }

    #[test]
    fn cancel_after_expiry_is_accepted() {
        let registry = registry(2, Duration::from_millis(100), None, Arc::new(StatsRegistry::new()));
        let id = registry.begin(None).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(registry.reap(), 1);
        registry.cancel(id).unwrap();
        assert!(matches!(registry.cancel(id), Err(FaceAuthError::UnknownAttempt(_))));
    }

    #[test]
    fn liveness_failures_lock_the_user_out() {
        let mut config = challenge_config(0.5);
        config.security.max_failures = 1;
        let stats = Arc::new(StatsRegistry::new());
        let registry = registry_with(&config, Duration::from_secs(60), None, stats.clone());

        let id = registry.begin(Some("carol")).unwrap();
        registry.submit(id, face_frames(15)).unwrap();
        std::thread::sleep(Duration::from_millis(800));
        assert_eq!(registry.expire_challenges(SystemTime::now()), 1);

        assert!(matches!(registry.begin(Some("carol")), Err(FaceAuthError::LockedOut { .. })));
        registry.begin(Some("dave")).unwrap();
        registry.begin(None).unwrap();
        assert_eq!(stats.snapshot()["lockouts_refused"], 1);
    }

    #[test]
    fn reported_mismatches_count_toward_lockout() {
        let mut config = config(2);
        config.security.max_failures = 2;
        let registry = registry_with(&config, Duration::from_secs(8), None, Arc::new(StatsRegistry::new()));

        registry.record_mismatch("erin").unwrap();
        registry.begin(Some("erin")).map(|id| registry.cancel(id)).unwrap().unwrap();
        registry.record_mismatch("erin").unwrap();
        match registry.begin(Some("erin")) {
            Err(FaceAuthError::LockedOut { remaining_secs, .. }) => assert!(remaining_secs > 0),
            other => panic!("expected lockout, got {:?}", other.map(|_| ())),
        }
        assert!(matches!(registry.record_mismatch(""), Err(FaceAuthError::InvalidRequest(_))));
    }

    #[test]
    fn other_attempts_are_untouched_by_a_cancel() {
        let stats = Arc::new(StatsRegistry::new());
        let registry = registry(4, Duration::from_secs(8), None, stats.clone());
        let keep = registry.begin(None).unwrap();
        let drop_me = registry.begin(None).unwrap();

        registry.cancel(drop_me).unwrap();
        let update = registry.submit(keep, vec![dark_frame(0)]).unwrap();
        assert_eq!(update.frames_processed, 1);
        assert_eq!(stats.active_sessions(), 1);
    }
}
