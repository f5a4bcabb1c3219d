use crate::common::config::{SecurityConfig, SecurityLevel};
use crate::common::{FaceAuthError, Result};
use crate::core::types::LandmarkSet;
use crate::liveness::challenge::{ChallengeDetector, ChallengeKind, ChallengeResponse, ChallengeSelector};
use crate::liveness::temporal::TemporalAnalyzer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Consecutive face-less frames tolerated while a challenge is pending.
const FACE_LOST_FRAMES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    FrequencyAnalysis,
    TemporalAnalysis,
    LowConfidence,
    ChallengeTimeout,
    ChallengeFailed,
    FaceLost,
    NoFaceDetected,
    TimedOut,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::FrequencyAnalysis => "frequency_analysis",
            RejectReason::TemporalAnalysis => "temporal_analysis",
            RejectReason::LowConfidence => "low_confidence",
            RejectReason::ChallengeTimeout => "challenge_timeout",
            RejectReason::ChallengeFailed => "challenge_failed",
            RejectReason::FaceLost => "face_lost",
            RejectReason::NoFaceDetected => "no_face_detected",
            RejectReason::TimedOut => "timed_out",
        }
    }

    pub fn failure_kind(self) -> FailureKind {
        match self {
            RejectReason::NoFaceDetected => FailureKind::NoFaceDetected,
            _ => FailureKind::LivenessFailed,
        }
    }
}

/// What the user is told. Scores never leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    NoFaceDetected,
    LivenessFailed,
    NotRecognized,
}

impl FailureKind {
    pub fn message(self) -> &'static str {
        match self {
            FailureKind::NoFaceDetected => "no face detected",
            FailureKind::LivenessFailed => "liveness check failed",
            FailureKind::NotRecognized => "face not recognized",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LivenessVerdict {
    /// Not enough frames with a face yet.
    Indeterminate { frames_needed: usize },
    /// A challenge is pending; the user must perform `kind`.
    Challenge { kind: ChallengeKind, round: u32 },
    Accept { confidence: f32 },
    Reject { reason: RejectReason, confidence: f32 },
    Cancelled,
}

impl LivenessVerdict {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LivenessVerdict::Accept { .. } | LivenessVerdict::Reject { .. } | LivenessVerdict::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            LivenessVerdict::Indeterminate { .. } => "indeterminate",
            LivenessVerdict::Challenge { .. } => "challenge",
            LivenessVerdict::Accept { .. } => "accept",
            LivenessVerdict::Reject { .. } => "reject",
            LivenessVerdict::Cancelled => "cancelled",
        }
    }
}

/// One frame's worth of liveness input.
#[derive(Debug, Clone)]
pub struct Observation {
    pub sequence: u64,
    pub timestamp: SystemTime,
    /// Best face in the frame, if any.
    pub landmarks: Option<LandmarkSet>,
    /// Frequency spoof score for that face, computed upstream.
    pub moire_score: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct LivenessSettings {
    pub enabled: bool,
    pub level: SecurityLevel,
    pub active_challenge: bool,
    pub frequency_analysis: bool,
    pub temporal_analysis: bool,
    pub window: usize,
    pub challenge_timeout: Duration,
    pub challenge_rounds: u32,
    pub seed: u64,
    pub moire_threshold: f32,
    pub motion_threshold: f32,
}

impl LivenessSettings {
    /// `fallback_seed` is used when the config does not pin one.
    pub fn from_config(security: &SecurityConfig, fallback_seed: u64) -> Self {
        Self {
            enabled: security.liveness_check,
            level: security.security_level,
            active_challenge: security.active_challenge,
            frequency_analysis: security.frequency_analysis,
            // high never decides without motion evidence
            temporal_analysis: security.temporal_analysis || security.security_level == SecurityLevel::High,
            window: security.passive_window,
            challenge_timeout: Duration::from_secs_f32(security.challenge_timeout_secs),
            challenge_rounds: security.challenge_rounds.max(1),
            seed: security.challenge_seed.unwrap_or(fallback_seed),
            moire_threshold: security.moire_threshold,
            motion_threshold: security.motion_threshold,
        }
    }
}

/// Receives user prompts when a challenge is issued.
pub trait ChallengeNotifier: Send + Sync {
    fn prompt(&self, attempt_id: u64, kind: ChallengeKind, round: u32);
}

/// Writes prompts to the log; the client shows them from the verdict.
pub struct LogNotifier;

impl ChallengeNotifier for LogNotifier {
    fn prompt(&self, attempt_id: u64, kind: ChallengeKind, round: u32) {
        tracing::info!(attempt_id, challenge = kind.as_str(), round, "{}", kind.prompt());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessPhase {
    Init,
    PassiveCollect,
    AwaitingResponse,
    Terminal,
}

/// Scores behind the passive decision, kept for logs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PassiveScores {
    pub frequency: Option<f32>,
    pub temporal: Option<f32>,
    pub confidence: f32,
}

enum LivenessState {
    Init,
    PassiveCollect {
        landmarks: Vec<LandmarkSet>,
        moire: Vec<f32>,
    },
    AwaitingResponse {
        detector: ChallengeDetector,
        deadline: SystemTime,
        round: u32,
        confidence: f32,
        missing: u32,
    },
    Terminal(LivenessVerdict),
}

/// Per-attempt liveness state machine. Owned by exactly one attempt.
pub struct LivenessEngine {
    attempt_id: u64,
    settings: LivenessSettings,
    state: LivenessState,
    selector: ChallengeSelector,
    notifier: Arc<dyn ChallengeNotifier>,
    temporal: TemporalAnalyzer,
    last_sequence: Option<u64>,
    faces_seen: usize,
    passive: Option<PassiveScores>,
}

impl LivenessEngine {
    pub fn new(attempt_id: u64, settings: LivenessSettings) -> Self {
        let selector = ChallengeSelector::new(settings.seed);
        Self {
            attempt_id,
            settings,
            state: LivenessState::Init,
            selector,
            notifier: Arc::new(LogNotifier),
            temporal: TemporalAnalyzer::new(),
            last_sequence: None,
            faces_seen: 0,
            passive: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ChallengeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn passive_scores(&self) -> Option<PassiveScores> {
        self.passive
    }

    pub fn phase(&self) -> LivenessPhase {
        match self.state {
            LivenessState::Init => LivenessPhase::Init,
            LivenessState::PassiveCollect { .. } => LivenessPhase::PassiveCollect,
            LivenessState::AwaitingResponse { .. } => LivenessPhase::AwaitingResponse,
            LivenessState::Terminal(_) => LivenessPhase::Terminal,
        }
    }

    pub fn verdict(&self) -> LivenessVerdict {
        match &self.state {
            LivenessState::Init => LivenessVerdict::Indeterminate { frames_needed: self.settings.window },
            LivenessState::PassiveCollect { landmarks, .. } => LivenessVerdict::Indeterminate {
                frames_needed: self.settings.window.saturating_sub(landmarks.len()),
            },
            LivenessState::AwaitingResponse { detector, round, .. } => {
                LivenessVerdict::Challenge { kind: detector.kind(), round: *round }
            }
            LivenessState::Terminal(verdict) => verdict.clone(),
        }
    }

    pub fn observe(&mut self, observation: Observation) -> Result<LivenessVerdict> {
        if let LivenessState::Terminal(verdict) = &self.state {
            return Ok(verdict.clone());
        }

        if let Some(last) = self.last_sequence {
            if observation.sequence < last {
                return Err(FaceAuthError::InvalidRequest(format!(
                    "frame {} arrived after frame {}", observation.sequence, last
                )));
            }
        }
        self.last_sequence = Some(observation.sequence);
        if observation.landmarks.is_some() {
            self.faces_seen += 1;
        }

        let state = std::mem::replace(&mut self.state, LivenessState::Init);
        self.state = match state {
            LivenessState::Init if !self.settings.enabled => match observation.landmarks {
                Some(_) => self.terminate(LivenessVerdict::Accept { confidence: 1.0 }),
                None => LivenessState::Init,
            },
            LivenessState::Init => self.collect(Vec::new(), Vec::new(), observation),
            LivenessState::PassiveCollect { landmarks, moire } => self.collect(landmarks, moire, observation),
            LivenessState::AwaitingResponse { detector, deadline, round, confidence, missing } => {
                self.respond(detector, deadline, round, confidence, missing, observation)
            }
            LivenessState::Terminal(verdict) => LivenessState::Terminal(verdict),
        };

        Ok(self.verdict())
    }

    /// Ends the attempt from outside. No effect once terminal.
    pub fn cancel(&mut self) -> LivenessVerdict {
        if !matches!(self.state, LivenessState::Terminal(_)) {
            tracing::debug!(attempt_id = self.attempt_id, "liveness cancelled");
            self.state = LivenessState::Terminal(LivenessVerdict::Cancelled);
        }
        self.verdict()
    }

    /// Rejects a pending challenge whose deadline passed without new frames.
    pub fn expire(&mut self, now: SystemTime) -> LivenessVerdict {
        if let LivenessState::AwaitingResponse { deadline, confidence, .. } = &self.state {
            if now > *deadline {
                let verdict = LivenessVerdict::Reject { reason: RejectReason::ChallengeTimeout, confidence: *confidence };
                self.state = self.terminate(verdict);
            }
        }
        self.verdict()
    }

    /// Closes the attempt when input runs out or the attempt times out.
    pub fn finish(&mut self) -> LivenessVerdict {
        let verdict = match &self.state {
            LivenessState::Terminal(verdict) => return verdict.clone(),
            _ if self.faces_seen == 0 => {
                LivenessVerdict::Reject { reason: RejectReason::NoFaceDetected, confidence: 0.0 }
            }
            LivenessState::AwaitingResponse { confidence, .. } => {
                LivenessVerdict::Reject { reason: RejectReason::ChallengeTimeout, confidence: *confidence }
            }
            LivenessState::Init | LivenessState::PassiveCollect { .. } => {
                LivenessVerdict::Reject { reason: RejectReason::TimedOut, confidence: 0.0 }
            }
        };
        self.state = self.terminate(verdict);
        self.verdict()
    }

    fn collect(&mut self, mut landmarks: Vec<LandmarkSet>, mut moire: Vec<f32>, observation: Observation) -> LivenessState {
        let timestamp = observation.timestamp;
        if let Some(set) = observation.landmarks {
            landmarks.push(set);
            if let Some(score) = observation.moire_score {
                moire.push(score);
            }
        }

        if landmarks.len() < self.settings.window {
            return LivenessState::PassiveCollect { landmarks, moire };
        }
        self.decide(&landmarks, &moire, timestamp)
    }

    fn decide(&mut self, landmarks: &[LandmarkSet], moire: &[f32], timestamp: SystemTime) -> LivenessState {
        let profile = self.settings.level.profile();

        let frequency = (self.settings.frequency_analysis && !moire.is_empty())
            .then(|| moire.iter().sum::<f32>() / moire.len() as f32);
        let temporal = self.settings.temporal_analysis.then(|| {
            let window: Vec<&LandmarkSet> = landmarks.iter().collect();
            self.temporal.analyze(&window).score
        });

        let confidence = match (frequency, temporal) {
            (None, None) => 0.0,
            (f, t) => 1.0 - f.unwrap_or(0.0).max(t.unwrap_or(0.0)),
        };
        self.passive = Some(PassiveScores { frequency, temporal, confidence });
        tracing::debug!(
            attempt_id = self.attempt_id,
            frequency = ?frequency,
            temporal = ?temporal,
            confidence,
            level = self.settings.level.as_str(),
            "passive decision"
        );

        let moire_limit = (self.settings.moire_threshold * profile.strictness).min(1.0);
        if let Some(score) = frequency {
            if score > moire_limit {
                return self.terminate(LivenessVerdict::Reject {
                    reason: RejectReason::FrequencyAnalysis,
                    confidence: 1.0 - score,
                });
            }
        }
        let motion_limit = (self.settings.motion_threshold * profile.strictness).min(1.0);
        if let Some(score) = temporal {
            if score > motion_limit {
                return self.terminate(LivenessVerdict::Reject {
                    reason: RejectReason::TemporalAnalysis,
                    confidence: 1.0 - score,
                });
            }
        }

        let challenges = profile.allows_challenge && self.settings.active_challenge;
        let no_evidence = frequency.is_none() && temporal.is_none();
        if !no_evidence && confidence >= profile.accept_confidence {
            self.terminate(LivenessVerdict::Accept { confidence })
        } else if challenges && (no_evidence || confidence >= profile.challenge_floor) {
            self.issue_challenge(1, confidence, timestamp)
        } else {
            self.terminate(LivenessVerdict::Reject { reason: RejectReason::LowConfidence, confidence })
        }
    }

    fn issue_challenge(&mut self, round: u32, confidence: f32, start: SystemTime) -> LivenessState {
        let kind = self.selector.next_challenge();
        self.notifier.prompt(self.attempt_id, kind, round);
        LivenessState::AwaitingResponse {
            detector: ChallengeDetector::new(kind),
            deadline: start + self.settings.challenge_timeout,
            round,
            confidence,
            missing: 0,
        }
    }

    fn respond(
        &mut self,
        mut detector: ChallengeDetector,
        deadline: SystemTime,
        round: u32,
        confidence: f32,
        mut missing: u32,
        observation: Observation,
    ) -> LivenessState {
        if observation.timestamp > deadline {
            return self.terminate(LivenessVerdict::Reject { reason: RejectReason::ChallengeTimeout, confidence });
        }

        let Some(landmarks) = observation.landmarks else {
            missing += 1;
            if missing >= FACE_LOST_FRAMES {
                return self.terminate(LivenessVerdict::Reject { reason: RejectReason::FaceLost, confidence });
            }
            return LivenessState::AwaitingResponse { detector, deadline, round, confidence, missing };
        };

        match detector.observe(&landmarks) {
            ChallengeResponse::Pending => {
                LivenessState::AwaitingResponse { detector, deadline, round, confidence, missing: 0 }
            }
            ChallengeResponse::Invalid => {
                self.terminate(LivenessVerdict::Reject { reason: RejectReason::ChallengeFailed, confidence })
            }
            ChallengeResponse::Satisfied if round < self.settings.challenge_rounds => {
                tracing::debug!(attempt_id = self.attempt_id, round, "challenge passed");
                self.issue_challenge(round + 1, confidence, observation.timestamp)
            }
            ChallengeResponse::Satisfied => {
                let accept = self.settings.level.profile().accept_confidence;
                self.terminate(LivenessVerdict::Accept { confidence: confidence.max(accept) })
            }
        }
    }

    fn terminate(&self, verdict: LivenessVerdict) -> LivenessState {
        match &verdict {
            LivenessVerdict::Reject { reason, .. } => {
                tracing::info!(attempt_id = self.attempt_id, reason = reason.code(), "liveness rejected");
            }
            other => {
                tracing::debug!(attempt_id = self.attempt_id, verdict = other.label(), "liveness settled");
            }
        }
        LivenessState::Terminal(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Point;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Mutex;

    fn settings(level: SecurityLevel) -> LivenessSettings {
        let security = SecurityConfig {
            security_level: level,
            challenge_seed: Some(7),
            ..SecurityConfig::default()
        };
        LivenessSettings::from_config(&security, 0)
    }

    fn face(ear: f32, dx: f32, dy: f32, yaw_shift: f32) -> LandmarkSet {
        let mut points = vec![Point::new(150.0 + dx, 150.0 + dy); 68];
        points[0] = Point::new(100.0 + dx, 130.0 + dy);
        points[16] = Point::new(200.0 + dx, 130.0 + dy);
        points[8] = Point::new(150.0 + dx, 220.0 + dy);
        points[30] = Point::new(150.0 + dx + yaw_shift, 160.0 + dy);
        for (start, cx) in [(36usize, 125.0f32), (42, 175.0)] {
            let h = ear * 10.0;
            let cx = cx + dx;
            let cy = 120.0 + dy;
            points[start] = Point::new(cx - 10.0, cy);
            points[start + 1] = Point::new(cx - 3.0, cy - h);
            points[start + 2] = Point::new(cx + 3.0, cy - h);
            points[start + 3] = Point::new(cx + 10.0, cy);
            points[start + 4] = Point::new(cx + 3.0, cy + h);
            points[start + 5] = Point::new(cx - 3.0, cy + h);
        }
        LandmarkSet::new(points, 1.0).unwrap()
    }

    struct Feed {
        rng: StdRng,
        sequence: u64,
        start: SystemTime,
    }

    impl Feed {
        fn new() -> Self {
            Self { rng: StdRng::seed_from_u64(3), sequence: 0, start: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000) }
        }

        fn next(&mut self, landmarks: Option<LandmarkSet>, moire: f32) -> Observation {
            let observation = Observation {
                sequence: self.sequence,
                timestamp: self.start + Duration::from_millis(33 * self.sequence),
                landmarks,
                moire_score: Some(moire),
            };
            self.sequence += 1;
            observation
        }

        fn live(&mut self, ear: f32, yaw_shift: f32, moire: f32) -> Observation {
            let dx = self.rng.gen_range(-1.5..1.5);
            let dy = self.rng.gen_range(-1.5..1.5);
            self.next(Some(face(ear, dx, dy, yaw_shift)), moire)
        }
    }

    fn drive_to_challenge(engine: &mut LivenessEngine, feed: &mut Feed) -> ChallengeKind {
        let mut verdict = LivenessVerdict::Indeterminate { frames_needed: 0 };
        for _ in 0..15 {
            verdict = engine.observe(feed.live(0.35, 0.0, 0.45)).unwrap();
        }
        match verdict {
            LivenessVerdict::Challenge { kind, round: 1 } => kind,
            other => panic!("expected a challenge, got {:?}", other),
        }
    }

    #[test]
    fn short_window_is_indeterminate() {
        let mut engine = LivenessEngine::new(1, settings(SecurityLevel::High));
        let mut feed = Feed::new();
        let mut verdict = engine.verdict();
        for _ in 0..10 {
            verdict = engine.observe(feed.live(0.35, 0.0, 0.05)).unwrap();
        }
        assert_eq!(verdict, LivenessVerdict::Indeterminate { frames_needed: 5 });
        assert_eq!(engine.phase(), LivenessPhase::PassiveCollect);
    }

    #[test]
    fn live_window_accepts() {
        let mut engine = LivenessEngine::new(1, settings(SecurityLevel::High));
        let mut feed = Feed::new();
        let mut verdict = engine.verdict();
        for _ in 0..15 {
            verdict = engine.observe(feed.live(0.35, 0.0, 0.05)).unwrap();
        }
        assert!(matches!(verdict, LivenessVerdict::Accept { confidence } if confidence >= 0.85));
    }

    #[test]
    fn frozen_face_never_accepts_at_high() {
        let mut security = SecurityConfig {
            security_level: SecurityLevel::High,
            temporal_analysis: false,
            ..SecurityConfig::default()
        };
        security.challenge_seed = Some(1);
        let mut engine = LivenessEngine::new(1, LivenessSettings::from_config(&security, 0));
        let mut feed = Feed::new();
        let mut verdict = engine.verdict();
        for _ in 0..30 {
            verdict = engine.observe(feed.next(Some(face(0.35, 0.0, 0.0, 0.0)), 0.0)).unwrap();
        }
        assert_eq!(
            verdict,
            LivenessVerdict::Reject { reason: RejectReason::TemporalAnalysis, confidence: 0.0 }
        );
    }

    #[test]
    fn moire_rejects_before_temporal() {
        let mut engine = LivenessEngine::new(1, settings(SecurityLevel::Medium));
        let mut feed = Feed::new();
        let mut verdict = engine.verdict();
        for _ in 0..15 {
            verdict = engine.observe(feed.next(Some(face(0.35, 0.0, 0.0, 0.0)), 0.97)).unwrap();
        }
        assert!(matches!(verdict, LivenessVerdict::Reject { reason: RejectReason::FrequencyAnalysis, .. }));
    }

    #[test]
    fn ambiguous_window_challenges_and_blink_accepts() {
        let mut engine = LivenessEngine::new(1, settings(SecurityLevel::Medium));
        let mut feed = Feed::new();
        let kind = drive_to_challenge(&mut engine, &mut feed);

        let response: Vec<Observation> = match kind {
            ChallengeKind::Blink => vec![feed.live(0.35, 0.0, 0.0), feed.live(0.1, 0.0, 0.0), feed.live(0.35, 0.0, 0.0)],
            ChallengeKind::TurnLeft => vec![feed.live(0.35, 30.0, 0.0)],
            ChallengeKind::TurnRight => vec![feed.live(0.35, -30.0, 0.0)],
            ChallengeKind::Nod => {
                let mut nodded = face(0.35, 0.0, 0.0, 0.0);
                nodded.points[30].y += 15.0;
                vec![feed.next(Some(face(0.35, 0.0, 0.0, 0.0)), 0.0), feed.next(Some(nodded), 0.0)]
            }
        };
        let mut verdict = engine.verdict();
        for observation in response {
            verdict = engine.observe(observation).unwrap();
        }
        assert!(matches!(verdict, LivenessVerdict::Accept { confidence } if confidence >= 0.7));
    }

    #[test]
    fn timed_blink_accepts_and_steady_eyes_time_out() {
        // Find a seed whose first challenge is a blink.
        let seed = (0..100u64)
            .find(|&s| ChallengeSelector::new(s).next_challenge() == ChallengeKind::Blink)
            .unwrap();
        let security = SecurityConfig { challenge_seed: Some(seed), ..SecurityConfig::default() };

        let mut engine = LivenessEngine::new(1, LivenessSettings::from_config(&security, 0));
        let mut feed = Feed::new();
        assert_eq!(drive_to_challenge(&mut engine, &mut feed), ChallengeKind::Blink);
        for ear in [0.35, 0.35, 0.12, 0.1, 0.34] {
            engine.observe(feed.live(ear, 0.0, 0.0)).unwrap();
        }
        assert!(matches!(engine.verdict(), LivenessVerdict::Accept { .. }));

        let mut engine = LivenessEngine::new(2, LivenessSettings::from_config(&security, 0));
        let mut feed = Feed::new();
        drive_to_challenge(&mut engine, &mut feed);
        let mut verdict = engine.verdict();
        for _ in 0..100 {
            verdict = engine.observe(feed.live(0.33, 0.0, 0.0)).unwrap();
        }
        assert!(matches!(verdict, LivenessVerdict::Reject { reason: RejectReason::ChallengeTimeout, .. }));
    }

    #[test]
    fn wrong_turn_fails_challenge() {
        let seed = (0..100u64)
            .find(|&s| ChallengeSelector::new(s).next_challenge() == ChallengeKind::TurnLeft)
            .unwrap();
        let security = SecurityConfig { challenge_seed: Some(seed), ..SecurityConfig::default() };
        let mut engine = LivenessEngine::new(1, LivenessSettings::from_config(&security, 0));
        let mut feed = Feed::new();
        drive_to_challenge(&mut engine, &mut feed);

        let verdict = engine.observe(feed.live(0.35, -30.0, 0.0)).unwrap();
        assert!(matches!(verdict, LivenessVerdict::Reject { reason: RejectReason::ChallengeFailed, .. }));
    }

    #[test]
    fn low_level_rejects_instead_of_challenging() {
        let mut engine = LivenessEngine::new(1, settings(SecurityLevel::Low));
        let mut feed = Feed::new();
        let mut verdict = engine.verdict();
        for _ in 0..15 {
            verdict = engine.observe(feed.live(0.35, 0.0, 0.55)).unwrap();
        }
        assert!(matches!(verdict, LivenessVerdict::Reject { reason: RejectReason::LowConfidence, .. }));
    }

    #[test]
    fn decreasing_sequence_is_refused() {
        let mut engine = LivenessEngine::new(1, settings(SecurityLevel::Medium));
        let mut feed = Feed::new();
        let first = feed.live(0.35, 0.0, 0.0);
        let second = feed.live(0.35, 0.0, 0.0);
        engine.observe(second).unwrap();
        assert!(matches!(engine.observe(first), Err(FaceAuthError::InvalidRequest(_))));
    }

    #[test]
    fn cancel_mid_challenge_is_terminal() {
        let mut engine = LivenessEngine::new(1, settings(SecurityLevel::Medium));
        let mut feed = Feed::new();
        drive_to_challenge(&mut engine, &mut feed);

        assert_eq!(engine.cancel(), LivenessVerdict::Cancelled);
        assert_eq!(engine.phase(), LivenessPhase::Terminal);
        assert_eq!(engine.observe(feed.live(0.35, 0.0, 0.0)).unwrap(), LivenessVerdict::Cancelled);
    }

    #[test]
    fn face_lost_during_challenge_rejects() {
        let mut engine = LivenessEngine::new(1, settings(SecurityLevel::Medium));
        let mut feed = Feed::new();
        drive_to_challenge(&mut engine, &mut feed);
        let mut verdict = engine.verdict();
        for _ in 0..FACE_LOST_FRAMES {
            verdict = engine.observe(feed.next(None, 0.0)).unwrap();
        }
        assert!(matches!(verdict, LivenessVerdict::Reject { reason: RejectReason::FaceLost, .. }));
    }

    #[test]
    fn silent_challenge_expires_at_its_deadline() {
        let mut engine = LivenessEngine::new(1, settings(SecurityLevel::Medium));
        let mut feed = Feed::new();
        drive_to_challenge(&mut engine, &mut feed);
        let last = feed.start + Duration::from_millis(33 * (feed.sequence - 1));

        assert!(matches!(engine.expire(last + Duration::from_secs(1)), LivenessVerdict::Challenge { .. }));
        assert!(matches!(
            engine.expire(last + Duration::from_secs(4)),
            LivenessVerdict::Reject { reason: RejectReason::ChallengeTimeout, .. }
        ));
    }

    #[test]
    fn same_input_gives_same_challenges() {
        let run = || {
            let security = SecurityConfig {
                challenge_seed: Some(99),
                challenge_rounds: 3,
                ..SecurityConfig::default()
            };
            let mut engine = LivenessEngine::new(1, LivenessSettings::from_config(&security, 0));
            let mut feed = Feed::new();
            let mut kinds = vec![drive_to_challenge(&mut engine, &mut feed)];
            // Pass each round with whatever it asks for.
            while let LivenessVerdict::Challenge { kind, .. } = engine.verdict() {
                let frames = match kind {
                    ChallengeKind::Blink => vec![face(0.35, 0.0, 0.0, 0.0), face(0.1, 0.0, 0.0, 0.0), face(0.35, 0.0, 0.0, 0.0)],
                    ChallengeKind::TurnLeft => vec![face(0.35, 0.0, 0.0, 30.0)],
                    ChallengeKind::TurnRight => vec![face(0.35, 0.0, 0.0, -30.0)],
                    ChallengeKind::Nod => {
                        let mut nodded = face(0.35, 0.0, 0.0, 0.0);
                        nodded.points[30].y += 15.0;
                        vec![face(0.35, 0.0, 0.0, 0.0), nodded]
                    }
                };
                for set in frames {
                    engine.observe(feed.next(Some(set), 0.0)).unwrap();
                }
                if let LivenessVerdict::Challenge { kind, .. } = engine.verdict() {
                    kinds.push(kind);
                }
            }
            (kinds, engine.verdict())
        };

        let (first, verdict) = run();
        let (second, _) = run();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert!(first.windows(2).all(|w| w[0] != w[1]));
        assert!(matches!(verdict, LivenessVerdict::Accept { .. }));
    }

    #[test]
    fn finish_without_faces_reports_no_face() {
        let mut engine = LivenessEngine::new(1, settings(SecurityLevel::Medium));
        let mut feed = Feed::new();
        for _ in 0..5 {
            engine.observe(feed.next(None, 0.0)).unwrap();
        }
        let verdict = engine.finish();
        assert!(matches!(verdict, LivenessVerdict::Reject { reason: RejectReason::NoFaceDetected, .. }));
        assert_eq!(RejectReason::NoFaceDetected.failure_kind().message(), "no face detected");
    }

    #[test]
    fn notifier_hears_each_prompt() {
        struct Recorder(Mutex<Vec<ChallengeKind>>);
        impl ChallengeNotifier for Recorder {
            fn prompt(&self, _attempt_id: u64, kind: ChallengeKind, _round: u32) {
                self.0.lock().unwrap().push(kind);
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut engine = LivenessEngine::new(1, settings(SecurityLevel::Medium)).with_notifier(recorder.clone());
        let mut feed = Feed::new();
        let kind = drive_to_challenge(&mut engine, &mut feed);
        assert_eq!(*recorder.0.lock().unwrap(), vec![kind]);
    }

    #[test]
    fn disabled_liveness_accepts_first_face() {
        let security = SecurityConfig { liveness_check: false, ..SecurityConfig::default() };
        let mut engine = LivenessEngine::new(1, LivenessSettings::from_config(&security, 0));
        let mut feed = Feed::new();
        assert!(!engine.observe(feed.next(None, 0.0)).unwrap().is_terminal());
        assert_eq!(
            engine.observe(feed.live(0.35, 0.0, 0.0)).unwrap(),
            LivenessVerdict::Accept { confidence: 1.0 }
        );
    }
}
