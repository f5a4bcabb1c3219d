pub mod challenge;
pub mod engine;
pub mod frequency;
pub mod temporal;

pub use challenge::{ChallengeKind, ChallengeSelector};
pub use engine::{
    ChallengeNotifier, FailureKind, LivenessEngine, LivenessPhase, LivenessSettings, LivenessVerdict,
    LogNotifier, Observation, PassiveScores, RejectReason,
};
pub use frequency::FrequencyAnalyzer;
pub use temporal::{MotionPattern, TemporalAnalyzer};
