use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::common::error::{FaceAuthError, Result};
use crate::common::paths;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub landmarks: LandmarkConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub attempt_log: AttemptLogConfig,
    #[serde(default)]
    pub templates: TemplateConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Whether the authentication client tries the daemon at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Model requests (detect, encode, frame batches) served at once.
    /// Every connection has its own reader thread regardless.
    #[serde(default = "default_daemon_workers")]
    pub workers: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Non-root uids allowed to talk to the daemon.
    #[serde(default)]
    pub allowed_uids: Vec<u32>,
}

fn default_true() -> bool { true }
fn default_socket_path() -> PathBuf { PathBuf::from(paths::SYSTEM_SOCKET_PATH) }
fn default_daemon_workers() -> usize { 4 }
fn default_max_connections() -> usize { 64 }
fn default_max_sessions() -> usize { 8 }
fn default_request_timeout() -> u64 { 5000 }
fn default_connect_timeout() -> u64 { 500 }
fn default_idle_timeout() -> u64 { 30 }

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: default_socket_path(),
            workers: default_daemon_workers(),
            max_connections: default_max_connections(),
            max_sessions: default_max_sessions(),
            request_timeout_ms: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            allowed_uids: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_detector_path")]
    pub detector_path: PathBuf,
    #[serde(default = "default_landmark_path")]
    pub landmark_path: PathBuf,
    #[serde(default = "default_recognizer_path")]
    pub recognizer_path: PathBuf,
    #[serde(default = "default_optimization_level")]
    pub optimization_level: u32,
}

fn default_detector_path() -> PathBuf { paths::system_models_dir().join("face_detector.onnx") }
fn default_landmark_path() -> PathBuf { paths::system_models_dir().join("landmarks_68.onnx") }
fn default_recognizer_path() -> PathBuf { paths::system_models_dir().join("face_recognizer.onnx") }
fn default_optimization_level() -> u32 { 3 }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_path: default_detector_path(),
            landmark_path: default_landmark_path(),
            recognizer_path: default_recognizer_path(),
            optimization_level: default_optimization_level(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_input")]
    pub input_width: u32,
    #[serde(default = "default_detector_input")]
    pub input_height: u32,
    #[serde(default = "default_detection_confidence")]
    pub confidence: f32,
}

fn default_detector_input() -> u32 { 640 }
fn default_detection_confidence() -> f32 { 0.5 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_input(),
            input_height: default_detector_input(),
            confidence: default_detection_confidence(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LandmarkConfig {
    #[serde(default = "default_landmark_input")]
    pub input_size: u32,
}

fn default_landmark_input() -> u32 { 112 }

impl Default for LandmarkConfig {
    fn default() -> Self {
        Self { input_size: default_landmark_input() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognizerConfig {
    #[serde(default = "default_recognizer_input")]
    pub input_size: u32,
    #[serde(default = "default_normalization_value")]
    pub normalization_value: f32,
}

fn default_recognizer_input() -> u32 { 112 }
fn default_normalization_value() -> f32 { 127.5 }

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            input_size: default_recognizer_input(),
            normalization_value: default_normalization_value(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
}

/// Thresholds attached to a security level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelProfile {
    /// Combined confidence at or above which the passive stage accepts.
    pub accept_confidence: f32,
    /// Lower edge of the band that earns an active challenge.
    pub challenge_floor: f32,
    /// Whether the level ever issues active challenges.
    pub allows_challenge: bool,
    /// Scale applied to the per-analyzer spoof thresholds.
    pub strictness: f32,
}

impl SecurityLevel {
    pub fn profile(self) -> LevelProfile {
        match self {
            SecurityLevel::Low => LevelProfile {
                accept_confidence: 0.5,
                challenge_floor: 0.5,
                allows_challenge: false,
                strictness: 1.2,
            },
            SecurityLevel::Medium => LevelProfile {
                accept_confidence: 0.7,
                challenge_floor: 0.4,
                allows_challenge: true,
                strictness: 1.0,
            },
            SecurityLevel::High => LevelProfile {
                accept_confidence: 0.85,
                challenge_floor: 0.5,
                allows_challenge: true,
                strictness: 0.8,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SecurityLevel::Low => "low",
            SecurityLevel::Medium => "medium",
            SecurityLevel::High => "high",
        }
    }
}

impl Default for SecurityLevel {
    fn default() -> Self { SecurityLevel::Medium }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub liveness_check: bool,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default = "default_true")]
    pub active_challenge: bool,
    #[serde(default = "default_true")]
    pub frequency_analysis: bool,
    #[serde(default = "default_true")]
    pub temporal_analysis: bool,
    /// Frames with a face collected before the passive decision.
    #[serde(default = "default_passive_window")]
    pub passive_window: usize,
    #[serde(default = "default_challenge_timeout")]
    pub challenge_timeout_secs: f32,
    #[serde(default = "default_challenge_rounds")]
    pub challenge_rounds: u32,
    /// Fixed seed for challenge selection. Random per attempt when unset.
    #[serde(default)]
    pub challenge_seed: Option<u64>,
    /// Frequency spoof score above which a frame window is a screen/print.
    #[serde(default = "default_moire_threshold")]
    pub moire_threshold: f32,
    /// Temporal spoof score above which a window is static or looped.
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: f32,
    /// Rejected attempts within `lockout_secs` before a user is locked out.
    /// Zero disables the lockout.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
}

fn default_passive_window() -> usize { 15 }
fn default_challenge_timeout() -> f32 { 3.0 }
fn default_challenge_rounds() -> u32 { 1 }
fn default_moire_threshold() -> f32 { 0.6 }
fn default_motion_threshold() -> f32 { 0.7 }
fn default_max_failures() -> u32 { 5 }
fn default_lockout_secs() -> u64 { 300 }

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            liveness_check: true,
            security_level: SecurityLevel::default(),
            active_challenge: true,
            frequency_analysis: true,
            temporal_analysis: true,
            passive_window: default_passive_window(),
            challenge_timeout_secs: default_challenge_timeout(),
            challenge_rounds: default_challenge_rounds(),
            challenge_seed: None,
            moire_threshold: default_moire_threshold(),
            motion_threshold: default_motion_threshold(),
            max_failures: default_max_failures(),
            lockout_secs: default_lockout_secs(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VideoConfig {
    /// Descriptor distance threshold, consumed by the external matcher.
    #[serde(default = "default_certainty")]
    pub certainty: f32,
    /// Upper bound on one attempt's lifetime.
    #[serde(default = "default_video_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub save_failed: bool,
    #[serde(default)]
    pub end_report: bool,
    /// Frames taller than this are downscaled before detection.
    #[serde(default = "default_max_height")]
    pub max_height: u32,
}

fn default_certainty() -> f32 { 3.5 }
fn default_video_timeout() -> u64 { 8 }
fn default_max_height() -> u32 { 480 }

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            certainty: default_certainty(),
            timeout_secs: default_video_timeout(),
            save_failed: false,
            end_report: false,
            max_height: default_max_height(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,
    #[serde(default = "default_warmup_delay")]
    pub warmup_delay_ms: u64,
}

fn default_camera_width() -> u32 { 640 }
fn default_camera_height() -> u32 { 480 }
fn default_warmup_frames() -> u32 { 3 }
fn default_warmup_delay() -> u64 { 50 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: default_camera_width(),
            height: default_camera_height(),
            warmup_frames: default_warmup_frames(),
            warmup_delay_ms: default_warmup_delay(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Upper bound on worker slots; hardware concurrency caps it further.
    #[serde(default = "default_pipeline_workers")]
    pub max_workers: usize,
    #[serde(default = "default_target_latency")]
    pub target_latency_ms: u64,
    /// Compute a descriptor for every frame with a face.
    #[serde(default = "default_true")]
    pub encode_frames: bool,
    /// Skip dark, washed-out, flat or blurry frames before inference.
    #[serde(default = "default_true")]
    pub quality_filter: bool,
    #[serde(default = "default_min_brightness")]
    pub min_brightness: f32,
    #[serde(default = "default_max_brightness")]
    pub max_brightness: f32,
    /// Minimum standard deviation of pixel values.
    #[serde(default = "default_min_contrast")]
    pub min_contrast: f32,
    /// Minimum variance of the Laplacian.
    #[serde(default = "default_min_sharpness")]
    pub min_sharpness: f32,
}

fn default_pipeline_workers() -> usize { 4 }
fn default_target_latency() -> u64 { 100 }
fn default_min_brightness() -> f32 { 20.0 }
fn default_max_brightness() -> f32 { 235.0 }
fn default_min_contrast() -> f32 { 10.0 }
fn default_min_sharpness() -> f32 { 20.0 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_pipeline_workers(),
            target_latency_ms: default_target_latency(),
            encode_frames: true,
            quality_filter: true,
            min_brightness: default_min_brightness(),
            max_brightness: default_max_brightness(),
            min_contrast: default_min_contrast(),
            min_sharpness: default_min_sharpness(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AttemptLogConfig {
    #[serde(default = "default_attempt_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_attempt_log_dir() -> PathBuf { paths::system_log_dir() }
fn default_queue_depth() -> usize { 32 }

impl Default for AttemptLogConfig {
    fn default() -> Self {
        Self {
            dir: default_attempt_log_dir(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Where enrolled face templates live, one `<user>.json` per user.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TemplateConfig {
    #[serde(default = "default_templates_dir")]
    pub dir: PathBuf,
}

fn default_templates_dir() -> PathBuf { paths::system_templates_dir() }

impl Default for TemplateConfig {
    fn default() -> Self {
        Self { dir: default_templates_dir() }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from_path(&paths::system_config_file())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FaceAuthError::Config(format!(
                "Config file not found: {}", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| FaceAuthError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.daemon.workers == 0 || self.daemon.workers > 64 {
            return Err(FaceAuthError::Config(format!(
                "daemon.workers must be between 1 and 64, got {}", self.daemon.workers
            )));
        }
        if self.daemon.max_connections == 0 {
            return Err(FaceAuthError::Config("daemon.max_connections must be at least 1".into()));
        }
        if self.daemon.max_sessions == 0 {
            return Err(FaceAuthError::Config("daemon.max_sessions must be at least 1".into()));
        }
        if self.daemon.request_timeout_ms == 0 {
            return Err(FaceAuthError::Config("daemon.request_timeout_ms must be positive".into()));
        }

        if self.detector.input_width == 0 || self.detector.input_width > 4096 {
            return Err(FaceAuthError::Config(format!(
                "Detector input width must be between 1 and 4096, got {}",
                self.detector.input_width
            )));
        }
        if self.detector.input_height == 0 || self.detector.input_height > 4096 {
            return Err(FaceAuthError::Config(format!(
                "Detector input height must be between 1 and 4096, got {}",
                self.detector.input_height
            )));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence) {
            return Err(FaceAuthError::Config(format!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                self.detector.confidence
            )));
        }
        if self.landmarks.input_size == 0 || self.landmarks.input_size > 1024 {
            return Err(FaceAuthError::Config(format!(
                "Landmark input size must be between 1 and 1024, got {}",
                self.landmarks.input_size
            )));
        }
        if !self.recognizer.normalization_value.is_finite() || self.recognizer.normalization_value <= 0.0 {
            return Err(FaceAuthError::Config(format!(
                "Recognizer normalization value must be positive, got {}",
                self.recognizer.normalization_value
            )));
        }
        if self.recognizer.input_size == 0 || self.recognizer.input_size > 1024 {
            return Err(FaceAuthError::Config(format!(
                "Recognizer input size must be between 1 and 1024, got {}",
                self.recognizer.input_size
            )));
        }

        if self.security.passive_window < 2 || self.security.passive_window > 120 {
            return Err(FaceAuthError::Config(format!(
                "security.passive_window must be between 2 and 120, got {}",
                self.security.passive_window
            )));
        }
        let timeout = self.security.challenge_timeout_secs;
        if !timeout.is_finite() || timeout <= 0.0 || timeout > 30.0 {
            return Err(FaceAuthError::Config(format!(
                "security.challenge_timeout_secs must be in (0, 30], got {}",
                self.security.challenge_timeout_secs
            )));
        }
        if self.security.challenge_rounds == 0 || self.security.challenge_rounds > 4 {
            return Err(FaceAuthError::Config(format!(
                "security.challenge_rounds must be between 1 and 4, got {}",
                self.security.challenge_rounds
            )));
        }
        for (name, value) in [
            ("moire_threshold", self.security.moire_threshold),
            ("motion_threshold", self.security.motion_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FaceAuthError::Config(format!(
                    "security.{} must be between 0.0 and 1.0, got {}", name, value
                )));
            }
        }

        if !self.video.certainty.is_finite() || self.video.certainty <= 0.0 || self.video.certainty > 10.0 {
            return Err(FaceAuthError::Config(format!(
                "video.certainty must be in (0, 10], got {}", self.video.certainty
            )));
        }
        if self.video.timeout_secs < 1 || self.video.timeout_secs > 60 {
            return Err(FaceAuthError::Config(format!(
                "Timeout must be between 1 and 60 seconds, got {}", self.video.timeout_secs
            )));
        }
        if self.video.max_height < 64 {
            return Err(FaceAuthError::Config(format!(
                "video.max_height must be at least 64, got {}", self.video.max_height
            )));
        }

        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(FaceAuthError::Config(format!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(FaceAuthError::Config(format!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }

        if self.pipeline.max_workers == 0 || self.pipeline.max_workers > 32 {
            return Err(FaceAuthError::Config(format!(
                "pipeline.max_workers must be between 1 and 32, got {}",
                self.pipeline.max_workers
            )));
        }
        for (name, value) in [
            ("min_brightness", self.pipeline.min_brightness),
            ("max_brightness", self.pipeline.max_brightness),
            ("min_contrast", self.pipeline.min_contrast),
            ("min_sharpness", self.pipeline.min_sharpness),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(FaceAuthError::Config(format!(
                    "pipeline.{} must be a non-negative number, got {}", name, value
                )));
            }
        }
        if self.pipeline.min_brightness >= self.pipeline.max_brightness {
            return Err(FaceAuthError::Config(format!(
                "pipeline.min_brightness ({}) must be below max_brightness ({})",
                self.pipeline.min_brightness, self.pipeline.max_brightness
            )));
        }
        if self.attempt_log.queue_depth == 0 {
            return Err(FaceAuthError::Config("attempt_log.queue_depth must be at least 1".into()));
        }

        Ok(())
    }
}
