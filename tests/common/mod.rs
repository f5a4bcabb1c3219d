#![allow(dead_code)]

use faceguard::common::Config;
use faceguard::core::{BlobFaceModel, FaceDescriptor, FaceModel, Frame, LandmarkSet, ModelHost};
use faceguard::service::{
    AccessPolicy, AttemptRegistry, AttemptSettings, IpcClient, IpcServer, ServerOptions, ShutdownHandle,
    StatsRegistry,
};
use faceguard::storage::{EnrolledModel, TemplateCache};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

pub const WIDTH: u32 = 160;
pub const HEIGHT: u32 = 120;
pub const FACE: u32 = 80;
const BACKGROUND: f32 = 20.0;
const SKIN: f32 = 180.0;

/// Pose the user holds in a rendered frame. Encoded in the top-left pixel,
/// below the face threshold so detection ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    Neutral,
    EyesClosed,
    TurnLeft,
    TurnRight,
    Nod,
}

impl Gesture {
    fn marker(self) -> u8 {
        match self {
            Gesture::Neutral => 0,
            Gesture::EyesClosed => 90,
            Gesture::TurnLeft => 91,
            Gesture::TurnRight => 92,
            Gesture::Nod => 93,
        }
    }

    fn from_marker(value: u8) -> Self {
        match value {
            90 => Gesture::EyesClosed,
            91 => Gesture::TurnLeft,
            92 => Gesture::TurnRight,
            93 => Gesture::Nod,
            _ => Gesture::Neutral,
        }
    }
}

/// The synthetic model, plus landmark poses read from the frame marker.
#[derive(Debug, Default)]
pub struct GestureModel {
    inner: BlobFaceModel,
}

impl FaceModel for GestureModel {
    fn detect(&self, frame: &Frame) -> faceguard::Result<Vec<LandmarkSet>> {
        let mut faces = self.inner.detect(frame)?;
        let gesture = Gesture::from_marker(frame.pixel(0, 0));
        for face in &mut faces {
            pose(face, gesture);
        }
        Ok(faces)
    }

    fn encode(&self, frame: &Frame, landmarks: &LandmarkSet) -> faceguard::Result<FaceDescriptor> {
        self.inner.encode(frame, landmarks)
    }
}

fn pose(face: &mut LandmarkSet, gesture: Gesture) {
    let left = face.jaw_left();
    let right = face.jaw_right();
    let half_width = (right.x - left.x) / 2.0;
    let eye_y = (LandmarkSet::eye_center(face.left_eye()).y + LandmarkSet::eye_center(face.right_eye()).y) / 2.0;
    let span = face.chin().y - eye_y;
    match gesture {
        Gesture::Neutral => {}
        Gesture::EyesClosed => {
            for start in [36usize, 42] {
                let center = LandmarkSet::eye_center(&face.points[start..start + 6]).y;
                for point in &mut face.points[start..start + 6] {
                    point.y = center;
                }
            }
        }
        Gesture::TurnLeft => face.points[30].x += 0.4 * half_width,
        Gesture::TurnRight => face.points[30].x -= 0.4 * half_width,
        Gesture::Nod => face.points[30].y += 0.2 * span,
    }
}

/// Renders numbered grayscale frames of a square "face".
pub struct Scene {
    rng: StdRng,
    sequence: u64,
}

impl Scene {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), sequence: 0 }
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// A live face: small head movements and sensor noise.
    pub fn live(&mut self, gesture: Gesture) -> Frame {
        let dx = self.rng.gen_range(-2i32..=2);
        let dy = self.rng.gen_range(-2i32..=2);
        let (x0, y0) = ((40 + dx) as u32, (20 + dy) as u32);
        let mut data = Vec::with_capacity((WIDTH * HEIGHT) as usize);
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let inside = x >= x0 && x < x0 + FACE && y >= y0 && y < y0 + FACE;
                let value = if inside {
                    SKIN + self.rng.gen_range(-12.0f32..12.0)
                } else {
                    BACKGROUND + self.rng.gen_range(-8.0f32..8.0)
                };
                data.push(value.clamp(0.0, 255.0) as u8);
            }
        }
        data[0] = gesture.marker();
        let sequence = self.next_sequence();
        Frame::new(data, WIDTH, HEIGHT, sequence, SystemTime::now()).expect("valid frame")
    }

    /// A printed photo or screen: perfectly still, with a fine periodic pattern.
    pub fn photo(&mut self) -> Frame {
        let (x0, y0) = (40u32, 20u32);
        let mut data = Vec::with_capacity((WIDTH * HEIGHT) as usize);
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let inside = x >= x0 && x < x0 + FACE && y >= y0 && y < y0 + FACE;
                let value = if inside {
                    SKIN + 40.0 * (2.0 * std::f32::consts::PI * x as f32 / 7.0).sin()
                } else {
                    BACKGROUND
                };
                data.push(value.clamp(0.0, 255.0) as u8);
            }
        }
        let sequence = self.next_sequence();
        Frame::new(data, WIDTH, HEIGHT, sequence, SystemTime::now()).expect("valid frame")
    }

    pub fn live_batch(&mut self, count: usize) -> Vec<Frame> {
        (0..count).map(|_| self.live(Gesture::Neutral)).collect()
    }

    pub fn photo_batch(&mut self, count: usize) -> Vec<Frame> {
        (0..count).map(|_| self.photo()).collect()
    }
}

/// Config for tests: no dev paths, small pools, the given level.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.pipeline.max_workers = 2;
    config.daemon.workers = 4;
    config.daemon.max_sessions = 4;
    config.daemon.connect_timeout_ms = 1_000;
    config.daemon.request_timeout_ms = 10_000;
    config.security.challenge_seed = Some(11);
    config
}

/// Passive analysis off, so every full window earns a challenge.
pub fn challenge_config() -> Config {
    let mut config = test_config();
    config.security.frequency_analysis = false;
    config.security.temporal_analysis = false;
    config
}

pub fn gesture_host() -> Arc<ModelHost> {
    Arc::new(ModelHost::with_model(Arc::new(GestureModel::default())))
}

/// A daemon serving on a scratch socket from a background thread.
pub struct TestDaemon {
    pub socket: PathBuf,
    /// Where the daemon reads `<user>.json` templates from.
    pub templates: PathBuf,
    pub stats: Arc<StatsRegistry>,
    pub attempts: Arc<AttemptRegistry>,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
    _dir: TempDir,
}

impl TestDaemon {
    pub fn start(config: &Config) -> Self {
        let dir = tempfile::tempdir().expect("scratch dir");
        let socket = dir.path().join("daemon.sock");
        let templates = dir.path().join("templates");
        std::fs::create_dir_all(&templates).expect("templates dir");
        let host = gesture_host();
        let stats = Arc::new(StatsRegistry::new());
        let attempts = Arc::new(AttemptRegistry::new(
            AttemptSettings::from_config(config),
            Arc::clone(&host),
            Arc::clone(&stats),
            None,
        ));
        let options = ServerOptions {
            socket_path: socket.clone(),
            workers: config.daemon.workers,
            max_connections: config.daemon.max_connections,
            idle_timeout: Duration::from_secs(5),
            access: AccessPolicy::new(Vec::new(), true),
        };
        let cache = Arc::new(TemplateCache::new(templates.clone(), Arc::clone(&stats)));
        let server = IpcServer::bind(options, host, Arc::clone(&stats), Arc::clone(&attempts), cache).expect("bind");
        let shutdown = server.shutdown_handle();
        let thread = thread::spawn(move || server.serve().expect("serve"));

        Self { socket, templates, stats, attempts, shutdown, thread: Some(thread), _dir: dir }
    }

    pub fn client(&self) -> IpcClient {
        IpcClient::connect(&self.socket, Duration::from_secs(1), Duration::from_secs(10)).expect("connect")
    }

    /// Writes an enrollment file for `user` holding `descriptors`.
    pub fn enroll(&self, user: &str, descriptors: &[FaceDescriptor]) {
        write_templates(&self.templates, user, descriptors);
    }

    /// Waits for the serve loop to return.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join().expect("server thread");
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.trigger();
        self.join();
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn write_templates(dir: &Path, user: &str, descriptors: &[FaceDescriptor]) {
    let models = vec![EnrolledModel {
        label: "Initial".into(),
        time: None,
        data: descriptors.iter().map(|d| d.0.clone()).collect(),
    }];
    let json = serde_json::to_string(&models).expect("serialize templates");
    std::fs::write(dir.join(format!("{}.json", user)), json).expect("write templates");
}
