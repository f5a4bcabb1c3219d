use crate::core::types::{LandmarkSet, Point};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Eye aspect ratio below which an eye is closed.
pub const EAR_CLOSED: f32 = 0.25;
/// Eye aspect ratio above which an eye is open.
pub const EAR_OPEN: f32 = 0.3;
pub const TURN_THRESHOLD_DEG: f32 = 15.0;
pub const NOD_THRESHOLD_DEG: f32 = 12.0;
/// Change of the nose's relative eye-to-chin position per unit of sin(pitch).
const NOSE_PITCH_GAIN: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeKind {
    Blink,
    TurnLeft,
    TurnRight,
    Nod,
}

impl ChallengeKind {
    pub const ALL: [ChallengeKind; 4] = [
        ChallengeKind::Blink,
        ChallengeKind::TurnLeft,
        ChallengeKind::TurnRight,
        ChallengeKind::Nod,
    ];

    pub fn prompt(self) -> &'static str {
        match self {
            ChallengeKind::Blink => "Please blink",
            ChallengeKind::TurnLeft => "Turn your head left",
            ChallengeKind::TurnRight => "Turn your head right",
            ChallengeKind::Nod => "Nod your head",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeKind::Blink => "blink",
            ChallengeKind::TurnLeft => "turn_left",
            ChallengeKind::TurnRight => "turn_right",
            ChallengeKind::Nod => "nod",
        }
    }
}

/// Seeded challenge picker. Never returns the same kind twice in a row.
#[derive(Debug)]
pub struct ChallengeSelector {
    rng: StdRng,
    previous: Option<ChallengeKind>,
}

impl ChallengeSelector {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), previous: None }
    }

    pub fn next_challenge(&mut self) -> ChallengeKind {
        let options: Vec<ChallengeKind> = ChallengeKind::ALL
            .iter()
            .copied()
            .filter(|kind| Some(*kind) != self.previous)
            .collect();
        let kind = options[self.rng.gen_range(0..options.len())];
        self.previous = Some(kind);
        kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeResponse {
    Pending,
    Satisfied,
    /// The user clearly did something else, e.g. turned the wrong way.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlinkPhase {
    AwaitOpen,
    Open,
    Closed,
}

/// Evaluates landmark frames against one issued challenge.
#[derive(Debug, Clone)]
pub struct ChallengeDetector {
    kind: ChallengeKind,
    blink: BlinkPhase,
    pitch_baseline: Option<f32>,
}

impl ChallengeDetector {
    pub fn new(kind: ChallengeKind) -> Self {
        Self { kind, blink: BlinkPhase::AwaitOpen, pitch_baseline: None }
    }

    pub fn kind(&self) -> ChallengeKind {
        self.kind
    }

    pub fn observe(&mut self, landmarks: &LandmarkSet) -> ChallengeResponse {
        match self.kind {
            ChallengeKind::Blink => self.observe_blink(landmarks),
            ChallengeKind::TurnLeft => turn_response(yaw_degrees(landmarks), 1.0),
            ChallengeKind::TurnRight => turn_response(yaw_degrees(landmarks), -1.0),
            ChallengeKind::Nod => self.observe_nod(landmarks),
        }
    }

    // Open, closed, open again.
    fn observe_blink(&mut self, landmarks: &LandmarkSet) -> ChallengeResponse {
        let ear = (eye_aspect_ratio(landmarks.left_eye()) + eye_aspect_ratio(landmarks.right_eye())) / 2.0;
        self.blink = match self.blink {
            BlinkPhase::AwaitOpen if ear > EAR_OPEN => BlinkPhase::Open,
            BlinkPhase::Open if ear < EAR_CLOSED => BlinkPhase::Closed,
            BlinkPhase::Closed if ear > EAR_OPEN => return ChallengeResponse::Satisfied,
            phase => phase,
        };
        ChallengeResponse::Pending
    }

    fn observe_nod(&mut self, landmarks: &LandmarkSet) -> ChallengeResponse {
        let Some(position) = nose_position(landmarks) else {
            return ChallengeResponse::Pending;
        };
        let baseline = *self.pitch_baseline.get_or_insert(position);
        let pitch = ((position - baseline) / NOSE_PITCH_GAIN).clamp(-1.0, 1.0).asin().to_degrees();
        if pitch.abs() >= NOD_THRESHOLD_DEG {
            ChallengeResponse::Satisfied
        } else {
            ChallengeResponse::Pending
        }
    }
}

fn turn_response(yaw: Option<f32>, direction: f32) -> ChallengeResponse {
    match yaw {
        Some(yaw) if yaw * direction >= TURN_THRESHOLD_DEG => ChallengeResponse::Satisfied,
        Some(yaw) if yaw * direction <= -TURN_THRESHOLD_DEG => ChallengeResponse::Invalid,
        _ => ChallengeResponse::Pending,
    }
}

/// (|p1-p5| + |p2-p4|) / (2 |p0-p3|) over a six-point eye contour.
pub fn eye_aspect_ratio(eye: &[Point]) -> f32 {
    if eye.len() < 6 {
        return 0.0;
    }
    let horizontal = eye[0].distance(&eye[3]);
    if horizontal <= f32::EPSILON {
        return 0.0;
    }
    (eye[1].distance(&eye[5]) + eye[2].distance(&eye[4])) / (2.0 * horizontal)
}

/// Yaw estimate from the nose tip's offset between the jaw corners. Positive
/// when the nose moves toward the image right, which is the user turning left.
pub fn yaw_degrees(landmarks: &LandmarkSet) -> Option<f32> {
    let left = landmarks.jaw_left();
    let right = landmarks.jaw_right();
    let half_width = (right.x - left.x) / 2.0;
    if half_width.abs() <= f32::EPSILON {
        return None;
    }
    let offset = (landmarks.nose_tip().x - (left.x + half_width)) / half_width;
    Some(offset.clamp(-1.0, 1.0).asin().to_degrees())
}

/// Nose tip height between the eye line (0) and the chin (1).
fn nose_position(landmarks: &LandmarkSet) -> Option<f32> {
    let eye_y = (LandmarkSet::eye_center(landmarks.left_eye()).y
        + LandmarkSet::eye_center(landmarks.right_eye()).y)
        / 2.0;
    let span = landmarks.chin().y - eye_y;
    if span.abs() <= f32::EPSILON {
        return None;
    }
    Some((landmarks.nose_tip().y - eye_y) / span)
}
