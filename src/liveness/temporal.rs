use crate::core::types::LandmarkSet;

/// Mean per-step landmark displacement (in inter-ocular units) below which
/// the window counts as frozen.
const STATIC_MOTION: f32 = 0.002;
/// Micro-motion level of a live, resting face.
const LIVE_MOTION: f32 = 0.01;
/// Above this the landmarks are jumping between unrelated faces.
const CHAOTIC_MOTION: f32 = 0.25;
/// Two sets closer than this (inter-ocular units) are the same pose.
const REPEAT_TOLERANCE: f32 = 1e-3;

const STATIC_SCORE: f32 = 1.0;
const LOOP_SCORE: f32 = 0.95;
const CHAOTIC_SCORE: f32 = 0.8;

/// What the window of landmarks looked like.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionPattern {
    Static,
    Looped { period: usize },
    Chaotic,
    Natural { motion: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemporalReport {
    pub pattern: MotionPattern,
    /// Spoof score in [0, 1]; higher means less live.
    pub score: f32,
}

#[derive(Debug, Default)]
pub struct TemporalAnalyzer;

impl TemporalAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, window: &[&LandmarkSet]) -> TemporalReport {
        if window.len() < 2 {
            return TemporalReport { pattern: MotionPattern::Static, score: STATIC_SCORE };
        }

        let scale = window
            .iter()
            .map(|set| set.inter_ocular())
            .sum::<f32>()
            / window.len() as f32;
        if scale <= f32::EPSILON {
            return TemporalReport { pattern: MotionPattern::Static, score: STATIC_SCORE };
        }

        let motion = window
            .windows(2)
            .map(|pair| mean_displacement(pair[0], pair[1]) / scale)
            .sum::<f32>()
            / (window.len() - 1) as f32;

        let pattern = if motion < STATIC_MOTION {
            MotionPattern::Static
        } else if let Some(period) = loop_period(window, scale) {
            MotionPattern::Looped { period }
        } else if motion > CHAOTIC_MOTION {
            MotionPattern::Chaotic
        } else {
            MotionPattern::Natural { motion }
        };

        let score = match pattern {
            MotionPattern::Static => STATIC_SCORE,
            MotionPattern::Looped { .. } => LOOP_SCORE,
            MotionPattern::Chaotic => CHAOTIC_SCORE,
            MotionPattern::Natural { motion } => 1.0 - (motion / LIVE_MOTION).min(1.0),
        };

        tracing::trace!(?pattern, score, "temporal analysis");
        TemporalReport { pattern, score }
    }
}

fn mean_displacement(a: &LandmarkSet, b: &LandmarkSet) -> f32 {
    let n = a.points.len().min(b.points.len()).max(1);
    a.points
        .iter()
        .zip(&b.points)
        .map(|(p, q)| p.distance(q))
        .sum::<f32>()
        / n as f32
}

fn max_displacement(a: &LandmarkSet, b: &LandmarkSet) -> f32 {
    a.points
        .iter()
        .zip(&b.points)
        .map(|(p, q)| p.distance(q))
        .fold(0.0, f32::max)
}

/// Smallest period p such that every set repeats the one p frames earlier.
/// Replayed clips looped by a screen show this; live faces never repeat exactly.
fn loop_period(window: &[&LandmarkSet], scale: f32) -> Option<usize> {
    (1..=window.len() / 2).find(|&period| {
        (period..window.len())
            .all(|i| max_displacement(window[i], window[i - period]) / scale < REPEAT_TOLERANCE)
    })
}
