//! Spectral spoof detection.
//!
//! Screens and prints re-sampled by a camera leave periodic interference
//! (moiré) that shows up as isolated peaks away from DC in the 2D spectrum
//! of the face region. Skin texture spreads its energy smoothly instead.

use crate::core::types::{Frame, LandmarkSet};
use rustfft::{num_complex::Complex32, Fft, FftPlanner};
use std::sync::Arc;

const ROI_SIZE: usize = 64;
/// Bins within this radius of DC carry the face shape itself.
const LOW_FREQ_RADIUS: f32 = 8.0;
const RATIO_MIDPOINT: f32 = 12.0;
const RATIO_SCALE: f32 = 2.0;

pub struct FrequencyAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
}

impl Default for FrequencyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrequencyAnalyzer {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        let window = (0..ROI_SIZE)
            .map(|i| {
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / (ROI_SIZE - 1) as f32).cos()
            })
            .collect();
        Self {
            fft: planner.plan_fft_forward(ROI_SIZE),
            window,
        }
    }

    /// Spoof score in [0, 1] for the face region of one frame. Higher means
    /// more screen-like. A degenerate region scores 0.
    pub fn score(&self, frame: &Frame, landmarks: &LandmarkSet) -> f32 {
        let Some(roi) = extract_roi(frame, landmarks) else {
            return 0.0;
        };
        let ratio = self.peak_ratio(&roi);
        1.0 / (1.0 + (-(ratio - RATIO_MIDPOINT) / RATIO_SCALE).exp())
    }

    /// Peak-to-mean magnitude ratio over the high-frequency band.
    fn peak_ratio(&self, roi: &[f32]) -> f32 {
        let n = ROI_SIZE;
        let mean = roi.iter().sum::<f32>() / roi.len() as f32;

        let mut buffer: Vec<Complex32> = roi
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let w = self.window[i / n] * self.window[i % n];
                Complex32::new((v - mean) * w, 0.0)
            })
            .collect();

        // Rows, transpose, rows again.
        self.fft.process(&mut buffer);
        let mut transposed = vec![Complex32::new(0.0, 0.0); n * n];
        for y in 0..n {
            for x in 0..n {
                transposed[x * n + y] = buffer[y * n + x];
            }
        }
        self.fft.process(&mut transposed);

        let mut sum = 0.0f32;
        let mut peak = 0.0f32;
        let mut count = 0usize;
        for u in 0..n {
            for v in 0..n {
                // Distance to DC with wrap-around.
                let du = u.min(n - u) as f32;
                let dv = v.min(n - v) as f32;
                if (du * du + dv * dv).sqrt() <= LOW_FREQ_RADIUS {
                    continue;
                }
                let magnitude = transposed[u * n + v].norm();
                sum += magnitude;
                peak = peak.max(magnitude);
                count += 1;
            }
        }

        let mean_magnitude = sum / count.max(1) as f32;
        if mean_magnitude <= f32::EPSILON {
            return 0.0;
        }
        peak / mean_magnitude
    }
}

/// Area-averaged ROI_SIZE x ROI_SIZE resample of the landmark bounding box.
fn extract_roi(frame: &Frame, landmarks: &LandmarkSet) -> Option<Vec<f32>> {
    let (x1, y1, x2, y2) = landmarks.bbox();
    let x1 = x1.max(0.0);
    let y1 = y1.max(0.0);
    let x2 = x2.min(frame.width as f32);
    let y2 = y2.min(frame.height as f32);
    if x2 - x1 < 8.0 || y2 - y1 < 8.0 {
        return None;
    }

    let step_x = (x2 - x1) / ROI_SIZE as f32;
    let step_y = (y2 - y1) / ROI_SIZE as f32;
    let mut roi = Vec::with_capacity(ROI_SIZE * ROI_SIZE);

    for oy in 0..ROI_SIZE {
        let sy0 = (y1 + oy as f32 * step_y) as u32;
        let sy1 = ((y1 + (oy + 1) as f32 * step_y) as u32).max(sy0 + 1).min(frame.height);
        for ox in 0..ROI_SIZE {
            let sx0 = (x1 + ox as f32 * step_x) as u32;
            let sx1 = ((x1 + (ox + 1) as f32 * step_x) as u32).max(sx0 + 1).min(frame.width);

            let mut total = 0u32;
            let mut count = 0u32;
            for sy in sy0..sy1 {
                for sx in sx0..sx1 {
                    total += frame.pixel(sx, sy) as u32;
                    count += 1;
                }
            }
            roi.push(if count > 0 { total as f32 / count as f32 } else { 0.0 });
        }
    }

    Some(roi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Point;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::SystemTime;

    const SIZE: u32 = 160;

    fn face_box() -> LandmarkSet {
        let mut points = vec![Point::new(16.0, 16.0); 68];
        points[16] = Point::new(144.0, 144.0);
        LandmarkSet::new(points, 1.0).unwrap()
    }

    fn frame_from(f: impl Fn(u32, u32) -> f32) -> Frame {
        let data = (0..SIZE * SIZE)
            .map(|i| f(i % SIZE, i / SIZE).clamp(0.0, 255.0) as u8)
            .collect();
        Frame::new(data, SIZE, SIZE, 0, SystemTime::now()).unwrap()
    }

    fn blob(x: u32, y: u32) -> f32 {
        let dx = x as f32 - 80.0;
        let dy = y as f32 - 80.0;
        70.0 + 90.0 * (-(dx * dx + dy * dy) / (2.0 * 35.0 * 35.0)).exp()
    }

    #[test]
    fn grating_scores_as_screen() {
        let analyzer = FrequencyAnalyzer::new();
        let frame = frame_from(|x, y| blob(x, y) + 40.0 * (2.0 * std::f32::consts::PI * x as f32 / 7.0).sin());
        assert!(analyzer.score(&frame, &face_box()) > 0.9);
    }

    #[test]
    fn noisy_smooth_face_scores_as_natural() {
        let analyzer = FrequencyAnalyzer::new();
        let mut rng = StdRng::seed_from_u64(7);
        let noise: Vec<f32> = (0..SIZE * SIZE).map(|_| rng.gen_range(-12.0..12.0)).collect();
        let frame = frame_from(|x, y| blob(x, y) + noise[(y * SIZE + x) as usize]);
        assert!(analyzer.score(&frame, &face_box()) < 0.2);
    }

    #[test]
    fn degenerate_region_scores_zero() {
        let analyzer = FrequencyAnalyzer::new();
        let frame = frame_from(blob);
        let tiny = LandmarkSet::new(vec![Point::new(5.0, 5.0); 68], 1.0).unwrap();
        assert_eq!(analyzer.score(&frame, &tiny), 0.0);
    }
}
