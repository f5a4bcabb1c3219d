//! Deterministic stand-in for the ONNX models.
//!
//! Treats the bounding box of bright pixels as the face and lays a fixed
//! 68-point template over it. Used by the daemon's `--synthetic` dev flag and
//! by the integration tests; never by a production install.

use crate::common::Result;
use crate::core::model::FaceModel;
use crate::core::types::{FaceDescriptor, Frame, LandmarkSet, Point};

/// Pixels brighter than this belong to the face.
const FACE_THRESHOLD: u8 = 100;
const MIN_FACE_PIXELS: usize = 64;
const GRID: usize = 4;

#[derive(Debug, Default, Clone, Copy)]
pub struct BlobFaceModel;

impl BlobFaceModel {
    pub fn new() -> Self {
        Self
    }
}

/// Normalized 68-point layout over a unit square, eyes open.
fn template() -> Vec<Point> {
    let mut points = Vec::with_capacity(LandmarkSet::POINT_COUNT);
    // jaw 0..17, a U from the left temple through the chin
    for i in 0..17 {
        let t = i as f32 / 16.0;
        let angle = std::f32::consts::PI * t;
        points.push(Point::new(0.5 - 0.5 * angle.cos(), 0.3 + 0.7 * angle.sin()));
    }
    // brows 17..27
    for i in 0..10 {
        let x = if i < 5 { 0.15 + i as f32 * 0.06 } else { 0.55 + (i - 5) as f32 * 0.06 };
        points.push(Point::new(x, 0.22));
    }
    // nose bridge 27..31, then nostrils 31..36
    for i in 0..4 {
        points.push(Point::new(0.5, 0.35 + i as f32 * 0.07));
    }
    for i in 0..5 {
        points.push(Point::new(0.42 + i as f32 * 0.04, 0.6));
    }
    // eyes 36..48, aspect ratio about 0.33
    for cx in [0.3f32, 0.7] {
        let cy = 0.35;
        points.push(Point::new(cx - 0.06, cy));
        points.push(Point::new(cx - 0.02, cy - 0.02));
        points.push(Point::new(cx + 0.02, cy - 0.02));
        points.push(Point::new(cx + 0.06, cy));
        points.push(Point::new(cx + 0.02, cy + 0.02));
        points.push(Point::new(cx - 0.02, cy + 0.02));
    }
    // mouth 48..68
    for i in 0..20 {
        let angle = 2.0 * std::f32::consts::PI * i as f32 / 20.0;
        let radius = if i < 12 { 0.15 } else { 0.08 };
        points.push(Point::new(0.5 + radius * angle.cos(), 0.78 + 0.5 * radius * angle.sin()));
    }
    points
}

fn face_box(frame: &Frame) -> Option<(u32, u32, u32, u32)> {
    let mut count = 0usize;
    let (mut x1, mut y1, mut x2, mut y2) = (u32::MAX, u32::MAX, 0u32, 0u32);
    for y in 0..frame.height {
        for x in 0..frame.width {
            if frame.pixel(x, y) > FACE_THRESHOLD {
                count += 1;
                x1 = x1.min(x);
                y1 = y1.min(y);
                x2 = x2.max(x);
                y2 = y2.max(y);
            }
        }
    }
    (count >= MIN_FACE_PIXELS && x2 > x1 && y2 > y1).then_some((x1, y1, x2, y2))
}

impl FaceModel for BlobFaceModel {
    fn detect(&self, frame: &Frame) -> Result<Vec<LandmarkSet>> {
        frame.validate()?;
        let Some((x1, y1, x2, y2)) = face_box(frame) else {
            return Ok(Vec::new());
        };
        let width = (x2 - x1) as f32;
        let height = (y2 - y1) as f32;
        let points = template()
            .into_iter()
            .map(|p| Point::new(x1 as f32 + p.x * width, y1 as f32 + p.y * height))
            .collect();
        Ok(vec![LandmarkSet::new(points, 0.99)?])
    }

    /// Unit-length grid of mean intensities over the landmark box.
    fn encode(&self, frame: &Frame, landmarks: &LandmarkSet) -> Result<FaceDescriptor> {
        frame.validate()?;
        let (x1, y1, x2, y2) = landmarks.bbox();
        let x1 = x1.clamp(0.0, frame.width as f32 - 1.0);
        let y1 = y1.clamp(0.0, frame.height as f32 - 1.0);
        let x2 = x2.clamp(x1 + 1.0, frame.width as f32);
        let y2 = y2.clamp(y1 + 1.0, frame.height as f32);
        let cell_w = (x2 - x1) / GRID as f32;
        let cell_h = (y2 - y1) / GRID as f32;

        let mut values = Vec::with_capacity(GRID * GRID);
        for gy in 0..GRID {
            for gx in 0..GRID {
                let sx0 = (x1 + gx as f32 * cell_w) as u32;
                let sy0 = (y1 + gy as f32 * cell_h) as u32;
                let sx1 = ((x1 + (gx + 1) as f32 * cell_w) as u32).clamp(sx0 + 1, frame.width);
                let sy1 = ((y1 + (gy + 1) as f32 * cell_h) as u32).clamp(sy0 + 1, frame.height);
                let mut total = 0u64;
                let mut count = 0u64;
                for y in sy0..sy1 {
                    for x in sx0..sx1 {
                        total += frame.pixel(x, y) as u64;
                        count += 1;
                    }
                }
                values.push(total as f32 / count.max(1) as f32);
            }
        }

        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            values.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(FaceDescriptor(values))
    }
}
