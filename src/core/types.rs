use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use crate::common::{FaceAuthError, Result};

/// One grayscale camera capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture-order number, strictly increasing within an attempt.
    pub sequence: u64,
    pub timestamp: SystemTime,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64, timestamp: SystemTime) -> Result<Self> {
        let frame = Self { data, width, height, sequence, timestamp };
        frame.validate()?;
        Ok(frame)
    }

    pub fn from_image(image: &DynamicImage, sequence: u64, timestamp: SystemTime) -> Self {
        let gray = image.to_luma8();
        let (width, height) = gray.dimensions();
        Self { data: gray.into_raw(), width, height, sequence, timestamp }
    }

    /// Checks the buffer length against the dimensions. Frames arriving over
    /// the socket go through this before any model sees them.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(FaceAuthError::InvalidRequest(format!(
                "frame {} has empty dimensions {}x{}", self.sequence, self.width, self.height
            )));
        }
        let expected = self.width as usize * self.height as usize;
        if self.data.len() != expected {
            return Err(FaceAuthError::InvalidRequest(format!(
                "frame {} carries {} bytes, expected {} for {}x{}",
                self.sequence, self.data.len(), expected, self.width, self.height
            )));
        }
        Ok(())
    }

    pub fn to_gray_image(&self) -> Result<GrayImage> {
        GrayImage::from_raw(self.width, self.height, self.data.clone()).ok_or_else(|| {
            FaceAuthError::InvalidRequest(format!("frame {} buffer does not match its size", self.sequence))
        })
    }

    pub fn to_image(&self) -> Result<DynamicImage> {
        Ok(DynamicImage::ImageLuma8(self.to_gray_image()?))
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// Time elapsed from `earlier` to this frame, zero if the clock went backwards.
    pub fn since(&self, earlier: SystemTime) -> Duration {
        self.timestamp.duration_since(earlier).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Facial keypoints of one face in the 68-point layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSet {
    pub points: Vec<Point>,
    pub confidence: f32,
}

impl LandmarkSet {
    pub const POINT_COUNT: usize = 68;

    const JAW_LEFT: usize = 0;
    const CHIN: usize = 8;
    const JAW_RIGHT: usize = 16;
    const NOSE_TIP: usize = 30;
    const LEFT_EYE: std::ops::Range<usize> = 36..42;
    const RIGHT_EYE: std::ops::Range<usize> = 42..48;

    pub fn new(points: Vec<Point>, confidence: f32) -> Result<Self> {
        if points.len() != Self::POINT_COUNT {
            return Err(FaceAuthError::InvalidRequest(format!(
                "landmark set has {} points, expected {}", points.len(), Self::POINT_COUNT
            )));
        }
        Ok(Self { points, confidence })
    }

    pub fn validate(&self) -> Result<()> {
        if self.points.len() != Self::POINT_COUNT {
            return Err(FaceAuthError::InvalidRequest(format!(
                "landmark set has {} points, expected {}", self.points.len(), Self::POINT_COUNT
            )));
        }
        if self.points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(FaceAuthError::InvalidRequest("landmark set has non-finite points".into()));
        }
        Ok(())
    }

    pub fn left_eye(&self) -> &[Point] {
        &self.points[Self::LEFT_EYE]
    }

    pub fn right_eye(&self) -> &[Point] {
        &self.points[Self::RIGHT_EYE]
    }

    pub fn nose_tip(&self) -> Point {
        self.points[Self::NOSE_TIP]
    }

    pub fn chin(&self) -> Point {
        self.points[Self::CHIN]
    }

    pub fn jaw_left(&self) -> Point {
        self.points[Self::JAW_LEFT]
    }

    pub fn jaw_right(&self) -> Point {
        self.points[Self::JAW_RIGHT]
    }

    pub fn eye_center(eye: &[Point]) -> Point {
        let n = eye.len().max(1) as f32;
        let (sx, sy) = eye.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
        Point::new(sx / n, sy / n)
    }

    pub fn inter_ocular(&self) -> f32 {
        Self::eye_center(self.left_eye()).distance(&Self::eye_center(self.right_eye()))
    }

    /// (min_x, min_y, max_x, max_y) over all points.
    pub fn bbox(&self) -> (f32, f32, f32, f32) {
        self.points.iter().fold(
            (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
            |(x1, y1, x2, y2), p| (x1.min(p.x), y1.min(p.y), x2.max(p.x), y2.max(p.y)),
        )
    }

    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            points: self.points.iter().map(|p| Point::new(p.x * factor, p.y * factor)).collect(),
            confidence: self.confidence,
        }
    }
}

/// Fixed-length embedding for one face in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDescriptor(pub Vec<f32>);

impl FaceDescriptor {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Euclidean distance, the metric `video.certainty` is expressed in (scaled by 10).
    pub fn distance(&self, other: &FaceDescriptor) -> f32 {
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
