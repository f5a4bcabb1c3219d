use crate::common::Config;
use crate::core::types::Frame;

/// Whole-frame statistics used to skip frames not worth a detector pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameQuality {
    /// Mean intensity, 0..=255.
    pub brightness: f32,
    /// Standard deviation of intensity.
    pub contrast: f32,
    /// Variance of the 4-neighbour Laplacian. Low means blurred.
    pub sharpness: f32,
}

impl FrameQuality {
    pub fn measure(frame: &Frame) -> Self {
        let n = frame.data.len().max(1) as f64;
        let mean = frame.data.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = frame.data.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;

        Self {
            brightness: mean as f32,
            contrast: variance.sqrt() as f32,
            sharpness: laplacian_variance(frame) as f32,
        }
    }
}

fn laplacian_variance(frame: &Frame) -> f64 {
    let (w, h) = (frame.width as usize, frame.height as usize);
    if w < 3 || h < 3 {
        return 0.0;
    }

    let at = |x: usize, y: usize| frame.data[y * w + x] as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += lap;
            sum_sq += lap * lap;
        }
    }
    let count = ((w - 2) * (h - 2)) as f64;
    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    pub min_brightness: f32,
    pub max_brightness: f32,
    pub min_contrast: f32,
    pub min_sharpness: f32,
}

impl QualityThresholds {
    /// None when the filter is switched off.
    pub fn from_config(config: &Config) -> Option<Self> {
        let pipeline = &config.pipeline;
        pipeline.quality_filter.then_some(Self {
            min_brightness: pipeline.min_brightness,
            max_brightness: pipeline.max_brightness,
            min_contrast: pipeline.min_contrast,
            min_sharpness: pipeline.min_sharpness,
        })
    }

    pub fn accepts(&self, quality: &FrameQuality) -> bool {
        quality.brightness >= self.min_brightness
            && quality.brightness <= self.max_brightness
            && quality.contrast >= self.min_contrast
            && quality.sharpness >= self.min_sharpness
    }
}
