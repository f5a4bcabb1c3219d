use std::time::SystemTime;
use crate::common::{FaceAuthError, Result};
use crate::core::types::Frame;

/// A raw grayscale capture before the pipeline numbers it.
#[derive(Debug, Clone)]
pub struct Capture {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: SystemTime,
}

impl Capture {
    pub fn into_frame(self, sequence: u64) -> Result<Frame> {
        Frame::new(self.data, self.width, self.height, sequence, self.timestamp)
    }
}

/// Where frames come from. `Ok(None)` means the source is exhausted.
pub trait FrameSource {
    fn next_capture(&mut self) -> Result<Option<Capture>>;
}

/// Convert packed YUYV (4:2:2) to grayscale by keeping the Y bytes.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FaceAuthError::Camera(format!(
            "YUYV buffer too short: expected {}, got {}", expected, yuyv.len()
        )));
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// In-memory source for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct VecSource {
    captures: std::collections::VecDeque<Capture>,
}

#[cfg(test)]
impl VecSource {
    pub fn new<I: IntoIterator<Item = Capture>>(captures: I) -> Self {
        Self { captures: captures.into_iter().collect() }
    }
}

#[cfg(test)]
impl FrameSource for VecSource {
    fn next_capture(&mut self) -> Result<Option<Capture>> {
        Ok(self.captures.pop_front())
    }
}
