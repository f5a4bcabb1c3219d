use crate::common::{FaceAuthError, Result};
use crate::core::types::Frame;
use crate::pipeline::source::FrameSource;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Sending half handed to the capture thread.
pub struct FeedSender {
    frames: Sender<Result<Frame>>,
    max_frames: usize,
}

impl FeedSender {
    /// Numbers captures from 1 and forwards them until the source ends,
    /// `max_frames` were sent, or the consumer hung up.
    pub fn pump(&self, source: &mut dyn FrameSource) -> Result<()> {
        let mut sequence = 0u64;
        while (sequence as usize) < self.max_frames {
            let Some(capture) = source.next_capture()? else {
                break;
            };
            sequence += 1;
            if self.frames.send(capture.into_frame(sequence)).is_err() {
                tracing::debug!(sequence, "Capture consumer gone");
                break;
            }
        }
        Ok(())
    }
}

/// Captures on a dedicated thread so the camera keeps running while the
/// previous batch is being evaluated.
pub struct CaptureFeed {
    frames: Option<Receiver<Result<Frame>>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureFeed {
    /// `run` opens the source on the capture thread and pumps it. At most
    /// `depth` frames wait for the consumer; beyond that the capture thread
    /// blocks.
    pub fn start<F>(depth: usize, max_frames: usize, run: F) -> Result<Self>
    where
        F: FnOnce(&FeedSender) -> Result<()> + Send + 'static,
    {
        let (tx, rx) = bounded(depth.max(1));
        let thread = thread::Builder::new().name("faceguard-capture".into()).spawn(move || {
            let feed = FeedSender { frames: tx, max_frames };
            if let Err(e) = run(&feed) {
                tracing::warn!("Capture stopped: {}", e);
                let _ = feed.frames.send(Err(e));
            }
        })?;
        Ok(Self { frames: Some(rx), thread: Some(thread) })
    }

    /// Up to `max` frames in capture order. Blocks for the first one; empty
    /// once the source is exhausted.
    pub fn next_batch(&mut self, max: usize) -> Result<Vec<Frame>> {
        let Some(frames) = self.frames.as_ref() else {
            return Ok(Vec::new());
        };
        let mut batch = Vec::with_capacity(max);
        while batch.len() < max {
            match frames.recv() {
                Ok(frame) => batch.push(frame?),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    /// Stops capturing and waits for the thread.
    pub fn stop(&mut self) -> Result<()> {
        self.frames.take();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| FaceAuthError::Camera("capture thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for CaptureFeed {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
