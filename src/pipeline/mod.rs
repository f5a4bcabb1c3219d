//! Per-attempt frame pipeline.
//!
//! Frames are numbered in capture order, fanned out to a bounded pool of
//! worker threads for detection, frequency scoring and encoding, and handed
//! back strictly in submission order. A slot gate bounds the frames in
//! flight; when every slot is taken, acquisition blocks instead of dropping.
//! Frames failing the quality filter skip the detector entirely.

pub mod capture;
pub mod quality;
pub mod source;
pub mod tuner;

pub use capture::{CaptureFeed, FeedSender};
pub use quality::{FrameQuality, QualityThresholds};
pub use source::{Capture, FrameSource};
pub use tuner::{AdaptiveTuner, TuningChange};

use crate::common::{Config, FaceAuthError, Result};
use crate::core::model::FaceModel;
use crate::core::types::{FaceDescriptor, Frame, LandmarkSet};
use crate::liveness::engine::Observation;
use crate::liveness::frequency::FrequencyAnalyzer;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use image::imageops::FilterType;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

const RESULT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_workers: usize,
    pub target_latency: Duration,
    pub encode_frames: bool,
    pub frequency_scores: bool,
    /// Frames taller than this are downscaled for detection.
    pub max_height: u32,
    pub quality: Option<QualityThresholds>,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_workers: config.pipeline.max_workers,
            target_latency: Duration::from_millis(config.pipeline.target_latency_ms),
            encode_frames: config.pipeline.encode_frames,
            frequency_scores: config.security.liveness_check && config.security.frequency_analysis,
            max_height: config.video.max_height,
            quality: QualityThresholds::from_config(config),
        }
    }
}

/// Everything the workers learned about one frame.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub sequence: u64,
    pub timestamp: SystemTime,
    pub faces: usize,
    /// Best face, in original frame coordinates.
    pub landmarks: Option<LandmarkSet>,
    pub descriptor: Option<FaceDescriptor>,
    pub moire_score: Option<f32>,
    pub latency: Duration,
    /// Refused by the quality filter; never reached the detector.
    pub skipped: bool,
    pub frame: Frame,
}

impl FrameResult {
    pub fn observation(&self) -> Observation {
        Observation {
            sequence: self.sequence,
            timestamp: self.timestamp,
            landmarks: self.landmarks.clone(),
            moire_score: self.moire_score,
        }
    }
}

struct GateState {
    in_use: usize,
    limit: usize,
    cancelled: bool,
}

/// Counting semaphore over worker slots with an adjustable limit.
struct SlotGate {
    state: Mutex<GateState>,
    freed: Condvar,
}

impl SlotGate {
    fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(GateState { in_use: 0, limit: limit.max(1), cancelled: false }),
            freed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks until a slot is free. False once cancelled.
    fn acquire(&self) -> bool {
        let mut state = self.lock();
        while !state.cancelled && state.in_use >= state.limit {
            state = self.freed.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.cancelled {
            return false;
        }
        state.in_use += 1;
        true
    }

    fn release(&self) {
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        self.freed.notify_all();
    }

    fn set_limit(&self, limit: usize) {
        self.lock().limit = limit.max(1);
        self.freed.notify_all();
    }

    fn cancel(&self) {
        self.lock().cancelled = true;
        self.freed.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    fn in_use(&self) -> usize {
        self.lock().in_use
    }
}

/// Cancels a pipeline from another thread.
#[derive(Clone)]
pub struct CancelToken(Arc<SlotGate>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

struct Job {
    frame: Frame,
    scale: f32,
}

struct WorkerContext {
    model: Arc<dyn FaceModel>,
    frequency: Arc<FrequencyAnalyzer>,
    gate: Arc<SlotGate>,
    results: Sender<FrameResult>,
    encode_frames: bool,
    frequency_scores: bool,
    quality: Option<QualityThresholds>,
}

impl WorkerContext {
    fn run(self, jobs: Receiver<Job>) {
        for job in jobs.iter() {
            if self.gate.is_cancelled() {
                self.gate.release();
                continue;
            }
            let result = self.process(job);
            let sent = self.results.send(result);
            self.gate.release();
            if sent.is_err() {
                break;
            }
        }
    }

    fn process(&self, job: Job) -> FrameResult {
        let started = Instant::now();
        let frame = job.frame;

        if let Some(thresholds) = &self.quality {
            let quality = FrameQuality::measure(&frame);
            if !thresholds.accepts(&quality) {
                tracing::trace!(sequence = frame.sequence, ?quality, "Frame skipped");
                return FrameResult {
                    sequence: frame.sequence,
                    timestamp: frame.timestamp,
                    faces: 0,
                    landmarks: None,
                    descriptor: None,
                    moire_score: None,
                    latency: started.elapsed(),
                    skipped: true,
                    frame,
                };
            }
        }

        let faces = detect_scaled(self.model.as_ref(), &frame, job.scale).unwrap_or_else(|e| {
            tracing::warn!(sequence = frame.sequence, "Detection failed: {}", e);
            Vec::new()
        });
        let best = faces.first().cloned();

        let moire_score = match (&best, self.frequency_scores) {
            (Some(landmarks), true) => Some(self.frequency.score(&frame, landmarks)),
            _ => None,
        };
        let descriptor = match (&best, self.encode_frames) {
            (Some(landmarks), true) => match self.model.encode(&frame, landmarks) {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    tracing::warn!(sequence = frame.sequence, "Encoding failed: {}", e);
                    None
                }
            },
            _ => None,
        };

        FrameResult {
            sequence: frame.sequence,
            timestamp: frame.timestamp,
            faces: faces.len(),
            landmarks: best,
            descriptor,
            moire_score,
            latency: started.elapsed(),
            skipped: false,
            frame,
        }
    }
}

/// Runs detection on a downscaled copy and maps landmarks back.
fn detect_scaled(model: &dyn FaceModel, frame: &Frame, scale: f32) -> Result<Vec<LandmarkSet>> {
    if scale >= 0.999 {
        return model.detect(frame);
    }

    let width = ((frame.width as f32 * scale).round() as u32).max(1);
    let height = ((frame.height as f32 * scale).round() as u32).max(1);
    let resized = image::imageops::resize(&frame.to_gray_image()?, width, height, FilterType::Triangle);
    let small = Frame {
        data: resized.into_raw(),
        width,
        height,
        sequence: frame.sequence,
        timestamp: frame.timestamp,
    };

    let inverse = frame.width as f32 / width as f32;
    Ok(model.detect(&small)?.iter().map(|set| set.scaled(inverse)).collect())
}

pub struct FramePipeline {
    settings: PipelineSettings,
    jobs: Option<Sender<Job>>,
    results: Receiver<FrameResult>,
    workers: Vec<JoinHandle<()>>,
    gate: Arc<SlotGate>,
    tuner: AdaptiveTuner,
    /// In-flight sequences in submission order.
    pending: VecDeque<u64>,
    ready: BTreeMap<u64, FrameResult>,
    last_submitted: Option<u64>,
}

impl FramePipeline {
    pub fn new(model: Arc<dyn FaceModel>, frequency: Arc<FrequencyAnalyzer>, settings: PipelineSettings) -> Result<Self> {
        let hardware = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let threads = settings.max_workers.min(hardware).max(1);

        let gate = Arc::new(SlotGate::new(threads));
        let (job_tx, job_rx) = bounded::<Job>(threads);
        let (result_tx, result_rx) = unbounded();

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let context = WorkerContext {
                model: Arc::clone(&model),
                frequency: Arc::clone(&frequency),
                gate: Arc::clone(&gate),
                results: result_tx.clone(),
                encode_frames: settings.encode_frames,
                frequency_scores: settings.frequency_scores,
                quality: settings.quality,
            };
            let jobs = job_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("faceguard-frame-{}", i))
                .spawn(move || context.run(jobs))?;
            workers.push(handle);
        }
        tracing::debug!(threads, "frame pipeline started");

        Ok(Self {
            tuner: AdaptiveTuner::new(threads, settings.target_latency),
            settings,
            jobs: Some(job_tx),
            results: result_rx,
            workers,
            gate,
            pending: VecDeque::new(),
            ready: BTreeMap::new(),
            last_submitted: None,
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken(Arc::clone(&self.gate))
    }

    /// Cancels and drops every buffered frame and result.
    pub fn cancel(&mut self) {
        self.gate.cancel();
        self.pending.clear();
        self.ready.clear();
    }

    /// Frames currently occupying a worker slot.
    pub fn in_flight(&self) -> usize {
        self.gate.in_use()
    }

    pub fn worker_threads(&self) -> usize {
        self.workers.len()
    }

    /// Blocks for a free slot, then hands the frame to the workers.
    pub fn submit(&mut self, frame: Frame) -> Result<()> {
        if let Some(last) = self.last_submitted {
            if frame.sequence <= last {
                return Err(FaceAuthError::InvalidRequest(format!(
                    "frame {} submitted after frame {}", frame.sequence, last
                )));
            }
        }
        frame.validate()?;
        if !self.gate.acquire() {
            return Err(FaceAuthError::AttemptCancelled);
        }
        self.dispatch(frame)
    }

    // Caller holds a slot.
    fn dispatch(&mut self, frame: Frame) -> Result<()> {
        let Some(jobs) = self.jobs.as_ref() else {
            self.gate.release();
            return Err(FaceAuthError::Other(anyhow::anyhow!("frame workers stopped")));
        };

        let fit = (self.settings.max_height as f32 / frame.height as f32).min(1.0);
        let scale = self.tuner.scale() * fit;
        let sequence = frame.sequence;

        if jobs.send(Job { frame, scale }).is_err() {
            self.gate.release();
            return Err(FaceAuthError::Other(anyhow::anyhow!("frame workers stopped")));
        }
        self.pending.push_back(sequence);
        self.last_submitted = Some(sequence);
        Ok(())
    }

    fn absorb(&mut self, result: FrameResult) {
        if !self.pending.contains(&result.sequence) {
            return;
        }
        if let Some(TuningChange::Workers(limit)) = self.tuner.record(result.latency) {
            self.gate.set_limit(limit);
        }
        self.ready.insert(result.sequence, result);
    }

    fn pop_in_order(&mut self) -> Vec<FrameResult> {
        let mut out = Vec::new();
        while let Some(sequence) = self.pending.front().copied() {
            match self.ready.remove(&sequence) {
                Some(result) => {
                    self.pending.pop_front();
                    out.push(result);
                }
                None => break,
            }
        }
        out
    }

    /// Results whose predecessors are all done. Never blocks.
    pub fn drain_ready(&mut self) -> Vec<FrameResult> {
        while let Ok(result) = self.results.try_recv() {
            self.absorb(result);
        }
        self.pop_in_order()
    }

    /// Waits for everything in flight.
    pub fn finish(&mut self) -> Result<Vec<FrameResult>> {
        let mut out = self.drain_ready();
        while !self.pending.is_empty() {
            if self.gate.is_cancelled() {
                self.cancel();
                return Err(FaceAuthError::AttemptCancelled);
            }
            match self.results.recv_timeout(RESULT_POLL) {
                Ok(result) => {
                    self.absorb(result);
                    out.extend(self.pop_in_order());
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(FaceAuthError::Other(anyhow::anyhow!("frame workers stopped")));
                }
            }
        }
        Ok(out)
    }

    /// Processes already numbered frames, returning results in order.
    pub fn process_batch(&mut self, frames: Vec<Frame>) -> Result<Vec<FrameResult>> {
        let mut out = Vec::with_capacity(frames.len());
        for frame in frames {
            self.submit(frame)?;
            out.extend(self.drain_ready());
        }
        out.extend(self.finish()?);
        Ok(out)
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.gate.cancel();
        self.jobs.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
