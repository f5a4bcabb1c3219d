use std::collections::VecDeque;
use std::time::Duration;

const HISTORY: usize = 30;
const DECISION_WINDOW: usize = 10;
const MIN_SAMPLES: usize = 5;
const SCALE_STEP: f32 = 0.8;
const MIN_SCALE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TuningChange {
    Workers(usize),
    Scale(f32),
}

/// Rolling-latency controller for worker slots and detection resolution.
/// Changes only affect frames submitted after them.
#[derive(Debug, Clone)]
pub struct AdaptiveTuner {
    target: Duration,
    max_workers: usize,
    workers: usize,
    scale: f32,
    samples: VecDeque<Duration>,
}

impl AdaptiveTuner {
    pub fn new(max_workers: usize, target: Duration) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            target,
            max_workers,
            workers: max_workers,
            scale: 1.0,
            samples: VecDeque::with_capacity(HISTORY),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn average_latency(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let recent = self.samples.iter().rev().take(DECISION_WINDOW);
        let count = self.samples.len().min(DECISION_WINDOW) as u32;
        Some(recent.sum::<Duration>() / count)
    }

    pub fn record(&mut self, latency: Duration) -> Option<TuningChange> {
        if self.samples.len() == HISTORY {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
        if self.samples.len() < MIN_SAMPLES {
            return None;
        }

        let average = self.average_latency()?;
        let change = if average > self.target {
            self.slow_down()
        } else if average < self.target / 2 {
            self.speed_up()
        } else {
            None
        };

        if let Some(change) = change {
            // Judge the new setting on fresh samples only.
            self.samples.clear();
            tracing::debug!(?change, ?average, target = ?self.target, "pipeline retuned");
        }
        change
    }

    fn slow_down(&mut self) -> Option<TuningChange> {
        if self.workers > 1 {
            self.workers -= 1;
            Some(TuningChange::Workers(self.workers))
        } else if self.scale > MIN_SCALE {
            self.scale = (self.scale * SCALE_STEP).max(MIN_SCALE);
            Some(TuningChange::Scale(self.scale))
        } else {
            None
        }
    }

    fn speed_up(&mut self) -> Option<TuningChange> {
        if self.scale < 1.0 {
            self.scale = (self.scale / SCALE_STEP).min(1.0);
            Some(TuningChange::Scale(self.scale))
        } else if self.workers < self.max_workers {
            self.workers += 1;
            Some(TuningChange::Workers(self.workers))
        } else {
            None
        }
    }
}
