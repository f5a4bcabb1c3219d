use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counter name to value, as returned by `get_stats`.
pub type DaemonStats = BTreeMap<String, u64>;

/// Process-wide daemon counters. Created at startup, shared by `Arc`,
/// dropped at shutdown.
#[derive(Debug)]
pub struct StatsRegistry {
    started: Instant,
    requests_served: AtomicU64,
    failures: AtomicU64,
    invalid_requests: AtomicU64,
    encodings_served: AtomicU64,
    active_sessions: AtomicU64,
    attempts_started: AtomicU64,
    attempts_rejected: AtomicU64,
    attempt_log_dropped: AtomicU64,
    frames_skipped: AtomicU64,
    template_cache_hits: AtomicU64,
    template_cache_misses: AtomicU64,
    lockouts_refused: AtomicU64,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests_served: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            invalid_requests: AtomicU64::new(0),
            encodings_served: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            attempts_started: AtomicU64::new(0),
            attempts_rejected: AtomicU64::new(0),
            attempt_log_dropped: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            template_cache_hits: AtomicU64::new(0),
            template_cache_misses: AtomicU64::new(0),
            lockouts_refused: AtomicU64::new(0),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn record_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.invalid_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encoding(&self) {
        self.encodings_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt_rejected(&self) {
        self.attempts_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_log_dropped(&self) {
        self.attempt_log_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frames_skipped(&self, count: usize) {
        self.frames_skipped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_template_hit(&self) {
        self.template_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_template_miss(&self) {
        self.template_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lockout_refused(&self) {
        self.lockouts_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.attempts_started.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DaemonStats {
        let mut stats = DaemonStats::new();
        stats.insert("requests_served".into(), self.requests_served.load(Ordering::Relaxed));
        stats.insert("failures".into(), self.failures.load(Ordering::Relaxed));
        stats.insert("invalid_requests".into(), self.invalid_requests.load(Ordering::Relaxed));
        stats.insert("encodings_served".into(), self.encodings_served.load(Ordering::Relaxed));
        stats.insert("active_sessions".into(), self.active_sessions.load(Ordering::Relaxed));
        stats.insert("attempts_started".into(), self.attempts_started.load(Ordering::Relaxed));
        stats.insert("attempts_rejected".into(), self.attempts_rejected.load(Ordering::Relaxed));
        stats.insert("attempt_log_dropped".into(), self.attempt_log_dropped.load(Ordering::Relaxed));
        stats.insert("frames_skipped".into(), self.frames_skipped.load(Ordering::Relaxed));
        stats.insert("template_cache_hits".into(), self.template_cache_hits.load(Ordering::Relaxed));
        stats.insert("template_cache_misses".into(), self.template_cache_misses.load(Ordering::Relaxed));
        stats.insert("lockouts_refused".into(), self.lockouts_refused.load(Ordering::Relaxed));
        stats.insert("uptime_seconds".into(), self.uptime_secs());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = StatsRegistry::new();
        stats.record_served();
        stats.record_served();
        stats.record_failure();
        stats.session_opened();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot["requests_served"], 2);
        assert_eq!(snapshot["failures"], 1);
        assert_eq!(snapshot["active_sessions"], 1);
        assert!(snapshot.contains_key("uptime_seconds"));
    }

    #[test]
    fn closing_more_sessions_than_opened_saturates() {
        let stats = StatsRegistry::new();
        stats.session_closed();
        assert_eq!(stats.active_sessions(), 0);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = std::sync::Arc::new(StatsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_encoding();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot()["encodings_served"], 8000);
    }
}
