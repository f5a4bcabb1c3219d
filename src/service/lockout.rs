use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Failures {
    count: u32,
    last: Instant,
}

/// Per-user failure counter. A user reaching `max_failures` is refused new
/// attempts until `window` has passed since their last failure. A failure
/// after a quiet `window` starts the count over.
pub struct LockoutTracker {
    max_failures: u32,
    window: Duration,
    users: Mutex<HashMap<String, Failures>>,
}

impl LockoutTracker {
    /// `max_failures` of zero disables lockout.
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self { max_failures, window, users: Mutex::new(HashMap::new()) }
    }

    fn users(&self) -> MutexGuard<'_, HashMap<String, Failures>> {
        self.users.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.max_failures > 0
    }

    pub fn record_failure(&self, user: &str) {
        if !self.is_enabled() {
            return;
        }
        let now = Instant::now();
        let mut users = self.users();
        let entry = users.entry(user.to_string()).or_insert(Failures { count: 0, last: now });
        if now.duration_since(entry.last) > self.window {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last = now;
        if entry.count == self.max_failures {
            tracing::warn!(user, failures = entry.count, "User locked out");
        }
    }

    /// Time left on the user's lockout, if any.
    pub fn locked_for(&self, user: &str) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }
        let mut users = self.users();
        let entry = users.get(user)?;
        if entry.count < self.max_failures {
            return None;
        }
        let elapsed = entry.last.elapsed();
        if elapsed < self.window {
            Some(self.window - elapsed)
        } else {
            users.remove(user);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockout_starts_at_the_limit() {
        let tracker = LockoutTracker::new(3, Duration::from_secs(60));
        tracker.record_failure("alice");
        tracker.record_failure("alice");
        assert!(tracker.locked_for("alice").is_none());
        tracker.record_failure("alice");
        let remaining = tracker.locked_for("alice").unwrap();
        assert!(remaining > Duration::from_secs(55));
        assert!(tracker.locked_for("bob").is_none());
    }

    #[test]
    fn lockout_lifts_after_the_window() {
        let tracker = LockoutTracker::new(1, Duration::from_millis(100));
        tracker.record_failure("alice");
        assert!(tracker.locked_for("alice").is_some());
        std::thread::sleep(Duration::from_millis(150));
        assert!(tracker.locked_for("alice").is_none());
        // The count started over.
        tracker.record_failure("alice");
        assert!(tracker.locked_for("alice").is_some());
    }

    #[test]
    fn quiet_window_resets_the_count() {
        let tracker = LockoutTracker::new(2, Duration::from_millis(100));
        tracker.record_failure("alice");
        std::thread::sleep(Duration::from_millis(150));
        tracker.record_failure("alice");
        assert!(tracker.locked_for("alice").is_none());
    }

    #[test]
    fn zero_limit_disables_lockout() {
        let tracker = LockoutTracker::new(0, Duration::from_secs(60));
        for _ in 0..10 {
            tracker.record_failure("alice");
        }
        assert!(tracker.locked_for("alice").is_none());
    }
}
