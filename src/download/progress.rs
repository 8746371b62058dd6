//! Throttling of progress writes to the store.

use std::time::{Duration, Instant};

/// Default minimum spacing between persisted progress updates.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Admits a progress tick for persistence only when the downloaded byte
/// count changed and at least `interval` has passed since the last admitted
/// tick.
#[derive(Debug, Clone)]
pub struct ProgressGate {
    interval: Duration,
    last_at: Option<Instant>,
    last_bytes: Option<u64>,
}

impl ProgressGate {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_at: None,
            last_bytes: None,
        }
    }

    /// Returns true when the tick should be written, recording it if so.
    pub fn admit(&mut self, downloaded: u64, now: Instant) -> bool {
        if self.last_bytes == Some(downloaded) {
            return false;
        }
        if let Some(last) = self.last_at
            && now.saturating_duration_since(last) < self.interval
        {
            return false;
        }
        self.last_at = Some(now);
        self.last_bytes = Some(downloaded);
        true
    }
}

impl Default for ProgressGate {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_tick_is_admitted() {
        let mut gate = ProgressGate::default();
        assert!(gate.admit(10, Instant::now()));
    }

    #[test]
    fn test_ticks_inside_interval_are_dropped() {
        let mut gate = ProgressGate::new(Duration::from_millis(500));
        let start = Instant::now();
        assert!(gate.admit(10, start));
        assert!(!gate.admit(20, start + Duration::from_millis(100)));
        assert!(!gate.admit(30, start + Duration::from_millis(499)));
        assert!(gate.admit(40, start + Duration::from_millis(500)));
    }

    #[test]
    fn test_unchanged_bytes_are_dropped_even_after_interval() {
        let mut gate = ProgressGate::new(Duration::from_millis(500));
        let start = Instant::now();
        assert!(gate.admit(10, start));
        assert!(!gate.admit(10, start + Duration::from_secs(5)));
        assert!(gate.admit(11, start + Duration::from_secs(5)));
    }

    #[test]
    fn test_spaced_ticks_each_admitted() {
        let mut gate = ProgressGate::new(Duration::from_millis(500));
        let start = Instant::now();
        let admitted = (1..=3u32)
            .filter(|i| gate.admit(u64::from(*i) * 100, start + Duration::from_millis(600) * *i))
            .count();
        assert_eq!(admitted, 3);
    }
}
