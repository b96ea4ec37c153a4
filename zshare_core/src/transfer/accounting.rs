//! Running transfer statistics, kept apart from how often anyone looks at them.

use std::time::{Duration, Instant};

/// Bitrate samples closer together than this are merged into the next one
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Weight of the newest sample in the moving average
const BITRATE_SMOOTHING: f64 = 0.3;

/// `floor(done * 100 / total)`, capped at 100. An empty file is complete.
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = u128::from(done) * 100 / u128::from(total);
    pct.min(100) as u8
}

/// Throttle for observer notifications: fire once progress has moved `step`
/// points past the last notified value, and always on reaching 100.
pub fn should_notify(last_notified: u8, progress: u8, step: u8) -> bool {
    if progress >= 100 {
        return last_notified < 100;
    }
    progress >= last_notified.saturating_add(step)
}

#[derive(Debug, Clone)]
pub struct TransferStats {
    total: u64,
    done: u64,
    started_at: Instant,
    sample_at: Instant,
    sample_bytes: u64,
    bitrate: f64,
    last_notified: u8,
    step: u8,
}

impl TransferStats {
    pub fn new(total: u64, step: u8, now: Instant) -> Self {
        Self {
            total,
            done: 0,
            started_at: now,
            sample_at: now,
            sample_bytes: 0,
            bitrate: 0.0,
            last_notified: 0,
            step: step.max(1),
        }
    }

    /// Account for `bytes` moved at `now`
    pub fn record(&mut self, bytes: u64, now: Instant) {
        self.done = self.done.saturating_add(bytes);

        let elapsed = now.saturating_duration_since(self.sample_at);
        if elapsed < MIN_SAMPLE_INTERVAL {
            return;
        }
        let instant_rate = (self.done - self.sample_bytes) as f64 / elapsed.as_secs_f64();
        self.bitrate = if self.bitrate == 0.0 {
            instant_rate
        } else {
            BITRATE_SMOOTHING * instant_rate + (1.0 - BITRATE_SMOOTHING) * self.bitrate
        };
        self.sample_at = now;
        self.sample_bytes = self.done;
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn progress(&self) -> u8 {
        progress_percent(self.done, self.total)
    }

    /// Smoothed bytes per second. Before the first full sample window this
    /// falls back to the overall average.
    pub fn bitrate(&self, now: Instant) -> f64 {
        if self.bitrate > 0.0 {
            return self.bitrate;
        }
        let elapsed = now.saturating_duration_since(self.started_at).as_secs_f64();
        if elapsed < MIN_SAMPLE_INTERVAL.as_secs_f64() {
            0.0
        } else {
            self.done as f64 / elapsed
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// True when observers should hear about the current progress; remembers
    /// that they did.
    pub fn take_notification(&mut self) -> bool {
        let progress = self.progress();
        if should_notify(self.last_notified, progress, self.step) {
            self.last_notified = progress;
            true
        } else {
            false
        }
    }
}
