use std::path::PathBuf;
use std::time::Duration;

/// Resolved rate-threshold parameters for one leaky bucket.
///
/// A `capacity` of zero disables the bucket entirely: it never signals and
/// renders as "not enabled". When `capacity > 0`, `agetime` must be non-zero
/// (enforced at config resolution).
#[derive(Debug, Clone, Default)]
pub struct BucketConfig {
    /// Credits required within the window for the bucket to signal.
    pub capacity: u32,
    /// Sliding window over which credits age out.
    pub agetime: Duration,
    /// Emit the threshold message through the log on each crossing.
    pub log: bool,
    /// User command to run on each crossing.
    pub trigger: Option<PathBuf>,
}

impl BucketConfig {
    /// Age time in whole seconds, matching event timestamps.
    pub fn agetime_secs(&self) -> i64 {
        self.agetime.as_secs() as i64
    }
}

/// Leaky-bucket rate limiter state.
///
/// Credits leak at a fixed rate of `capacity / agetime`; a crossing drains
/// the bucket and adds the drained credits to `excess`, so the running total
/// over the window stays visible in summaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeakyBucket {
    /// Credits accumulated since the last drain.
    count: u32,
    /// Cumulative credits drained by threshold crossings.
    excess: u64,
    /// Unix time of the last aging or drain.
    tstamp: i64,
}

impl LeakyBucket {
    /// A zeroed bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Credits currently held within the window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Credits seen in total, including those drained by crossings.
    pub fn total_seen(&self) -> u64 {
        u64::from(self.count) + self.excess
    }

    /// Leak credits proportional to the time elapsed since `tstamp`.
    ///
    /// A timestamp earlier than `tstamp` ages nothing out; event time is not
    /// required to be monotone.
    fn age(&mut self, cfg: &BucketConfig, now: i64) {
        let diff = now.saturating_sub(self.tstamp);
        if diff < 1 {
            return;
        }
        let agetime = cfg.agetime_secs().max(1);
        let leaked = (diff as u64).saturating_mul(u64::from(cfg.capacity)) / agetime as u64;
        self.count = self.count.saturating_sub(leaked.min(u64::from(u32::MAX)) as u32);
        self.tstamp = now;
    }

    /// Add `inc` credits at time `now` and report whether the bucket crossed
    /// its capacity. A crossing drains the bucket.
    pub fn account(&mut self, cfg: &BucketConfig, inc: u32, now: i64) -> bool {
        if cfg.capacity == 0 {
            return false;
        }
        self.age(cfg, now);
        self.count = self.count.saturating_add(inc);
        if self.count >= cfg.capacity {
            self.excess += u64::from(self.count);
            self.count = 0;
            self.tstamp = now;
            return true;
        }
        false
    }

    /// Short human-readable summary: total seen within the window.
    pub fn summary(&self, cfg: &BucketConfig) -> String {
        if cfg.capacity == 0 {
            return "not enabled".to_string();
        }
        format!(
            "{} in {}",
            self.total_seen(),
            humantime::format_duration(cfg.agetime)
        )
    }
}
