// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Write-side memory quota: tracks bytes pinned in mems across the whole
//! engine, blocks writers once the hard limit is hit, and maintains a
//! watermark below the limit that nudges the scheduler towards dumping
//! before writers actually have to wait.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex,
    },
    time::Instant,
};

/// Tracks memory used by in-flight mems against a configured limit, and
/// derives the dump watermark from observed write rate and dump bandwidth.
pub struct Quota {
    used: AtomicU64,
    limit: AtomicU64,
    watermark: AtomicU64,

    cond: Condvar,
    cond_mutex: Mutex<()>,

    rate: Mutex<RateTracker>,
}

struct RateTracker {
    window_start: Instant,
    window_bytes: u64,
    tx_write_rate: f64,
    dump_bandwidth: f64,
}

impl Quota {
    /// Creates a quota tracker with a hard `limit`, initially watermark-free
    /// (the watermark starts equal to the limit until the first
    /// [`Quota::update_watermark`] call narrows it).
    #[must_use]
    pub fn new(limit: u64, now: Instant) -> Self {
        Self {
            used: AtomicU64::new(0),
            limit: AtomicU64::new(limit),
            watermark: AtomicU64::new(limit),
            cond: Condvar::new(),
            cond_mutex: Mutex::new(()),
            rate: Mutex::new(RateTracker {
                window_start: now,
                window_bytes: 0,
                tx_write_rate: 0.0,
                dump_bandwidth: f64::INFINITY,
            }),
        }
    }

    /// Bytes currently pinned in mems.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Hard limit; writers block once `used` reaches this.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Acquire)
    }

    /// Current dump-trigger watermark, always `<= limit`.
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    /// Returns `true` once `used >= watermark`, the signal the scheduler's
    /// main loop uses to prefer dumping over compaction.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.used() >= self.watermark()
    }

    /// Accounts `size` bytes of a just-written statement, blocking the
    /// calling thread while `used >= limit`.
    ///
    /// Returns `true` if the caller crossed the watermark and should nudge
    /// the scheduler.
    pub fn reserve(&self, size: u64, now: Instant) -> bool {
        self.track_write(size, now);

        let previous = self.used.fetch_add(size, Ordering::AcqRel);
        let crossed_watermark = previous < self.watermark() && previous + size >= self.watermark();

        if self.used() >= self.limit() {
            let guard = self.cond_mutex.lock().expect("lock is poisoned");
            let _guard = self
                .cond
                .wait_while(guard, |_: &mut ()| self.used() >= self.limit())
                .expect("lock is poisoned");
        }

        crossed_watermark
    }

    /// Releases `size` bytes, waking any writer blocked in [`Quota::reserve`]
    /// once usage drops back under the limit.
    pub fn release(&self, size: u64) {
        self.used.fetch_sub(size, Ordering::AcqRel);

        if self.used() < self.limit() {
            let _guard = self.cond_mutex.lock().expect("lock is poisoned");
            self.cond.notify_all();
        }
    }

    fn track_write(&self, size: u64, now: Instant) {
        let mut rate = self.rate.lock().expect("lock is poisoned");
        rate.window_bytes += size;

        let elapsed = now.saturating_duration_since(rate.window_start).as_secs_f64();
        if elapsed >= 1.0 {
            let instantaneous = rate.window_bytes as f64 / elapsed;
            // EWMA with a 0.2 weight on the newest sample, matching a
            // slow-moving smoothed write-rate estimate.
            rate.tx_write_rate = 0.2f64.mul_add(instantaneous, 0.8 * rate.tx_write_rate);
            rate.window_start = now;
            rate.window_bytes = 0;
        }
    }

    /// Records an observed dump throughput sample (bytes dumped / seconds
    /// taken), feeding the watermark calculation's 10th-percentile estimate.
    ///
    /// Simplified to a running minimum rather than a true percentile: a
    /// worst-case-biased estimate only ever widens the safety gap, never
    /// narrows it below what the true 10th percentile would pick.
    pub fn record_dump_bandwidth(&self, bytes: u64, elapsed_secs: f64) {
        if elapsed_secs <= 0.0 {
            return;
        }

        let sample = bytes as f64 / elapsed_secs;
        let mut rate = self.rate.lock().expect("lock is poisoned");
        rate.dump_bandwidth = rate.dump_bandwidth.min(sample);
    }

    /// Recomputes the watermark from `max_dumpable_range_bytes` (the largest
    /// range eligible for a dump right now) and the tracked write rate /
    /// dump bandwidth. Call periodically from the scheduler's main loop.
    pub fn update_watermark(&self, max_dumpable_range_bytes: u64) {
        let rate = self.rate.lock().expect("lock is poisoned");

        if !rate.dump_bandwidth.is_finite() || rate.dump_bandwidth <= 0.0 {
            self.watermark.store(self.limit(), Ordering::Release);
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let gap = (max_dumpable_range_bytes as f64 * rate.tx_write_rate) / rate.dump_bandwidth;
        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
        let gap_bytes = gap.max(0.0) as u64;

        let watermark = self.limit().saturating_sub(gap_bytes);
        self.watermark.store(watermark, Ordering::Release);

        log::trace!("quota watermark updated to {watermark} (limit {})", self.limit());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn reserve_below_limit_never_blocks() {
        let quota = Quota::new(100, Instant::now());
        assert!(!quota.reserve(10, Instant::now()));
        assert_eq!(10, quota.used());
    }

    #[test]
    fn release_drops_used() {
        let quota = Quota::new(100, Instant::now());
        quota.reserve(40, Instant::now());
        quota.release(15);
        assert_eq!(25, quota.used());
    }

    #[test]
    fn crossing_watermark_is_reported_once() {
        let quota = Quota::new(100, Instant::now());
        quota.watermark.store(50, Ordering::Release);

        assert!(!quota.reserve(30, Instant::now()));
        assert!(quota.reserve(30, Instant::now()));
    }

    #[test]
    fn is_saturated_reflects_used_vs_watermark() {
        let quota = Quota::new(100, Instant::now());
        quota.watermark.store(20, Ordering::Release);

        assert!(!quota.is_saturated());
        quota.reserve(25, Instant::now());
        assert!(quota.is_saturated());
    }

    #[test]
    fn update_watermark_narrows_below_limit_with_bandwidth_sample() {
        let quota = Quota::new(1_000, Instant::now());
        quota.record_dump_bandwidth(1_000, 1.0);

        {
            let mut rate = quota.rate.lock().expect("lock is poisoned");
            rate.tx_write_rate = 500.0;
        }

        quota.update_watermark(100);
        assert!(quota.watermark() < 1_000);
    }

    #[test]
    fn update_watermark_without_bandwidth_sample_keeps_limit() {
        let quota = Quota::new(1_000, Instant::now());
        quota.update_watermark(100);
        assert_eq!(1_000, quota.watermark());
    }
}
