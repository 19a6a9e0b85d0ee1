//! The refine-threads-needed controller.
//!
//! Once per update period the controller turns the analytic predictions and
//! the current card counts into two published values: how many refinement
//! workers should be running until the next update, and the pending-card
//! level below which an active worker may deactivate. The secondary goals
//! shaping the arithmetic: run as few concurrent workers as possible, avoid
//! activation flapping, and delay work so cards coalesce.

use super::RefinementAnalytics;
use crate::util::conversions::checked_cast;
use crate::util::options::Options;

/// An hour, in milliseconds. Time-to-GC predictions are clamped here so a
/// near-idle allocation rate cannot produce absurd horizons.
const MAX_TIME_TO_GC_MS: f64 = 60.0 * 60.0 * 1000.0;

pub struct RefinementController {
    region_bytes: usize,
    update_period_ms: f64,
    deferred_dirtying: bool,
    threads_needed: u32,
    deactivation_threshold: usize,
    predicted_time_until_next_gc_ms: f64,
    predicted_written_cards_at_next_gc: f64,
    predicted_dirty_cards_at_next_gc: f64,
}

impl RefinementController {
    pub fn new(options: &Options) -> Self {
        Self {
            region_bytes: options.region_size_bytes,
            update_period_ms: options.refinement_update_period_ms as f64,
            deferred_dirtying: options.defer_dirtying_written_cards,
            threads_needed: 0,
            deactivation_threshold: 0,
            predicted_time_until_next_gc_ms: 0.0,
            predicted_written_cards_at_next_gc: 0.0,
            predicted_dirty_cards_at_next_gc: 0.0,
        }
    }

    /// The worker-count target published by the last `update`.
    pub fn threads_needed(&self) -> u32 {
        self.threads_needed
    }

    /// Pending written cards at or below which an active worker may park.
    pub fn written_cards_deactivation_threshold(&self) -> usize {
        self.deactivation_threshold
    }

    // Predictions retained for policy logging.

    pub fn predicted_time_until_next_gc_ms(&self) -> f64 {
        self.predicted_time_until_next_gc_ms
    }

    pub fn predicted_written_cards_at_next_gc(&self) -> f64 {
        self.predicted_written_cards_at_next_gc
    }

    pub fn predicted_dirty_cards_at_next_gc(&self) -> f64 {
        self.predicted_dirty_cards_at_next_gc
    }

    /// Recompute the published values from the current state of the world.
    ///
    /// * `active_threads` — refinement workers currently active.
    /// * `available_bytes` — free space left before a GC must start.
    /// * `num_written_cards` — cards pending in written-card buffers.
    /// * `num_dirty_cards` — dirty cards pending refinement.
    /// * `target_dirty_cards` — dirty cards the policy wants left at GC.
    pub fn update(
        &mut self,
        analytics: &dyn RefinementAnalytics,
        active_threads: u32,
        available_bytes: usize,
        num_written_cards: usize,
        num_dirty_cards: usize,
        target_dirty_cards: usize,
    ) {
        let alloc_bytes_rate = analytics.alloc_region_rate_ms() * self.region_bytes as f64;
        let time_to_gc_ms = if alloc_bytes_rate == 0.0 {
            0.0
        } else {
            (available_bytes as f64 / alloc_bytes_rate).min(MAX_TIME_TO_GC_MS)
        };

        self.predicted_time_until_next_gc_ms = time_to_gc_ms;
        self.predicted_written_cards_at_next_gc =
            num_written_cards as f64 + analytics.incoming_written_rate_ms() * time_to_gc_ms;
        self.predicted_dirty_cards_at_next_gc =
            num_dirty_cards as f64 + analytics.incoming_dirty_rate_ms() * time_to_gc_ms;

        // Never deactivate while written cards remain, unless the dirtying
        // arithmetic below grants a slack allowance.
        self.deactivation_threshold = 0;

        // GC is closer than the next update: whatever is running now has to
        // finish the job. Keep the current crew, or start one worker.
        if time_to_gc_ms <= self.update_period_ms {
            self.threads_needed = active_threads.max(1);
            self.log_update(active_threads);
            return;
        }

        let dirtying_rate = analytics.concurrent_dirtying_rate_ms();
        let refine_rate = analytics.concurrent_refine_rate_ms();
        if dirtying_rate == 0.0 && refine_rate == 0.0 {
            // Warm-up: no processing-rate estimates yet. Run a single worker
            // to start gathering them.
            self.threads_needed = 1;
            self.log_update(active_threads);
            return;
        }

        let mut nthreads = 0.0f64;

        // Threads needed to refine the dirty cards exceeding the policy's
        // target before GC arrives.
        let cards_to_refine =
            (self.predicted_dirty_cards_at_next_gc - target_dirty_cards as f64).max(0.0);
        if cards_to_refine > 0.0 {
            if refine_rate == 0.0 {
                nthreads += 1.0;
            } else {
                nthreads += cards_to_refine / (refine_rate * time_to_gc_ms);
            }
        }

        // Threads needed to keep up with written-card dirtying, only when
        // mutators defer that work.
        if self.deferred_dirtying {
            if dirtying_rate == 0.0 {
                nthreads += 1.0;
            } else {
                // Half a period's worth of production may sit unprocessed;
                // that slack is what keeps workers from flapping.
                self.deactivation_threshold =
                    checked_cast(dirtying_rate * self.update_period_ms / 2.0);
                // Steady-state floor, with one extra thread of headroom, but
                // never more than double the floor or more than it takes to
                // drain the pending backlog within one period.
                let min_cts =
                    self.predicted_written_cards_at_next_gc / (dirtying_rate * time_to_gc_ms);
                let period_threads = (num_written_cards as f64
                    + analytics.incoming_dirty_rate_ms() * self.update_period_ms)
                    / (dirtying_rate * self.update_period_ms);
                nthreads += (min_cts + 1.0).min(2.0 * min_cts).min(period_threads);
            }
        }

        self.threads_needed = self.integralize(nthreads, time_to_gc_ms);
        self.log_update(active_threads);
    }

    /// Round the fractional thread demand to a count. Within a few periods
    /// of the predicted GC, round up; with time to spare, round to nearest
    /// and let later updates correct.
    fn integralize(&self, nthreads: f64, time_to_gc_ms: f64) -> u32 {
        if nthreads <= 1.0 {
            return 1;
        }
        let rounded = if time_to_gc_ms <= 5.0 * self.update_period_ms {
            nthreads.ceil()
        } else {
            nthreads.round()
        };
        if rounded >= u32::MAX as f64 {
            u32::MAX
        } else {
            rounded as u32
        }
    }

    fn log_update(&self, active_threads: u32) {
        debug!(
            "refinement update: active {} -> needed {}, deactivation threshold {}, \
             predicted gc in {:.1}ms, written {:.0}, dirty {:.0}",
            active_threads,
            self.threads_needed,
            self.deactivation_threshold,
            self.predicted_time_until_next_gc_ms,
            self.predicted_written_cards_at_next_gc,
            self.predicted_dirty_cards_at_next_gc,
        );
    }
}
