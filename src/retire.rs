//! The pre-evacuation retirement task.
//!
//! Runs at the start of every evacuation pause, after all mutators have
//! stopped. One coordinator constructs the task (which serially re-points
//! the queue sets at safepoint behavior), any number of workers call
//! [`PreEvacuateRetireTask::work`], and the coordinator finishes by
//! publishing the summed statistics to the policy.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::mutator::MutatorThread;
use crate::queue::DirtyCardQueue;
use crate::stats::RefinementStats;
use crate::{Mantle, RefinementPolicy, RuntimeHooks};

/// Mutator threads claimed per worker grab. Coarse enough that claim traffic
/// is negligible against the per-thread work.
pub const RETIRE_CHUNK_SIZE: usize = 250;

#[derive(Default)]
struct WorkerTotals {
    mutator: RefinementStats,
    flush: RefinementStats,
}

pub struct PreEvacuateRetireTask<'m> {
    mantle: &'m Mantle,
    hooks: &'m dyn RuntimeHooks,
    threads: Vec<Arc<MutatorThread>>,
    cursor: AtomicUsize,
    non_mutator_claim: AtomicBool,
    refine_logs_claim: AtomicBool,
    /// Whether deferred dirtying was configured, and so whether completed
    /// written-card buffers may be pending and must be drained here.
    deferred: bool,
    totals: Vec<Mutex<WorkerTotals>>,
}

impl<'m> PreEvacuateRetireTask<'m> {
    /// Construct at the safepoint, before any worker runs. Serially flips the
    /// queue sets into pause mode: mutator dirtying off, mutator self-service
    /// refinement off, paused dirty-card buffers made visible.
    pub fn new(mantle: &'m Mantle, hooks: &'m dyn RuntimeHooks, num_workers: usize) -> Self {
        assert!(num_workers > 0);
        let deferred = mantle.options().defer_dirtying_written_cards;
        mantle
            .written_card_queue_set()
            .set_mutator_should_mark_cards_dirty(false);
        mantle
            .dirty_card_queue_set()
            .set_mutator_refinement_threshold(usize::MAX);
        // Mutators are stopped: stop parking hand-offs, then make whatever
        // was parked during the safepoint transition visible. Flushes from
        // here on publish directly to the completed list.
        mantle.dirty_card_queue_set().set_record_paused_buffers(false);
        mantle.dirty_card_queue_set().enqueue_all_paused_buffers();
        let threads = mantle.mutators().snapshot();
        debug!(
            "pre-evacuation retirement over {} mutator threads, {} workers",
            threads.len(),
            num_workers
        );
        Self {
            mantle,
            hooks,
            threads,
            cursor: AtomicUsize::new(0),
            non_mutator_claim: AtomicBool::new(false),
            refine_logs_claim: AtomicBool::new(false),
            deferred,
            totals: (0..num_workers).map(|_| Mutex::new(WorkerTotals::default())).collect(),
        }
    }

    /// The parallel body. Each participating worker calls this once with a
    /// distinct `worker_id < num_workers`.
    pub fn work(&self, worker_id: usize) {
        let mut totals = self.totals[worker_id].lock().unwrap();

        if !self.non_mutator_claim.swap(true, Ordering::SeqCst) {
            self.retire_non_mutator_logs(&mut totals);
        }
        if self.deferred && !self.refine_logs_claim.swap(true, Ordering::SeqCst) {
            self.retire_refine_worker_logs(&mut totals);
        }

        loop {
            let start = self.cursor.fetch_add(RETIRE_CHUNK_SIZE, Ordering::SeqCst);
            if start >= self.threads.len() {
                break;
            }
            let end = (start + RETIRE_CHUNK_SIZE).min(self.threads.len());
            for thread in &self.threads[start..end] {
                self.retire_thread(thread, &mut totals);
            }
        }

        if self.deferred {
            self.drain_completed_written_buffers(&mut totals);
        }
    }

    /// Publish TLAB statistics, check the post-conditions, and report the
    /// summed statistics to the policy. Returns the (mutator, flush) pair.
    pub fn finish(self, policy: &dyn RefinementPolicy) -> (RefinementStats, RefinementStats) {
        self.hooks.publish_tlab_stats();

        let filter = self.mantle.options().written_card_filter;
        for thread in &self.threads {
            let logs = unsafe { thread.logs_mut() };
            debug_assert!(logs.wcq.is_empty(filter));
            debug_assert!(logs.dcq.is_empty());
        }
        debug_assert!(!self.deferred || self.mantle.written_card_queue_set().num_cards() == 0);

        let mut mutator = self.mantle.mutators().take_detached_stats();
        let mut flush = RefinementStats::default();
        for totals in &self.totals {
            let totals = totals.lock().unwrap();
            mutator += totals.mutator;
            flush += totals.flush;
        }
        policy.record_concurrent_refinement_stats(mutator, flush);
        (mutator, flush)
    }

    /// The five per-thread steps, in order.
    fn retire_thread(&self, thread: &Arc<MutatorThread>, totals: &mut WorkerTotals) {
        self.hooks.make_parsable(thread);
        if self.hooks.tlabs_enabled() {
            self.hooks.retire_tlab(thread);
        }
        let logs = unsafe { thread.logs_mut() };
        if self.mantle.options().use_written_card_queues {
            logs.wcq.mark_cards_dirty(
                self.mantle.options().written_card_filter,
                self.mantle.card_table(),
                self.mantle.dirty_card_queue_set(),
                &mut logs.dcq,
                &mut totals.flush,
            );
        }
        logs.dcq.flush(self.mantle.dirty_card_queue_set());
        totals.mutator += logs.stats;
        logs.stats.reset();
    }

    /// Serial sub-task: the shared logs non-mutator threads write through.
    fn retire_non_mutator_logs(&self, totals: &mut WorkerTotals) {
        let mut guard = self.mantle.non_mutator_logs().lock().unwrap();
        let logs = &mut *guard;
        if self.mantle.options().use_written_card_queues {
            logs.wcq.mark_cards_dirty(
                self.mantle.options().written_card_filter,
                self.mantle.card_table(),
                self.mantle.dirty_card_queue_set(),
                &mut logs.dcq,
                &mut totals.flush,
            );
        }
        logs.dcq.flush(self.mantle.dirty_card_queue_set());
        totals.mutator += logs.stats;
        logs.stats.reset();
    }

    /// Serial sub-task, deferred mode only: the concurrent-refine workers'
    /// local dirty-card queues and statistics.
    fn retire_refine_worker_logs(&self, totals: &mut WorkerTotals) {
        for logs in self.mantle.refine_workers().worker_logs() {
            let mut logs = logs.lock().unwrap();
            logs.dcq.flush(self.mantle.dirty_card_queue_set());
            totals.flush += logs.stats;
            logs.stats.reset();
        }
    }

    /// After the per-thread sweep: drain whatever completed written-card
    /// buffers remain through a task-local DCQ until the list runs dry.
    fn drain_completed_written_buffers(&self, totals: &mut WorkerTotals) {
        let mut dcq = DirtyCardQueue::new();
        let wcqs = self.mantle.written_card_queue_set();
        while wcqs.mark_cards_dirty(
            self.mantle.options().written_card_filter,
            self.mantle.card_table(),
            self.mantle.dirty_card_queue_set(),
            &mut dcq,
            &mut totals.flush,
        ) {}
        dcq.flush(self.mantle.dirty_card_queue_set());
    }
}
