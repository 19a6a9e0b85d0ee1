//! The global dirty-card queue set.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::buffer::{Buffer, BufferAllocator, CompletedBufferList};
use crate::card_table::{CardTable, CardValue};
use crate::queue::DIRTY_BUFFER_TAG;
use crate::stats::RefinementStats;
use crate::util::options::Options;
use crate::util::Address;

/// Scans one dirty card into remembered-set updates. Implemented by the
/// collector proper; the card's dirty-to-clean transition is the refiner's
/// responsibility. Returns false when the card turned out not to need
/// scanning (it was concurrently refined or cleaned already).
pub trait CardRefiner: Send + Sync {
    fn refine_card(&self, entry: Address) -> bool;
}

/// Global state of dirty-card logging: the buffer pool, the completed-buffer
/// list refinement threads feed from, the paused buffers parked during a
/// safepoint, and the threshold above which mutators refine their own
/// handoffs.
pub struct DirtyCardQueueSet {
    allocator: BufferAllocator,
    completed: CompletedBufferList,
    /// Buffers handed off while `record_paused_buffers` is set; moved to
    /// `completed` serially before any parallel safepoint work runs.
    paused: Mutex<Vec<Box<Buffer>>>,
    /// While true, hand-offs park on the paused list instead of the
    /// completed list, keeping refinement from racing buffers published
    /// around a safepoint transition. Set by the runtime as it initiates a
    /// safepoint; cleared when the retirement task drains the paused list.
    record_paused_buffers: AtomicBool,
    /// Card count above which a mutator handing off a full buffer refines one
    /// completed buffer itself. `usize::MAX` disables self-service.
    mutator_refinement_threshold: AtomicUsize,
    refiner: Option<Arc<dyn CardRefiner>>,
}

impl DirtyCardQueueSet {
    pub fn new(options: &Options, refiner: Option<Arc<dyn CardRefiner>>) -> Self {
        Self {
            allocator: BufferAllocator::new(options.update_buffer_size, DIRTY_BUFFER_TAG),
            completed: CompletedBufferList::new(),
            paused: Mutex::new(Vec::new()),
            record_paused_buffers: AtomicBool::new(false),
            mutator_refinement_threshold: AtomicUsize::new(usize::MAX),
            refiner,
        }
    }

    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    /// Outstanding cards across the completed-buffer list.
    pub fn num_cards(&self) -> usize {
        self.completed.num_cards()
    }

    /// Publish a filled or flushed buffer. While a safepoint transition is
    /// recording paused buffers, the buffer parks on the paused list and
    /// does not count toward `num_cards` until the retirement task drains
    /// it.
    pub fn enqueue_completed_buffer(&self, buffer: Box<Buffer>) {
        if self.record_paused_buffers.load(Ordering::SeqCst) {
            self.record_paused_buffer(buffer);
            return;
        }
        self.completed.push(buffer);
    }

    pub fn take_completed_buffer(&self) -> Option<Box<Buffer>> {
        self.completed.pop()
    }

    pub fn set_mutator_refinement_threshold(&self, cards: usize) {
        self.mutator_refinement_threshold.store(cards, Ordering::SeqCst);
    }

    pub fn mutator_refinement_threshold(&self) -> usize {
        self.mutator_refinement_threshold.load(Ordering::SeqCst)
    }

    /// Self-service refinement: when the pending-card count exceeds the
    /// mutator threshold, the mutator that crossed it refines one completed
    /// buffer instead of letting the backlog grow. No-op without a refiner or
    /// below the threshold.
    pub fn mutator_refine_completed_buffer(&self, stats: &mut RefinementStats) {
        let Some(refiner) = self.refiner.as_deref() else {
            return;
        };
        if self.num_cards() <= self.mutator_refinement_threshold() {
            return;
        }
        let Some(buffer) = self.take_completed_buffer() else {
            return;
        };
        self.refine_buffer(refiner, &buffer, stats);
        self.allocator.release(buffer);
    }

    /// Refine every card in `buffer`, accumulating into `stats`.
    pub fn refine_buffer(
        &self,
        refiner: &dyn CardRefiner,
        buffer: &Buffer,
        stats: &mut RefinementStats,
    ) {
        let start = Instant::now();
        for &entry in buffer.unread() {
            if CardTable::read_entry(entry) != CardValue::Dirty {
                stats.precleaned_cards += 1;
            } else if refiner.refine_card(entry) {
                stats.refined_cards += 1;
            } else {
                stats.precleaned_cards += 1;
            }
        }
        stats.refinement_time += start.elapsed();
    }

    /// Start or stop parking hand-offs on the paused list. The runtime sets
    /// this when it initiates a safepoint; the retirement task clears it
    /// before draining, so flushes during the pause publish directly.
    pub fn set_record_paused_buffers(&self, value: bool) {
        self.record_paused_buffers.store(value, Ordering::SeqCst);
    }

    pub fn record_paused_buffers(&self) -> bool {
        self.record_paused_buffers.load(Ordering::SeqCst)
    }

    fn record_paused_buffer(&self, buffer: Box<Buffer>) {
        trace!("parking dirty-card buffer with {} entries", buffer.size());
        self.paused.lock().unwrap().push(buffer);
    }

    /// Move all paused buffers to the completed list. Runs serially at a
    /// safepoint, before any parallel sub-task can pop them.
    pub fn enqueue_all_paused_buffers(&self) {
        let mut paused = self.paused.lock().unwrap();
        for buffer in paused.drain(..) {
            if buffer.is_empty() {
                self.allocator.release(buffer);
            } else {
                self.completed.push(buffer);
            }
        }
    }

    /// Drop every completed and paused buffer. Safepoint-only.
    pub fn abandon_completed_buffers(&self) {
        for buffer in self.completed.pop_all() {
            self.allocator.release(buffer);
        }
        let mut paused = self.paused.lock().unwrap();
        for buffer in paused.drain(..) {
            self.allocator.release(buffer);
        }
        debug_assert_eq!(self.num_cards(), 0);
    }
}
