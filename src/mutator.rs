//! Per-thread post-barrier state and the registry of attached threads.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::queue::written::mutator_overflow;
use crate::queue::{DirtyCardQueue, WrittenCardQueue};
use crate::stats::RefinementStats;
use crate::util::Address;
use crate::Mantle;

/// The card-tracking state carried by one thread: its written-card queue, its
/// dirty-card queue, and its refinement statistics.
pub struct MutatorLogs {
    pub wcq: WrittenCardQueue,
    pub dcq: DirtyCardQueue,
    pub stats: RefinementStats,
}

impl MutatorLogs {
    pub fn new(mantle: &Mantle) -> Self {
        Self::from_options(mantle.options())
    }

    pub fn from_options(options: &crate::util::options::Options) -> Self {
        Self {
            wcq: WrittenCardQueue::new(options),
            dcq: DirtyCardQueue::new(),
            stats: RefinementStats::default(),
        }
    }

    /// The library mirror of the barrier fast path: log one written entry,
    /// running the overflow handler first when the queue is out of slots.
    /// `value` uses the configured filter's encoding.
    pub fn log_written_card(&mut self, mantle: &Mantle, value: Address) {
        let options = mantle.options();
        if !options.use_written_card_queues {
            return;
        }
        if !self.wcq.try_append(options.written_card_filter, value) {
            mutator_overflow(mantle, self, value);
        }
    }

    /// Drain both queues into global state. Called at detach and when a
    /// safepoint retires this thread's logs.
    pub fn flush(&mut self, mantle: &Mantle) {
        let options = mantle.options();
        self.wcq.mark_cards_dirty(
            options.written_card_filter,
            mantle.card_table(),
            mantle.dirty_card_queue_set(),
            &mut self.dcq,
            &mut self.stats,
        );
        self.dcq.flush(mantle.dirty_card_queue_set());
    }

    /// Drop both queues' contents and zero the statistics. Safepoint-only.
    pub fn abandon(&mut self, mantle: &Mantle) {
        self.wcq.reset(mantle.options().written_card_filter);
        self.dcq.reset(mantle.dirty_card_queue_set());
        self.stats.reset();
    }
}

/// One attached thread's slot in the registry.
///
/// The logs are owned by the thread itself while it runs; safepoint tasks
/// access them from other threads only once every mutator is stopped. That
/// exclusion protocol lives in the embedding runtime, so the accessor is
/// unsafe rather than locked.
pub struct MutatorThread {
    id: usize,
    logs: UnsafeCell<MutatorLogs>,
}

unsafe impl Sync for MutatorThread {}
unsafe impl Send for MutatorThread {}

impl MutatorThread {
    fn new(id: usize, mantle: &Mantle) -> Self {
        Self {
            id,
            logs: UnsafeCell::new(MutatorLogs::new(mantle)),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// # Safety
    /// The caller must be the owning thread, or a safepoint task running
    /// while every mutator is stopped, and must not create a second live
    /// reference.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn logs_mut(&self) -> &mut MutatorLogs {
        &mut *self.logs.get()
    }
}

/// All attached mutator threads, plus the statistics folded in from threads
/// that have since detached.
pub struct MutatorRegistry {
    threads: spin::RwLock<Vec<Arc<MutatorThread>>>,
    detached_stats: Mutex<RefinementStats>,
    next_id: AtomicUsize,
}

impl MutatorRegistry {
    pub fn new() -> Self {
        Self {
            threads: spin::RwLock::new(Vec::new()),
            detached_stats: Mutex::new(RefinementStats::default()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Register a new thread. Its queues start empty.
    pub fn attach(&self, mantle: &Mantle) -> Arc<MutatorThread> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(MutatorThread::new(id, mantle));
        self.threads.write().push(Arc::clone(&thread));
        debug!("mutator thread {} attached", id);
        thread
    }

    /// Flush the thread's logs, fold its statistics into the detached
    /// accumulator, and drop it from the registry. The caller must be the
    /// owning thread.
    pub fn detach(&self, mantle: &Mantle, thread: &Arc<MutatorThread>) {
        let logs = unsafe { thread.logs_mut() };
        logs.flush(mantle);
        debug_assert!(logs.wcq.is_empty(mantle.options().written_card_filter));
        debug_assert!(logs.dcq.is_empty());
        *self.detached_stats.lock().unwrap() += logs.stats;
        logs.stats.reset();
        self.threads.write().retain(|t| t.id != thread.id);
        debug!("mutator thread {} detached", thread.id);
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }

    /// A snapshot of the attached threads, for safepoint iteration.
    pub fn snapshot(&self) -> Vec<Arc<MutatorThread>> {
        self.threads.read().clone()
    }

    /// Take and reset the statistics accumulated from detached threads.
    pub fn take_detached_stats(&self) -> RefinementStats {
        let mut guard = self.detached_stats.lock().unwrap();
        let stats = *guard;
        guard.reset();
        stats
    }
}

impl Default for MutatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
