//! Mantle is the mutator-side card-tracking and concurrent-refinement
//! control of a regionalized, generational, mostly-concurrent garbage
//! collector. The collector keeps a per-card byte map summarizing which heap
//! cards may hold references that cross region boundaries; to keep the write
//! barrier cheap, mutators only append compact per-thread logs of written
//! locations, and the work of turning those logs into dirty cards (and
//! eventually remembered-set entries) happens later, mostly concurrently.
//!
//! The major parts:
//! * [Written-card queues](queue::WrittenCardQueue): the per-thread logs the
//!   barrier appends to, with three filter modes, inline/indirect storage,
//!   and nine overflow entry points for the JIT.
//! * [Dirty-card queues](queue::DirtyCardQueue): per-thread logs of card
//!   pointers feeding refinement.
//! * The global [queue sets](queue::WrittenCardQueueSet) with their buffer
//!   pools and the lock-free completed-buffer list.
//! * The [pre-evacuation retirement task](retire::PreEvacuateRetireTask)
//!   draining every thread at a safepoint.
//! * The [refine-threads-needed controller](refine::RefinementController)
//!   and the worker [state machine](refine::RefineWorkerGroup) it steers.
//!
//! The object heap, the analytics predictor, and the card-scanning
//! refinement loop proper are collaborators, reached through the
//! [`RuntimeHooks`], [`RefinementPolicy`], [`queue::CardRefiner`],
//! [`refine::RefinementAnalytics`] and [`refine::RefineStep`] traits.

#[macro_use]
extern crate log;

pub mod buffer;
pub mod card_table;
pub mod mutator;
pub mod queue;
pub mod refine;
pub mod retire;
pub mod stats;
pub mod util;

pub use crate::card_table::{CardTable, CardValue};
pub use crate::mutator::{MutatorLogs, MutatorRegistry, MutatorThread};
pub use crate::queue::{CardRefiner, WrittenCardFilter};
pub use crate::stats::RefinementStats;
pub use crate::util::options::Options;
pub use crate::util::Address;

use std::sync::{Arc, Mutex, OnceLock};

use crate::queue::{DirtyCardQueueSet, WrittenCardQueueSet};
use crate::refine::RefineWorkerGroup;

/// Callbacks into the embedding runtime used by the retirement task.
pub trait RuntimeHooks: Send + Sync {
    /// Flush any state that keeps the thread's heap view unparsable, e.g.
    /// deferred card marks. Runs before the thread's logs are drained.
    fn make_parsable(&self, _thread: &MutatorThread) {}

    fn tlabs_enabled(&self) -> bool {
        false
    }

    fn retire_tlab(&self, _thread: &MutatorThread) {}

    /// Publish the TLAB statistics gathered by `retire_tlab` calls.
    fn publish_tlab_stats(&self) {}
}

impl RuntimeHooks for () {}

/// The policy consumer of the statistics the retirement task sums up.
pub trait RefinementPolicy: Send + Sync {
    fn record_concurrent_refinement_stats(&self, mutator: RefinementStats, flush: RefinementStats);
}

impl RefinementPolicy for () {
    fn record_concurrent_refinement_stats(&self, _: RefinementStats, _: RefinementStats) {}
}

/// Everything the post-barrier machinery hangs off: configuration, the card
/// table, the two queue sets, the thread registry, and refinement control.
pub struct Mantle {
    options: Options,
    card_table: CardTable,
    wcqs: WrittenCardQueueSet,
    dcqs: DirtyCardQueueSet,
    mutators: MutatorRegistry,
    refine_workers: RefineWorkerGroup,
    /// Shared logs used by threads outside the mutator registry (service
    /// threads, attach stubs). Serialized by this lock; swept by the serial
    /// part of the retirement task.
    non_mutator: Mutex<MutatorLogs>,
}

impl Mantle {
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    pub fn written_card_queue_set(&self) -> &WrittenCardQueueSet {
        &self.wcqs
    }

    pub fn dirty_card_queue_set(&self) -> &DirtyCardQueueSet {
        &self.dcqs
    }

    pub fn mutators(&self) -> &MutatorRegistry {
        &self.mutators
    }

    pub fn refine_workers(&self) -> &RefineWorkerGroup {
        &self.refine_workers
    }

    pub fn non_mutator_logs(&self) -> &Mutex<MutatorLogs> {
        &self.non_mutator
    }

    /// Attach the calling thread; its queues start empty.
    pub fn attach_mutator(&self) -> Arc<MutatorThread> {
        self.mutators.attach(self)
    }

    /// Flush and unregister a thread. Must be called by the owning thread.
    pub fn detach_mutator(&self, thread: &Arc<MutatorThread>) {
        self.mutators.detach(self, thread)
    }

    /// Drop all logged-but-unprocessed state: every thread's written-card
    /// and dirty-card queue, both completed-buffer lists, and the per-thread
    /// statistics. Safepoint-only; used when a full collection makes the
    /// pending refinement work moot.
    pub fn abandon_post_barrier_logs_and_stats(&self) {
        for thread in self.mutators.snapshot() {
            // Safepoint: the owning mutators are stopped.
            unsafe { thread.logs_mut() }.abandon(self);
        }
        self.non_mutator.lock().unwrap().abandon(self);
        for logs in self.refine_workers.worker_logs() {
            logs.lock().unwrap().abandon(self);
        }
        self.wcqs.abandon_completed_buffers();
        self.dcqs.abandon_completed_buffers();
        self.mutators.take_detached_stats();
        debug!("abandoned all post-barrier logs and stats");
    }
}

/// Builder for [`Mantle`]. The heap range bounds the card table; everything
/// else defaults from [`Options`].
pub struct MantleBuilder {
    options: Options,
    heap_start: Address,
    heap_bytes: usize,
    refiner: Option<Arc<dyn CardRefiner>>,
}

impl MantleBuilder {
    pub fn new(heap_start: Address, heap_bytes: usize) -> Self {
        Self {
            options: Options::default(),
            heap_start,
            heap_bytes,
            refiner: None,
        }
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// The collector's card refiner, enabling mutator self-service
    /// refinement above the DCQ-set threshold.
    pub fn refiner(mut self, refiner: Arc<dyn CardRefiner>) -> Self {
        self.refiner = Some(refiner);
        self
    }

    pub fn build(self) -> Mantle {
        util::logger::try_initialize();
        self.options.validate();
        let card_table = CardTable::new(self.heap_start, self.heap_bytes);
        let wcqs = WrittenCardQueueSet::new(&self.options);
        let dcqs = DirtyCardQueueSet::new(&self.options, self.refiner);
        let non_mutator = Mutex::new(MutatorLogs::from_options(&self.options));
        info!(
            "mantle initialized: filter {}, mode {:?}, heap {}..{}",
            self.options.written_card_filter,
            self.options.written_card_mode(),
            self.heap_start,
            self.heap_start + self.heap_bytes,
        );
        Mantle {
            options: self.options,
            card_table,
            wcqs,
            dcqs,
            mutators: MutatorRegistry::new(),
            refine_workers: RefineWorkerGroup::new(),
            non_mutator,
        }
    }
}

static GLOBAL: OnceLock<Arc<Mantle>> = OnceLock::new();

/// Build and register the process-wide context the JIT overflow entry points
/// resolve against. May be called once; later calls return the original.
pub fn initialize(builder: MantleBuilder) -> Arc<Mantle> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(builder.build())))
}

/// The registered global context, if any.
pub fn try_global() -> Option<&'static Mantle> {
    GLOBAL.get().map(|global| global.as_ref())
}
