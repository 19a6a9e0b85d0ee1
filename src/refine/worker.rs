//! The refinement worker group and its Active/Parked state machine.
//!
//! Worker `i` is active while `i < threads_needed`; the controller raises or
//! lowers that target each update period and wakes the group. An active
//! worker alternates between draining deferred written-card buffers and
//! stepping the external dirty-card refinement until both run dry and the
//! pending written-card count sinks to the deactivation threshold, then
//! parks on the group monitor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::mutator::MutatorLogs;
use crate::Mantle;

/// One bounded unit of dirty-card refinement, supplied by the collector
/// proper. Returns true when no dirty-card work remains at the moment of the
/// call.
pub trait RefineStep: Send + Sync {
    fn do_step(&self, worker_id: usize, mantle: &Mantle) -> bool;
}

struct GroupSync {
    threads_needed: u32,
    stop: bool,
}

pub struct RefineWorkerGroup {
    sync: Mutex<GroupSync>,
    changed: Condvar,
    deactivation_threshold: AtomicUsize,
    /// Per-worker logs (DCQ and stats; the WCQ stays unused). Flushed by the
    /// pre-evacuation retirement task and folded into its flush statistics.
    worker_logs: Mutex<Vec<Arc<Mutex<MutatorLogs>>>>,
}

impl RefineWorkerGroup {
    pub fn new() -> Self {
        Self {
            sync: Mutex::new(GroupSync {
                threads_needed: 0,
                stop: false,
            }),
            changed: Condvar::new(),
            deactivation_threshold: AtomicUsize::new(0),
            worker_logs: Mutex::new(Vec::new()),
        }
    }

    /// Publish a new worker-count target and deactivation threshold; wakes
    /// every parked worker so newly active ones can start.
    pub fn publish_targets(&self, threads_needed: u32, deactivation_threshold: usize) {
        self.deactivation_threshold
            .store(deactivation_threshold, Ordering::SeqCst);
        let mut sync = self.sync.lock().unwrap();
        if sync.threads_needed != threads_needed {
            trace!(
                "refinement target {} -> {} workers",
                sync.threads_needed,
                threads_needed
            );
        }
        sync.threads_needed = threads_needed;
        drop(sync);
        self.changed.notify_all();
    }

    pub fn deactivation_threshold(&self) -> usize {
        self.deactivation_threshold.load(Ordering::SeqCst)
    }

    /// Ask every worker to exit and wake them.
    pub fn stop(&self) {
        self.sync.lock().unwrap().stop = true;
        self.changed.notify_all();
    }

    /// Park until this worker's index falls under the target. Returns false
    /// when the group is stopping.
    fn wait_until_active(&self, worker_id: usize) -> bool {
        let mut sync = self.sync.lock().unwrap();
        loop {
            if sync.stop {
                return false;
            }
            if (worker_id as u32) < sync.threads_needed {
                return true;
            }
            sync = self.changed.wait(sync).unwrap();
        }
    }

    fn is_active(&self, worker_id: usize) -> bool {
        let sync = self.sync.lock().unwrap();
        !sync.stop && (worker_id as u32) < sync.threads_needed
    }

    fn register_worker(&self, mantle: &Mantle) -> Arc<Mutex<MutatorLogs>> {
        let logs = Arc::new(Mutex::new(MutatorLogs::new(mantle)));
        self.worker_logs.lock().unwrap().push(Arc::clone(&logs));
        logs
    }

    /// Snapshot of the per-worker logs, for safepoint-side flushing.
    pub(crate) fn worker_logs(&self) -> Vec<Arc<Mutex<MutatorLogs>>> {
        self.worker_logs.lock().unwrap().clone()
    }

    /// Spawn `count` workers against the registered global context. The
    /// workers run until [`Self::stop`].
    pub fn spawn_workers(
        mantle: &Arc<Mantle>,
        step: Arc<dyn RefineStep>,
        count: usize,
    ) -> Vec<JoinHandle<()>> {
        let count = count.min(num_cpus::get());
        (0..count)
            .map(|worker_id| {
                let mantle = Arc::clone(mantle);
                let step = Arc::clone(&step);
                std::thread::Builder::new()
                    .name(format!("mantle-refine-{}", worker_id))
                    .spawn(move || run_worker(&mantle, worker_id, step.as_ref()))
                    .expect("failed to spawn refinement worker")
            })
            .collect()
    }
}

impl Default for RefineWorkerGroup {
    fn default() -> Self {
        Self::new()
    }
}

fn run_worker(mantle: &Mantle, worker_id: usize, step: &dyn RefineStep) {
    let group = mantle.refine_workers();
    let logs = group.register_worker(mantle);
    debug!("refinement worker {} started", worker_id);
    loop {
        if !group.wait_until_active(worker_id) {
            debug!("refinement worker {} exiting", worker_id);
            return;
        }
        refine_until_idle(mantle, worker_id, step, &logs);
    }
}

/// The active phase: drain deferred written-card buffers and step dirty-card
/// refinement until both report no work and the pending written-card count
/// is at or below the deactivation threshold (or the target drops below this
/// worker's index).
fn refine_until_idle(
    mantle: &Mantle,
    worker_id: usize,
    step: &dyn RefineStep,
    logs: &Arc<Mutex<MutatorLogs>>,
) {
    let group = mantle.refine_workers();
    let wcqs = mantle.written_card_queue_set();
    let options = mantle.options();
    let mut logs = logs.lock().unwrap();
    loop {
        if !group.is_active(worker_id) {
            break;
        }
        let MutatorLogs { dcq, stats, .. } = &mut *logs;
        let processed_written = wcqs.mark_cards_dirty(
            options.written_card_filter,
            mantle.card_table(),
            mantle.dirty_card_queue_set(),
            dcq,
            stats,
        );
        let dirty_done = step.do_step(worker_id, mantle);
        if !processed_written
            && dirty_done
            && wcqs.num_cards() <= group.deactivation_threshold()
        {
            break;
        }
    }
    // Publish locally buffered dirty cards before parking.
    logs.dcq.flush(mantle.dirty_card_queue_set());
}
