//! The pre-evacuation retirement task against a populated world.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use mantle::retire::PreEvacuateRetireTask;
use mantle::util::constants::BYTES_IN_CARD;
use mantle::{
    Address, MantleBuilder, MutatorThread, Options, RefinementPolicy, RefinementStats,
    RuntimeHooks, WrittenCardFilter,
};

fn addr(raw: usize) -> Address {
    unsafe { Address::from_usize(raw) }
}

const HEAP_START: usize = 0x1_0000;

#[derive(Default)]
struct RecordingHooks {
    parsable_calls: AtomicUsize,
    tlabs_retired: AtomicUsize,
    tlab_stats_published: AtomicUsize,
}

impl RuntimeHooks for RecordingHooks {
    fn make_parsable(&self, _thread: &MutatorThread) {
        self.parsable_calls.fetch_add(1, Ordering::SeqCst);
    }
    fn tlabs_enabled(&self) -> bool {
        true
    }
    fn retire_tlab(&self, _thread: &MutatorThread) {
        self.tlabs_retired.fetch_add(1, Ordering::SeqCst);
    }
    fn publish_tlab_stats(&self) {
        self.tlab_stats_published.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingPolicy {
    recorded: Mutex<Option<(RefinementStats, RefinementStats)>>,
}

impl RefinementPolicy for RecordingPolicy {
    fn record_concurrent_refinement_stats(&self, mutator: RefinementStats, flush: RefinementStats) {
        *self.recorded.lock().unwrap() = Some((mutator, flush));
    }
}

#[test]
fn retirement_drains_every_thread() {
    let options = Options {
        defer_dirtying_written_cards: true,
        written_card_buffer_size: 8,
        update_buffer_size: 16,
        ..Options::default()
    };
    let mantle = MantleBuilder::new(addr(HEAP_START), 0x4_0000)
        .options(options)
        .build();

    // Three mutator threads with live written-card logs; thread 0 also holds
    // mutator-side refinement stats from earlier self-service work.
    let threads: Vec<_> = (0..3).map(|_| mantle.attach_mutator()).collect();
    for (t, thread) in threads.iter().enumerate() {
        let logs = unsafe { thread.logs_mut() };
        for i in 0..5 {
            let card = t * 16 + i;
            logs.log_written_card(&mantle, addr(HEAP_START + card * BYTES_IN_CARD));
        }
    }
    unsafe { threads[0].logs_mut() }.stats.refined_cards = 11;

    // One full deferred buffer already handed off before the pause.
    {
        let wcqs = mantle.written_card_queue_set();
        let mut buffer = wcqs.allocator().allocate();
        for i in 0..8 {
            assert!(buffer.try_push(addr(HEAP_START + (64 + i) * BYTES_IN_CARD)));
        }
        wcqs.enqueue_completed_buffer(buffer);
    }
    // The safepoint transition begins: one dirty-card flush races it and
    // parks on the paused list instead of reaching refinement.
    {
        let dcqs = mantle.dirty_card_queue_set();
        dcqs.set_record_paused_buffers(true);
        let entry = mantle.card_table().entry_for(addr(HEAP_START + 100 * BYTES_IN_CARD));
        mantle::CardTable::write_entry(entry, mantle::CardValue::Dirty);
        let mut dcq = mantle::queue::DirtyCardQueue::new();
        let mut stats = RefinementStats::default();
        dcq.enqueue(dcqs, entry, &mut stats);
        dcq.flush(dcqs);
        assert_eq!(dcqs.num_cards(), 0);
    }

    let hooks = RecordingHooks::default();
    let policy = RecordingPolicy::default();
    let task = PreEvacuateRetireTask::new(&mantle, &hooks, 2);
    task.work(0);
    task.work(1);
    let (mutator, flush) = task.finish(&policy);

    // Every thread was made parsable and had its TLAB retired.
    assert_eq!(hooks.parsable_calls.load(Ordering::SeqCst), 3);
    assert_eq!(hooks.tlabs_retired.load(Ordering::SeqCst), 3);
    assert_eq!(hooks.tlab_stats_published.load(Ordering::SeqCst), 1);

    // All logs are empty, and every logged card ended up dirty: 15 from the
    // threads plus 8 from the deferred buffer.
    for thread in &threads {
        let logs = unsafe { thread.logs_mut() };
        assert!(logs.wcq.is_empty(WrittenCardFilter::None));
        assert!(logs.dcq.is_empty());
        assert_eq!(logs.stats, RefinementStats::default());
    }
    assert_eq!(mantle.written_card_queue_set().num_cards(), 0);
    assert_eq!(mantle.card_table().count_dirty(), 15 + 8 + 1);
    // The paused dirty-card buffer reached the completed list: 15 + 8 + 1.
    assert_eq!(mantle.dirty_card_queue_set().num_cards(), 24);

    // Flush-side stats carry the written-card drain; mutator-side stats
    // carry the per-thread accumulators.
    assert_eq!(flush.written_cards_total, 15 + 8);
    assert_eq!(flush.written_cards_dirtied, 15 + 8);
    assert_eq!(mutator.refined_cards, 11);
    let recorded = policy.recorded.lock().unwrap().unwrap();
    assert_eq!(recorded.0, mutator);
    assert_eq!(recorded.1, flush);

    // Construction disabled deferred mutator dirtying and mutator
    // self-service refinement for the pause, and stopped parking hand-offs.
    assert!(!mantle.written_card_queue_set().mutator_should_mark_cards_dirty());
    assert_eq!(mantle.dirty_card_queue_set().mutator_refinement_threshold(), usize::MAX);
    assert!(!mantle.dirty_card_queue_set().record_paused_buffers());

    for thread in &threads {
        mantle.detach_mutator(thread);
    }
}

#[test]
fn detached_thread_stats_reach_the_policy() {
    let mantle = MantleBuilder::new(addr(HEAP_START), 0x4_0000)
        .options(Options::default())
        .build();
    let thread = mantle.attach_mutator();
    unsafe { thread.logs_mut() }.stats.precleaned_cards = 9;
    mantle.detach_mutator(&thread);
    assert_eq!(mantle.mutators().len(), 0);

    let hooks = ();
    let policy = RecordingPolicy::default();
    let task = PreEvacuateRetireTask::new(&mantle, &hooks, 1);
    task.work(0);
    let (mutator, _flush) = task.finish(&policy);
    assert_eq!(mutator.precleaned_cards, 9);
}
