//! The global written-card queue set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::buffer::{Buffer, BufferAllocator, CompletedBufferList};
use crate::card_table::{CardTable, CardValue};
use crate::queue::dirty::DirtyCardQueue;
use crate::queue::dirty_set::DirtyCardQueueSet;
use crate::queue::written::transform_and_enqueue;
use crate::queue::{WrittenCardFilter, WRITTEN_BUFFER_TAG};
use crate::stats::RefinementStats;
use crate::util::options::Options;
use crate::util::Address;

/// Process-wide state behind the per-thread written-card queues: the buffer
/// pool, the lock-free list of buffers handed off by deferred overflow, the
/// published outstanding-card count, and the flag steering deferred overflow
/// between dirtying in the mutator and handing off.
pub struct WrittenCardQueueSet {
    allocator: BufferAllocator,
    completed: CompletedBufferList,
    /// When false, a mutator whose queue fills hands the buffer to the
    /// completed list instead of dirtying cards itself. Flipped only at
    /// safepoint boundaries.
    mutator_should_mark_cards_dirty: AtomicBool,
}

impl WrittenCardQueueSet {
    pub fn new(options: &Options) -> Self {
        Self {
            allocator: BufferAllocator::new(options.written_card_buffer_size, WRITTEN_BUFFER_TAG),
            completed: CompletedBufferList::new(),
            mutator_should_mark_cards_dirty: AtomicBool::new(
                !options.defer_dirtying_written_cards,
            ),
        }
    }

    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    /// The published count of cards outstanding across the completed-buffer
    /// list; never an underestimate.
    pub fn num_cards(&self) -> usize {
        self.completed.num_cards()
    }

    pub fn mutator_should_mark_cards_dirty(&self) -> bool {
        self.mutator_should_mark_cards_dirty.load(Ordering::SeqCst)
    }

    pub fn set_mutator_should_mark_cards_dirty(&self, value: bool) {
        self.mutator_should_mark_cards_dirty.store(value, Ordering::SeqCst);
    }

    /// Publish a filled buffer. Only the deferred overflow path hands
    /// buffers off, and only while mutator dirtying is disabled.
    pub fn enqueue_completed_buffer(&self, buffer: Box<Buffer>) {
        debug_assert!(!self.mutator_should_mark_cards_dirty());
        self.completed.push(buffer);
    }

    pub fn take_completed_buffer(&self) -> Option<Box<Buffer>> {
        self.completed.pop()
    }

    /// Take one completed buffer, run the filter transform over it, dirty
    /// its still-clean cards into `dcq`, and recycle it. Returns whether a
    /// buffer was processed.
    pub fn mark_cards_dirty(
        &self,
        filter: WrittenCardFilter,
        table: &CardTable,
        dcqs: &DirtyCardQueueSet,
        dcq: &mut DirtyCardQueue,
        stats: &mut RefinementStats,
    ) -> bool {
        let Some(mut buffer) = self.take_completed_buffer() else {
            return false;
        };
        let timer = Instant::now();
        let start = buffer.index();
        let logical_end =
            buffer.capacity() - usize::from(filter == WrittenCardFilter::Previous);
        debug_assert!(start <= logical_end);
        let slots = buffer.entries_mut();
        transform_and_enqueue(filter, table, &mut slots[..logical_end], start, dcqs, dcq, stats);
        stats.written_cards_time += timer.elapsed();
        self.allocator.release(buffer);
        true
    }

    /// Detach and recycle every completed buffer, dropping their contents.
    /// Safepoint-only; resets the card count.
    pub fn abandon_completed_buffers(&self) {
        let abandoned = self.completed.pop_all();
        if !abandoned.is_empty() {
            debug!("abandoning {} completed written-card buffers", abandoned.len());
        }
        for buffer in abandoned {
            self.allocator.release(buffer);
        }
        debug_assert_eq!(self.num_cards(), 0);
    }
}

/// Dirty the still-clean cards named by `entries` and append their card-entry
/// pointers to `dcq`, writing the buffer slots directly and committing the
/// cursor once at the end of the batch. A card that is not clean (already
/// dirty, or young) is counted as filtered and skipped. When the DCQ buffer
/// fills mid-batch the batch falls back to the one-card `enqueue`, which
/// publishes the full buffer and installs a fresh one, then resumes bulk
/// writes. Returns true iff such a handoff occurred.
pub(crate) fn enqueue_clean_cards(
    entries: &[Address],
    dcqs: &DirtyCardQueueSet,
    dcq: &mut DirtyCardQueue,
    stats: &mut RefinementStats,
) -> bool {
    if entries.is_empty() {
        return false;
    }
    let mut handed_off = false;
    dcq.ensure_buffer(dcqs);
    let mut cursor = dcq.cursor();
    for &entry in entries {
        if CardTable::read_entry(entry) != CardValue::Clean {
            stats.written_cards_filtered += 1;
            continue;
        }
        CardTable::write_entry(entry, CardValue::Dirty);
        stats.written_cards_dirtied += 1;
        stats.dirtied_cards += 1;
        if cursor == 0 {
            dcq.set_cursor(0);
            let published = dcq.enqueue(dcqs, entry, stats);
            debug_assert!(published);
            handed_off = true;
            cursor = dcq.cursor();
        } else {
            cursor -= 1;
            dcq.write_slot(cursor, entry);
        }
    }
    dcq.set_cursor(cursor);
    #[cfg(feature = "extreme_assertions")]
    for &entry in entries {
        assert_ne!(CardTable::read_entry(entry), CardValue::Clean);
    }
    handed_off
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_CARD;

    fn addr(raw: usize) -> Address {
        unsafe { Address::from_usize(raw) }
    }

    fn setup() -> (Options, CardTable, WrittenCardQueueSet, DirtyCardQueueSet) {
        let options = Options {
            written_card_buffer_size: 8,
            update_buffer_size: 4,
            defer_dirtying_written_cards: true,
            ..Options::default()
        };
        let table = CardTable::new(addr(0), 0x400 * BYTES_IN_CARD);
        let wcqs = WrittenCardQueueSet::new(&options);
        let dcqs = DirtyCardQueueSet::new(&options, None);
        (options, table, wcqs, dcqs)
    }

    #[test]
    fn enqueue_clean_cards_dirties_and_filters() {
        let (_, table, _, dcqs) = setup();
        let mut dcq = DirtyCardQueue::new();
        let mut stats = RefinementStats::default();
        let young = table.entry_for_index(3);
        CardTable::write_entry(young, CardValue::Young);
        let entries = [table.entry_for_index(1), young, table.entry_for_index(1)];
        let handed_off = enqueue_clean_cards(&entries, &dcqs, &mut dcq, &mut stats);
        assert!(!handed_off);
        // Card 1 dirtied once; the young card and the second sighting of
        // card 1 are filtered.
        assert_eq!(stats.written_cards_dirtied, 1);
        assert_eq!(stats.written_cards_filtered, 2);
        assert_eq!(dcq.size(), 1);
        assert_eq!(CardTable::read_entry(table.entry_for_index(1)), CardValue::Dirty);
        assert_eq!(CardTable::read_entry(young), CardValue::Young);
    }

    #[test]
    fn bulk_handoff_mid_batch() {
        let (_, table, _, dcqs) = setup();
        let mut dcq = DirtyCardQueue::new();
        let mut stats = RefinementStats::default();
        // 10 distinct clean cards through a 4-slot DCQ buffer: two handoffs.
        let entries: Vec<Address> = (0..10).map(|i| table.entry_for_index(i)).collect();
        let handed_off = enqueue_clean_cards(&entries, &dcqs, &mut dcq, &mut stats);
        assert!(handed_off);
        assert_eq!(stats.written_cards_dirtied, 10);
        assert_eq!(dcqs.num_cards(), 8);
        assert_eq!(dcq.size(), 2);
    }

    #[test]
    fn deferred_buffer_drains_through_set() {
        let (_, table, wcqs, dcqs) = setup();
        let mut buffer = wcqs.allocator().allocate();
        for i in 0..8 {
            assert!(buffer.try_push(addr(i * BYTES_IN_CARD)));
        }
        wcqs.enqueue_completed_buffer(buffer);
        assert_eq!(wcqs.num_cards(), 8);

        let mut dcq = DirtyCardQueue::new();
        let mut stats = RefinementStats::default();
        let processed =
            wcqs.mark_cards_dirty(WrittenCardFilter::None, &table, &dcqs, &mut dcq, &mut stats);
        assert!(processed);
        assert_eq!(wcqs.num_cards(), 0);
        assert_eq!(stats.written_cards_total, 8);
        assert_eq!(stats.written_cards_dirtied, 8);
        // Nothing left: a second call reports no work.
        assert!(!wcqs.mark_cards_dirty(WrittenCardFilter::None, &table, &dcqs, &mut dcq, &mut stats));
    }

    #[test]
    fn abandon_discards_contents() {
        let (_, _, wcqs, _) = setup();
        let mut buffer = wcqs.allocator().allocate();
        for i in 0..5 {
            assert!(buffer.try_push(addr(i * BYTES_IN_CARD)));
        }
        wcqs.enqueue_completed_buffer(buffer);
        assert_eq!(wcqs.num_cards(), 5);
        wcqs.abandon_completed_buffers();
        assert_eq!(wcqs.num_cards(), 0);
        assert!(wcqs.take_completed_buffer().is_none());
    }
}
