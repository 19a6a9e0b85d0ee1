//! The per-thread written-card queue.
//!
//! The write barrier appends one entry per interesting store. What an entry
//! *is* depends on the process-wide [`WrittenCardFilter`]: the raw written
//! address (`None`), a card-entry pointer (`Young`), or a card index
//! (`Previous`). When the queue runs out of slots the barrier calls one of
//! the nine overflow entry points at the bottom of this module, selected at
//! barrier-generation time from the storage mode and the filter.
//!
//! The queue fills downward. `index_in_bytes` is the byte offset of the most
//! recently appended slot and is the field the JIT-emitted fast path
//! decrements; its offset (and the storage field's) is exposed through
//! [`WrittenCardQueueOffsets`].

use memoffset::offset_of;
use static_assertions::const_assert;

use std::sync::atomic::{fence, Ordering};
use std::time::Instant;

use crate::buffer::Buffer;
use crate::card_table::CardTable;
use crate::mutator::MutatorLogs;
use crate::queue::dirty::DirtyCardQueue;
use crate::queue::dirty_set::DirtyCardQueueSet;
use crate::queue::written_set::{enqueue_clean_cards, WrittenCardQueueSet};
use crate::queue::{
    WrittenCardFilter, INITIAL_WRITTEN_CARD_SLOTS, INLINE_WRITTEN_CARD_SLOTS, NO_MATCHING_CARD,
};
use crate::stats::RefinementStats;
use crate::util::conversions::{bytes_to_words, words_to_bytes};
use crate::util::options::{Options, WrittenCardMode};
use crate::util::Address;
use crate::Mantle;

const_assert!(INLINE_WRITTEN_CARD_SLOTS > INITIAL_WRITTEN_CARD_SLOTS);
static_assertions::assert_eq_size!(Address, usize);

/// Where the logged entries live.
pub enum WrittenCardStorage {
    /// A small in-struct array; overflow always dirties cards in place.
    Inline([Address; INLINE_WRITTEN_CARD_SLOTS]),
    /// An allocated buffer, preceded by a 2-slot spillover used until the
    /// first overflow allocates the real one.
    Indirect {
        buffer: Option<Box<Buffer>>,
        initial: [Address; INITIAL_WRITTEN_CARD_SLOTS],
    },
}

pub struct WrittenCardQueue {
    index_in_bytes: usize,
    storage: WrittenCardStorage,
}

/// Field offsets the JIT bakes into the barrier fast path. The `storage`
/// offset locates the inline array or the indirect form's buffer pointer
/// (the discriminant is compiled into the barrier, not read at run time).
#[derive(Copy, Clone, Debug)]
pub struct WrittenCardQueueOffsets {
    pub index_in_bytes: usize,
    pub storage: usize,
}

impl WrittenCardQueue {
    pub fn new(options: &Options) -> Self {
        let storage = if options.use_inline_written_card_buffers {
            WrittenCardStorage::Inline([Address::ZERO; INLINE_WRITTEN_CARD_SLOTS])
        } else {
            WrittenCardStorage::Indirect {
                buffer: None,
                initial: [Address::ZERO; INITIAL_WRITTEN_CARD_SLOTS],
            }
        };
        let mut queue = Self {
            index_in_bytes: 0,
            storage,
        };
        queue.reset(options.written_card_filter);
        queue
    }

    pub fn offsets() -> WrittenCardQueueOffsets {
        WrittenCardQueueOffsets {
            index_in_bytes: offset_of!(WrittenCardQueue, index_in_bytes),
            storage: offset_of!(WrittenCardQueue, storage),
        }
    }

    /// Slot count of the current storage, including a Previous-mode sentinel
    /// slot.
    pub fn capacity(&self) -> usize {
        match &self.storage {
            WrittenCardStorage::Inline(slots) => slots.len(),
            WrittenCardStorage::Indirect { buffer: Some(b), .. } => b.capacity(),
            WrittenCardStorage::Indirect { buffer: None, .. } => INITIAL_WRITTEN_CARD_SLOTS,
        }
    }

    /// Slots available to `append`: the capacity, minus the reserved sentinel
    /// slot in Previous mode.
    pub fn append_capacity(&self, filter: WrittenCardFilter) -> usize {
        self.capacity() - usize::from(filter == WrittenCardFilter::Previous)
    }

    fn index(&self) -> usize {
        bytes_to_words(self.index_in_bytes)
    }

    fn set_index(&mut self, index: usize) {
        debug_assert!(index <= self.capacity());
        self.index_in_bytes = words_to_bytes(index);
    }

    pub fn is_empty(&self, filter: WrittenCardFilter) -> bool {
        self.index() == self.append_capacity(filter)
    }

    /// The number of logged entries.
    pub fn size(&self, filter: WrittenCardFilter) -> usize {
        self.append_capacity(filter) - self.index()
    }

    fn slots(&self) -> &[Address] {
        match &self.storage {
            WrittenCardStorage::Inline(slots) => slots,
            WrittenCardStorage::Indirect { buffer: Some(b), .. } => b.entries(),
            WrittenCardStorage::Indirect { buffer: None, initial } => initial,
        }
    }

    fn slots_mut(&mut self) -> &mut [Address] {
        match &mut self.storage {
            WrittenCardStorage::Inline(slots) => slots,
            WrittenCardStorage::Indirect { buffer: Some(b), .. } => b.entries_mut(),
            WrittenCardStorage::Indirect { buffer: None, initial } => initial,
        }
    }

    /// Empty the queue and reinstate the Previous-mode sentinel.
    pub fn reset(&mut self, filter: WrittenCardFilter) {
        let append_capacity = self.append_capacity(filter);
        if filter == WrittenCardFilter::Previous {
            let top = self.capacity() - 1;
            self.slots_mut()[top] = NO_MATCHING_CARD;
        }
        self.set_index(append_capacity);
    }

    /// The fast-path append the JIT barrier mirrors. Returns false when the
    /// queue is out of slots, in which case the overflow handler must run
    /// before the entry can be logged. In Previous mode an entry equal to the
    /// most recently logged one is collapsed; the sentinel backstops the
    /// comparison for the empty queue.
    pub fn try_append(&mut self, filter: WrittenCardFilter, value: Address) -> bool {
        let index = self.index();
        if filter == WrittenCardFilter::Previous && self.slots()[index] == value {
            return true;
        }
        if index == 0 {
            return false;
        }
        let index = index - 1;
        self.slots_mut()[index] = value;
        self.set_index(index);
        true
    }

    /// Transform the logged entries to card-entry pointers according to the
    /// filter and mark every still-clean card dirty, appending the dirtied
    /// cards' entries to `dcq`. Leaves the queue empty. Returns true iff at
    /// least one full DCQ buffer was handed off along the way.
    pub fn mark_cards_dirty(
        &mut self,
        filter: WrittenCardFilter,
        table: &CardTable,
        dcqs: &DirtyCardQueueSet,
        dcq: &mut DirtyCardQueue,
        stats: &mut RefinementStats,
    ) -> bool {
        let start = self.index();
        let logical_end = self.append_capacity(filter);
        if start == logical_end {
            return false;
        }
        let timer = Instant::now();
        let slots = self.slots_mut();
        let handed_off =
            transform_and_enqueue(filter, table, &mut slots[..logical_end], start, dcqs, dcq, stats);
        stats.written_cards_time += timer.elapsed();
        self.reset(filter);
        handed_off
    }

    /// First overflow of an indirect queue: allocate the real buffer, copy
    /// the spillover entries to its tail (just below the sentinel slot in
    /// Previous mode), and rebase the cursor. Returns false when the queue is
    /// inline or already has its buffer.
    fn promote_initial_buffer(&mut self, wcqs: &WrittenCardQueueSet, filter: WrittenCardFilter) -> bool {
        let index = self.index();
        let WrittenCardStorage::Indirect { buffer, initial } = &mut self.storage else {
            return false;
        };
        if buffer.is_some() {
            return false;
        }
        let used = (INITIAL_WRITTEN_CARD_SLOTS - usize::from(filter == WrittenCardFilter::Previous)) - index;
        let mut fresh = wcqs.allocator().allocate();
        let capacity = fresh.capacity();
        let append_capacity = capacity - usize::from(filter == WrittenCardFilter::Previous);
        let slots = fresh.entries_mut();
        if filter == WrittenCardFilter::Previous {
            slots[capacity - 1] = NO_MATCHING_CARD;
        }
        slots[append_capacity - used..append_capacity].copy_from_slice(&initial[index..index + used]);
        *buffer = Some(fresh);
        self.set_index(append_capacity - used);
        trace!("promoted initial written-card buffer, {} entries carried", used);
        true
    }

    /// Deferred handoff: publish the filled buffer to the completed list and
    /// point the queue at a fresh one.
    fn retarget(&mut self, wcqs: &WrittenCardQueueSet, filter: WrittenCardFilter) {
        let index = self.index();
        let mut fresh = wcqs.allocator().allocate();
        let capacity = fresh.capacity();
        if filter == WrittenCardFilter::Previous {
            fresh.entries_mut()[capacity - 1] = NO_MATCHING_CARD;
        }
        let append_capacity = capacity - usize::from(filter == WrittenCardFilter::Previous);
        let WrittenCardStorage::Indirect { buffer, .. } = &mut self.storage else {
            unreachable!("deferred overflow requires indirect storage");
        };
        let mut full = buffer.replace(fresh).expect("deferred overflow before first buffer");
        full.set_index(index);
        self.set_index(append_capacity);
        wcqs.enqueue_completed_buffer(full);
    }
}

/// Shared tail of every drain path: account the entries, run the filter
/// transform over `slots[start..]` in place, and push the resulting
/// card-entry pointers through `enqueue_clean_cards`. `slots` excludes any
/// sentinel slot. Returns true iff a full DCQ buffer was handed off.
pub(crate) fn transform_and_enqueue(
    filter: WrittenCardFilter,
    table: &CardTable,
    slots: &mut [Address],
    start: usize,
    dcqs: &DirtyCardQueueSet,
    dcq: &mut DirtyCardQueue,
    stats: &mut RefinementStats,
) -> bool {
    stats.written_cards_total += slots.len() - start;
    let start = match filter {
        WrittenCardFilter::None => {
            let compacted = transform_none(table, slots, start);
            // Entries collapsed by run deduplication never reach a card.
            stats.written_cards_filtered += compacted - start;
            compacted
        }
        WrittenCardFilter::Young => start,
        WrittenCardFilter::Previous => transform_previous(table, slots, start),
    };
    enqueue_clean_cards(&slots[start..], dcqs, dcq, stats)
}

/// No-filter transform: raw written addresses become card-entry pointers,
/// with sequential runs on the same card collapsed. Rewrites the buffer in
/// place, compacting toward the tail, and returns the new start index.
/// Iteration runs oldest entry first so "sequential" means log order.
fn transform_none(table: &CardTable, slots: &mut [Address], start: usize) -> usize {
    let end = slots.len();
    let mut write = end;
    let mut previous_card = usize::MAX;
    for read in (start..end).rev() {
        let card = slots[read].card_index();
        if card == previous_card {
            continue;
        }
        previous_card = card;
        write -= 1;
        slots[write] = table.entry_for_index(card);
    }
    write
}

/// Previous-filter transform: the barrier already deduplicated, so every
/// card index converts to its entry pointer in place.
fn transform_previous(table: &CardTable, slots: &mut [Address], start: usize) -> usize {
    for slot in &mut slots[start..] {
        *slot = table.entry_for_index(slot.as_usize());
    }
    start
}

pub(crate) trait FilterPolicy {
    const FILTER: WrittenCardFilter;
}

pub(crate) struct FilterNone;
pub(crate) struct FilterYoung;
pub(crate) struct FilterPrevious;

impl FilterPolicy for FilterNone {
    const FILTER: WrittenCardFilter = WrittenCardFilter::None;
}
impl FilterPolicy for FilterYoung {
    const FILTER: WrittenCardFilter = WrittenCardFilter::Young;
}
impl FilterPolicy for FilterPrevious {
    const FILTER: WrittenCardFilter = WrittenCardFilter::Previous;
}

/// Make room in a full queue, then log `value`.
///
/// The fence orders the mutator's preceding application stores before any
/// card transitions clean to dirty (directly below, or on a refinement
/// thread after a deferred handoff publishes the buffer).
fn handle_overflow<F: FilterPolicy>(
    mantle: &Mantle,
    logs: &mut MutatorLogs,
    value: Address,
    mode: WrittenCardMode,
) {
    fence(Ordering::SeqCst);
    let MutatorLogs { wcq, dcq, stats } = logs;
    match mode {
        WrittenCardMode::Inline | WrittenCardMode::Indirect => {
            overflow_dirtying::<F>(mantle, wcq, dcq, stats)
        }
        WrittenCardMode::Deferred => overflow_deferred::<F>(mantle, wcq, dcq, stats),
    }
    let appended = wcq.try_append(F::FILTER, value);
    debug_assert!(appended, "overflow handler failed to make room");
}

fn overflow_dirtying<F: FilterPolicy>(
    mantle: &Mantle,
    wcq: &mut WrittenCardQueue,
    dcq: &mut DirtyCardQueue,
    stats: &mut RefinementStats,
) {
    if wcq.promote_initial_buffer(mantle.written_card_queue_set(), F::FILTER) {
        return;
    }
    wcq.mark_cards_dirty(
        F::FILTER,
        mantle.card_table(),
        mantle.dirty_card_queue_set(),
        dcq,
        stats,
    );
}

fn overflow_deferred<F: FilterPolicy>(
    mantle: &Mantle,
    wcq: &mut WrittenCardQueue,
    dcq: &mut DirtyCardQueue,
    stats: &mut RefinementStats,
) {
    let wcqs = mantle.written_card_queue_set();
    if wcqs.mutator_should_mark_cards_dirty() {
        overflow_dirtying::<F>(mantle, wcq, dcq, stats);
        return;
    }
    if wcq.promote_initial_buffer(wcqs, F::FILTER) {
        return;
    }
    wcq.retarget(wcqs, F::FILTER);
}

/// Runtime dispatch used by [`MutatorLogs::log_written_card`]; the nine
/// entry points below are the statically selected equivalents the JIT
/// targets.
pub(crate) fn mutator_overflow(mantle: &Mantle, logs: &mut MutatorLogs, value: Address) {
    let options = mantle.options();
    let mode = options.written_card_mode();
    match options.written_card_filter {
        WrittenCardFilter::None => handle_overflow::<FilterNone>(mantle, logs, value, mode),
        WrittenCardFilter::Young => handle_overflow::<FilterYoung>(mantle, logs, value, mode),
        WrittenCardFilter::Previous => handle_overflow::<FilterPrevious>(mantle, logs, value, mode),
    }
}

fn overflow_entry<F: FilterPolicy>(logs: &mut MutatorLogs, value: Address, mode: WrittenCardMode) {
    let Some(mantle) = crate::try_global() else {
        return;
    };
    if !mantle.options().use_written_card_queues {
        // The barrier configuration dirties cards directly; nothing to log.
        return;
    }
    debug_assert_eq!(mantle.options().written_card_filter, F::FILTER);
    debug_assert_eq!(mantle.options().written_card_mode(), mode);
    handle_overflow::<F>(mantle, logs, value, mode);
}

// The nine overflow entry points, one per {storage} x {filter}. The JIT
// emits a call to the one matching the process configuration when the
// barrier fast path runs out of slots; `value` carries the entry in that
// filter's encoding. Each is a guarded, monomorphized instance of
// `handle_overflow` against the registered global context.

pub fn written_card_overflow_inline_none(logs: &mut MutatorLogs, value: Address) {
    overflow_entry::<FilterNone>(logs, value, WrittenCardMode::Inline)
}

pub fn written_card_overflow_inline_young(logs: &mut MutatorLogs, value: Address) {
    overflow_entry::<FilterYoung>(logs, value, WrittenCardMode::Inline)
}

pub fn written_card_overflow_inline_previous(logs: &mut MutatorLogs, value: Address) {
    overflow_entry::<FilterPrevious>(logs, value, WrittenCardMode::Inline)
}

pub fn written_card_overflow_indirect_none(logs: &mut MutatorLogs, value: Address) {
    overflow_entry::<FilterNone>(logs, value, WrittenCardMode::Indirect)
}

pub fn written_card_overflow_indirect_young(logs: &mut MutatorLogs, value: Address) {
    overflow_entry::<FilterYoung>(logs, value, WrittenCardMode::Indirect)
}

pub fn written_card_overflow_indirect_previous(logs: &mut MutatorLogs, value: Address) {
    overflow_entry::<FilterPrevious>(logs, value, WrittenCardMode::Indirect)
}

pub fn written_card_overflow_deferred_none(logs: &mut MutatorLogs, value: Address) {
    overflow_entry::<FilterNone>(logs, value, WrittenCardMode::Deferred)
}

pub fn written_card_overflow_deferred_young(logs: &mut MutatorLogs, value: Address) {
    overflow_entry::<FilterYoung>(logs, value, WrittenCardMode::Deferred)
}

pub fn written_card_overflow_deferred_previous(logs: &mut MutatorLogs, value: Address) {
    overflow_entry::<FilterPrevious>(logs, value, WrittenCardMode::Deferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_CARD;

    fn addr(raw: usize) -> Address {
        unsafe { Address::from_usize(raw) }
    }

    fn table() -> CardTable {
        CardTable::new(addr(0), 0x400 * BYTES_IN_CARD)
    }

    fn indirect_options(filter: WrittenCardFilter) -> Options {
        Options {
            written_card_filter: filter,
            written_card_buffer_size: 8,
            ..Options::default()
        }
    }

    #[test]
    fn inline_queue_fills_to_capacity() {
        let options = Options {
            use_inline_written_card_buffers: true,
            ..Options::default()
        };
        let mut wcq = WrittenCardQueue::new(&options);
        let filter = WrittenCardFilter::None;
        assert!(wcq.is_empty(filter));
        for i in 0..INLINE_WRITTEN_CARD_SLOTS {
            assert!(wcq.try_append(filter, addr(0x1000 + i * 8)));
        }
        assert_eq!(wcq.size(filter), INLINE_WRITTEN_CARD_SLOTS);
        assert!(!wcq.try_append(filter, addr(0xdead0)));
    }

    #[test]
    fn reset_round_trips_storage() {
        let options = indirect_options(WrittenCardFilter::None);
        let mut wcq = WrittenCardQueue::new(&options);
        let initial_index = wcq.index_in_bytes;
        assert!(wcq.try_append(WrittenCardFilter::None, addr(0x40)));
        assert!(wcq.try_append(WrittenCardFilter::None, addr(0x80)));
        wcq.reset(WrittenCardFilter::None);
        assert!(wcq.is_empty(WrittenCardFilter::None));
        assert_eq!(wcq.index_in_bytes, initial_index);
    }

    #[test]
    fn previous_filter_reserves_sentinel() {
        let options = indirect_options(WrittenCardFilter::Previous);
        let filter = WrittenCardFilter::Previous;
        let mut wcq = WrittenCardQueue::new(&options);
        // The initial spillover holds one appendable slot plus the sentinel.
        assert_eq!(wcq.append_capacity(filter), 1);
        assert_eq!(wcq.slots()[wcq.capacity() - 1], NO_MATCHING_CARD);
        assert!(wcq.try_append(filter, addr(0x80)));
        // A sequential duplicate collapses without consuming a slot.
        assert!(wcq.try_append(filter, addr(0x80)));
        assert_eq!(wcq.size(filter), 1);
        assert!(!wcq.try_append(filter, addr(0x81)));
    }

    #[test]
    fn previous_filter_overflow_boundary() {
        let wcqs = WrittenCardQueueSet::new(&indirect_options(WrittenCardFilter::Previous));
        let filter = WrittenCardFilter::Previous;
        let mut wcq = WrittenCardQueue::new(&indirect_options(filter));
        // Promote by hand so the queue has its 8-slot buffer (7 appendable).
        wcq.try_append(filter, addr(0x10));
        wcq.promote_initial_buffer(&wcqs, filter);
        let append_capacity = wcq.append_capacity(filter);
        assert_eq!(append_capacity, 7);
        for i in 1..append_capacity - 1 {
            assert!(wcq.try_append(filter, addr(0x10 + i)));
        }
        // One entry short of full: one more append still fits ...
        assert_eq!(wcq.size(filter), append_capacity - 1);
        assert!(wcq.try_append(filter, addr(0x200)));
        // ... and at capacity-1 entries the next distinct card overflows.
        assert!(!wcq.try_append(filter, addr(0x300)));
        assert_eq!(wcq.slots()[wcq.capacity() - 1], NO_MATCHING_CARD);
    }

    #[test]
    fn initial_buffer_promotion_copies_tail() {
        let options = indirect_options(WrittenCardFilter::None);
        let wcqs = WrittenCardQueueSet::new(&options);
        let filter = WrittenCardFilter::None;
        let mut wcq = WrittenCardQueue::new(&options);
        assert!(wcq.try_append(filter, addr(0xa0)));
        assert!(wcq.try_append(filter, addr(0xb0)));
        assert!(!wcq.try_append(filter, addr(0xc0)));
        assert!(wcq.promote_initial_buffer(&wcqs, filter));
        // Both spillover entries moved to the last two slots, oldest last.
        let capacity = wcq.capacity();
        assert_eq!(capacity, 8);
        assert_eq!(wcq.index(), capacity - 2);
        assert_eq!(wcq.slots()[capacity - 1], addr(0xa0));
        assert_eq!(wcq.slots()[capacity - 2], addr(0xb0));
        // No handoff to the global list happened.
        assert_eq!(wcqs.num_cards(), 0);
        assert!(wcq.try_append(filter, addr(0xc0)));
    }

    #[test]
    fn transform_none_collapses_runs_and_converts() {
        let table = table();
        let mut slots = [
            addr(0x2_0000),          // newest
            addr(0x1_0040),
            addr(0x1_0040),
            addr(0x1_0000),          // oldest
        ];
        let start = transform_none(&table, &mut slots, 0);
        // 0x1_0000 and 0x1_0040 share card 0x80; 0x2_0000 is card 0x100.
        assert_eq!(start, 2);
        assert_eq!(slots[3], table.entry_for_index(0x80));
        assert_eq!(slots[2], table.entry_for_index(0x100));
    }

    #[test]
    fn transform_previous_converts_in_place() {
        let table = table();
        let mut slots = [addr(0x100), addr(0x80)];
        let start = transform_previous(&table, &mut slots, 0);
        assert_eq!(start, 0);
        assert_eq!(slots[0], table.entry_for_index(0x100));
        assert_eq!(slots[1], table.entry_for_index(0x80));
    }

    #[test]
    fn deferred_retarget_publishes_filled_buffer() {
        let options = Options {
            defer_dirtying_written_cards: true,
            ..indirect_options(WrittenCardFilter::None)
        };
        let wcqs = WrittenCardQueueSet::new(&options);
        wcqs.set_mutator_should_mark_cards_dirty(false);
        let filter = WrittenCardFilter::None;
        let mut wcq = WrittenCardQueue::new(&options);
        wcq.try_append(filter, addr(0x10));
        wcq.try_append(filter, addr(0x20));
        wcq.promote_initial_buffer(&wcqs, filter);
        while wcq.try_append(filter, addr(0x1000 + wcq.size(filter) * 8)) {}
        assert_eq!(wcq.size(filter), 8);
        wcq.retarget(&wcqs, filter);
        assert!(wcq.is_empty(filter));
        assert_eq!(wcqs.num_cards(), 8);
        let buffer = wcqs.take_completed_buffer().unwrap();
        assert_eq!(buffer.size(), 8);
        assert_eq!(wcqs.num_cards(), 0);
    }
}
