//! The per-thread dirty-card queue.

use crate::buffer::Buffer;
use crate::queue::dirty_set::DirtyCardQueueSet;
use crate::stats::RefinementStats;
use crate::util::Address;

/// A thread-local, fill-downward log of card-entry pointers destined for
/// refinement. The current buffer is installed lazily; when it fills, it is
/// published to the [`DirtyCardQueueSet`] and a fresh buffer takes its place.
#[derive(Default)]
pub struct DirtyCardQueue {
    buffer: Option<Box<Buffer>>,
}

impl DirtyCardQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.as_ref().map_or(true, |b| b.is_empty())
    }

    /// Live entries in the current buffer.
    pub fn size(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.size())
    }

    /// Append one card-entry pointer, publishing the current buffer first if
    /// it is full. Returns true iff a full buffer was handed off.
    pub fn enqueue(
        &mut self,
        set: &DirtyCardQueueSet,
        entry: Address,
        stats: &mut RefinementStats,
    ) -> bool {
        self.ensure_buffer(set);
        if self.buffer.as_mut().unwrap().try_push(entry) {
            return false;
        }
        let full = self.buffer.take().unwrap();
        set.enqueue_completed_buffer(full);
        set.mutator_refine_completed_buffer(stats);
        self.ensure_buffer(set);
        let pushed = self.buffer.as_mut().unwrap().try_push(entry);
        debug_assert!(pushed);
        true
    }

    /// Publish a partially filled buffer. Used at detach and retirement; an
    /// empty buffer goes back to the pool instead.
    pub fn flush(&mut self, set: &DirtyCardQueueSet) {
        if let Some(buffer) = self.buffer.take() {
            if buffer.is_empty() {
                set.allocator().release(buffer);
            } else {
                trace!("flushing dirty-card queue with {} entries", buffer.size());
                set.enqueue_completed_buffer(buffer);
            }
        }
    }

    /// Drop all entries and return the buffer to the pool.
    pub fn reset(&mut self, set: &DirtyCardQueueSet) {
        if let Some(buffer) = self.buffer.take() {
            set.allocator().release(buffer);
        }
    }

    pub(crate) fn ensure_buffer(&mut self, set: &DirtyCardQueueSet) {
        if self.buffer.is_none() {
            self.buffer = Some(set.allocator().allocate());
        }
    }

    // Raw cursor access for the bulk writer in `enqueue_clean_cards`. The
    // batch owns the cursor until it commits it back with `set_cursor`.

    pub(crate) fn cursor(&self) -> usize {
        self.buffer.as_ref().unwrap().index()
    }

    pub(crate) fn set_cursor(&mut self, cursor: usize) {
        self.buffer.as_mut().unwrap().set_index(cursor);
    }

    pub(crate) fn write_slot(&mut self, slot: usize, entry: Address) {
        let buffer = self.buffer.as_mut().unwrap();
        debug_assert!(slot < buffer.index());
        buffer.entries_mut()[slot] = entry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::options::Options;

    fn addr(raw: usize) -> Address {
        unsafe { Address::from_usize(raw) }
    }

    fn small_set() -> DirtyCardQueueSet {
        let options = Options {
            update_buffer_size: 4,
            ..Options::default()
        };
        DirtyCardQueueSet::new(&options, None)
    }

    #[test]
    fn enqueue_fills_and_publishes() {
        let set = small_set();
        let mut dcq = DirtyCardQueue::new();
        let mut stats = RefinementStats::default();
        for i in 0..4 {
            assert!(!dcq.enqueue(&set, addr(0x100 + i), &mut stats));
        }
        assert_eq!(dcq.size(), 4);
        // Fifth entry hands the full buffer off and lands in a fresh one.
        assert!(dcq.enqueue(&set, addr(0x200), &mut stats));
        assert_eq!(dcq.size(), 1);
        assert_eq!(set.num_cards(), 4);
    }

    #[test]
    fn flush_publishes_partial() {
        let set = small_set();
        let mut dcq = DirtyCardQueue::new();
        let mut stats = RefinementStats::default();
        dcq.enqueue(&set, addr(0x100), &mut stats);
        dcq.flush(&set);
        assert!(dcq.is_empty());
        assert_eq!(set.num_cards(), 1);
        // Flushing an empty queue publishes nothing.
        dcq.flush(&set);
        assert_eq!(set.num_cards(), 1);
    }

    #[test]
    fn reset_discards() {
        let set = small_set();
        let mut dcq = DirtyCardQueue::new();
        let mut stats = RefinementStats::default();
        dcq.enqueue(&set, addr(0x100), &mut stats);
        dcq.reset(&set);
        assert!(dcq.is_empty());
        assert_eq!(set.num_cards(), 0);
    }
}
