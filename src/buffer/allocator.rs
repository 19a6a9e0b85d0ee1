use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Buffer, BufferStack};

/// A free-list-backed pool of equally sized buffers.
///
/// `allocate` and `release` are safe to call from any number of mutator
/// threads at once; the free list is the same lock-free stack used for
/// completed buffers, so neither operation blocks. Released buffers keep
/// their contents — only the header is rewound when they are handed out
/// again. Buffers come from the global heap when the free list is empty;
/// failure of that allocation aborts, as heap exhaustion here implies a
/// broader runtime failure.
pub struct BufferAllocator {
    capacity: usize,
    tag: u32,
    free_list: BufferStack,
    /// Buffers created so far; diagnostics only.
    live: AtomicUsize,
}

impl BufferAllocator {
    pub fn new(capacity: usize, tag: u32) -> Self {
        debug_assert!(capacity > 0);
        Self {
            capacity,
            tag,
            free_list: BufferStack::new(),
            live: AtomicUsize::new(0),
        }
    }

    /// Capacity, in entries, of every buffer this pool hands out.
    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    /// An empty buffer (`index == capacity`), recycled if possible.
    pub fn allocate(&self) -> Box<Buffer> {
        if let Some(mut buffer) = self.free_list.pop() {
            debug_assert_eq!(buffer.tag(), self.tag);
            buffer.reset();
            return buffer;
        }
        let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("buffer pool {}: grown to {} buffers", self.tag, live);
        Box::new(Buffer::new(self.capacity, self.tag))
    }

    /// Return a buffer to the pool. Does not touch the buffer's contents.
    pub fn release(&self, buffer: Box<Buffer>) {
        debug_assert_eq!(buffer.tag(), self.tag);
        debug_assert_eq!(buffer.capacity(), self.capacity);
        self.free_list.push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;

    #[test]
    fn allocates_empty_buffers() {
        let pool = BufferAllocator::new(8, 1);
        let buf = pool.allocate();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.tag(), 1);
    }

    #[test]
    fn recycles_released_buffers() {
        let pool = BufferAllocator::new(8, 1);
        let mut buf = pool.allocate();
        buf.try_push(unsafe { Address::from_usize(0x40) });
        let raw = buf.entries().as_ptr();
        pool.release(buf);
        let again = pool.allocate();
        assert_eq!(again.entries().as_ptr(), raw);
        assert!(again.is_empty());
    }
}
