//! The lock-free buffer LIFO.
//!
//! Mutators publish filled buffers with a single compare-and-swap; consumers
//! pop inside an epoch critical section. The link cells are owned by the
//! epoch collector and retired through it, so a concurrent popper that still
//! holds a reference to an unlinked cell can never observe it recycled —
//! the reclaim-ordering role the source design gives its global-counter
//! critical section. Buffer payloads themselves move in and out as owned
//! boxes and are reused immediately.

use crossbeam::epoch::{self, Atomic, Owned, Shared};

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Buffer;

struct Link {
    buffer: ManuallyDrop<Box<Buffer>>,
    next: Atomic<Link>,
}

/// Treiber stack of buffers. `push` is a single CAS publish that retries only
/// under contention; `pop` takes no lock but is ordered with respect to link
/// reclaim by the pinned epoch.
pub struct BufferStack {
    top: Atomic<Link>,
}

impl BufferStack {
    pub const fn new() -> Self {
        Self {
            top: Atomic::null(),
        }
    }

    pub fn push(&self, buffer: Box<Buffer>) {
        let mut link = Owned::new(Link {
            buffer: ManuallyDrop::new(buffer),
            next: Atomic::null(),
        });
        let guard = epoch::pin();
        loop {
            let top = self.top.load(Ordering::Acquire, &guard);
            link.next.store(top, Ordering::Relaxed);
            match self
                .top
                .compare_exchange(top, link, Ordering::Release, Ordering::Relaxed, &guard)
            {
                Ok(_) => return,
                Err(e) => link = e.new,
            }
        }
    }

    pub fn pop(&self) -> Option<Box<Buffer>> {
        let guard = epoch::pin();
        loop {
            let top = self.top.load(Ordering::Acquire, &guard);
            let link = unsafe { top.as_ref() }?;
            let next = link.next.load(Ordering::Acquire, &guard);
            if self
                .top
                .compare_exchange(top, next, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_ok()
            {
                // The link is unreachable now; take the payload and retire the
                // cell. Readers pinned in older epochs may still inspect
                // `link.next`, which stays untouched until reclaim.
                let buffer = unsafe { ptr::read(&link.buffer) };
                unsafe { guard.defer_destroy(top) };
                return Some(ManuallyDrop::into_inner(buffer));
            }
        }
    }

    /// Detach the entire chain. Single swap; intended for safepoint-side
    /// draining where no concurrent push can interleave with the walk.
    pub fn pop_all(&self) -> Vec<Box<Buffer>> {
        let guard = epoch::pin();
        let mut cursor = self.top.swap(Shared::null(), Ordering::AcqRel, &guard);
        let mut detached = Vec::new();
        while let Some(link) = unsafe { cursor.as_ref() } {
            let next = link.next.load(Ordering::Relaxed, &guard);
            let buffer = unsafe { ptr::read(&link.buffer) };
            detached.push(ManuallyDrop::into_inner(buffer));
            unsafe { guard.defer_destroy(cursor) };
            cursor = next;
        }
        detached
    }

    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.top.load(Ordering::Acquire, &guard).is_null()
    }
}

impl Drop for BufferStack {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl Default for BufferStack {
    fn default() -> Self {
        Self::new()
    }
}

/// The completed-buffer list: the stack plus the published count of
/// outstanding cards. The count is incremented before the buffer is linked
/// and decremented after it is unlinked, so an observer's reading is always
/// at least the number of cards actually reachable through the list, with
/// equality whenever no operation is in flight.
pub struct CompletedBufferList {
    stack: BufferStack,
    num_cards: AtomicUsize,
}

impl CompletedBufferList {
    pub const fn new() -> Self {
        Self {
            stack: BufferStack::new(),
            num_cards: AtomicUsize::new(0),
        }
    }

    /// The published number of outstanding cards; an overestimate while a
    /// push or pop is in flight.
    pub fn num_cards(&self) -> usize {
        self.num_cards.load(Ordering::SeqCst)
    }

    pub fn push(&self, buffer: Box<Buffer>) {
        debug_assert!(!buffer.is_empty());
        self.num_cards.fetch_add(buffer.size(), Ordering::SeqCst);
        self.stack.push(buffer);
    }

    pub fn pop(&self) -> Option<Box<Buffer>> {
        let buffer = self.stack.pop()?;
        self.num_cards.fetch_sub(buffer.size(), Ordering::SeqCst);
        Some(buffer)
    }

    /// Detach all buffers; resets the card count. Safepoint-only.
    pub fn pop_all(&self) -> Vec<Box<Buffer>> {
        let detached = self.stack.pop_all();
        let cards: usize = detached.iter().map(|b| b.size()).sum();
        let before = self.num_cards.fetch_sub(cards, Ordering::SeqCst);
        debug_assert!(before >= cards);
        detached
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

impl Default for CompletedBufferList {
    fn default() -> Self {
        Self::new()
    }
}
