//! Shared fixtures for unit and integration tests.

use atomic_refcell::AtomicRefCell;
use std::sync::Once;

/// Lazily created, shared test content. Unlike a plain `lazy_static`, the
/// fixture content is built on first use from inside a test, so a panicking
/// constructor fails the test that triggered it rather than aborting the
/// process.
pub struct Fixture<T: FixtureContent> {
    content: AtomicRefCell<Option<Box<T>>>,
    once: Once,
}

pub trait FixtureContent {
    fn create() -> Self;
}

unsafe impl<T: FixtureContent> Sync for Fixture<T> {}

impl<T: FixtureContent> Fixture<T> {
    pub const fn new() -> Self {
        Self {
            content: AtomicRefCell::new(None),
            once: Once::new(),
        }
    }

    pub fn with_fixture<F: FnOnce(&T)>(&self, func: F) {
        self.once.call_once(|| {
            *self.content.borrow_mut() = Some(Box::new(T::create()));
        });
        let borrow = self.content.borrow();
        func(borrow.as_ref().unwrap())
    }
}

impl<T: FixtureContent> Default for Fixture<T> {
    fn default() -> Self {
        Self::new()
    }
}
