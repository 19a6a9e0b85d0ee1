//! Numeric conversion helpers.
//!
//! Range failures follow the fatal-assert model of the rest of the crate: a
//! value that cannot be represented in the destination type is a programming
//! error and panics with a diagnostic.

use num_traits::{NumCast, ToPrimitive};

use crate::util::constants::{BYTES_IN_WORD, LOG_BYTES_IN_WORD};

/// Cast between numeric types, panicking when the value does not fit the
/// destination range. For every value where the cast succeeds, casting back
/// recovers the original value.
pub fn checked_cast<From: ToPrimitive + Copy + std::fmt::Debug + NumCast, To: NumCast>(
    v: From,
) -> To {
    match num_traits::cast::cast::<From, To>(v) {
        Some(c) => c,
        None => panic!(
            "value {:?} not representable as {}",
            v,
            std::any::type_name::<To>()
        ),
    }
}

/// Whether `v` is representable as `To`.
pub fn fits<From: ToPrimitive + Copy + NumCast, To: NumCast>(v: From) -> bool {
    num_traits::cast::cast::<From, To>(v).is_some()
}

/// Convert a word-aligned byte count to a word count.
pub fn bytes_to_words(bytes: usize) -> usize {
    debug_assert!(bytes % BYTES_IN_WORD == 0);
    bytes >> LOG_BYTES_IN_WORD
}

/// Convert a word count to a byte count.
pub fn words_to_bytes(words: usize) -> usize {
    words << LOG_BYTES_IN_WORD
}
