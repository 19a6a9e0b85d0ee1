//! Word and card geometry constants.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// log2 of the number of bytes in a word (pointer-sized slot).
        pub const LOG_BYTES_IN_WORD: usize = 3;
    } else {
        /// log2 of the number of bytes in a word (pointer-sized slot).
        pub const LOG_BYTES_IN_WORD: usize = 2;
    }
}

/// The number of bytes in a word.
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;

/// log2 of the number of bytes summarized by one card-table byte.
pub const LOG_BYTES_IN_CARD: usize = 9;

/// The number of heap bytes summarized by one card-table byte.
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;

/// Mask of the in-card offset bits of an address.
pub const CARD_MASK: usize = BYTES_IN_CARD - 1;
