//! The per-thread post-barrier logs and their global sets.

pub mod dirty;
pub mod dirty_set;
pub mod written;
pub mod written_set;

pub use self::dirty::DirtyCardQueue;
pub use self::dirty_set::{CardRefiner, DirtyCardQueueSet};
pub use self::written::{WrittenCardQueue, WrittenCardQueueOffsets};
pub use self::written_set::WrittenCardQueueSet;

use strum_macros::{Display, EnumString, FromRepr};

use crate::util::Address;

/// Which filtering the write barrier applies before logging an entry into a
/// written-card queue. Process-wide constant; it also fixes what the logged
/// entries mean.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Display, EnumString, FromRepr)]
pub enum WrittenCardFilter {
    /// Entries are the raw written addresses.
    #[default]
    None = 0,
    /// Entries are card-entry pointers; the barrier already skipped young
    /// cards.
    Young = 1,
    /// Entries are card indices; the barrier already collapsed sequential
    /// duplicates against the trailing sentinel slot.
    Previous = 2,
}

/// The no-matching-card marker held in the reserved trailing slot of every
/// Previous-mode buffer. Compares unequal to every real card index.
pub const NO_MATCHING_CARD: Address = Address::MAX;

/// Entry capacity of the in-struct written-card buffer.
pub const INLINE_WRITTEN_CARD_SLOTS: usize = 36;

/// Entry capacity of the spillover buffer an indirect queue starts with
/// before its first real buffer is allocated.
pub const INITIAL_WRITTEN_CARD_SLOTS: usize = 2;

/// Allocation tags of the two buffer pools.
pub(crate) const WRITTEN_BUFFER_TAG: u32 = 1;
pub(crate) const DIRTY_BUFFER_TAG: u32 = 2;
