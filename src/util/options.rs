//! Process-wide configuration for the post-barrier card-tracking machinery.
//!
//! Every option has a built-in default and can be overridden from the
//! environment with a `MANTLE_`-prefixed, upper-snake-case variable, e.g.
//! `MANTLE_WRITTEN_CARD_FILTER=Previous` or `MANTLE_WRITTEN_CARD_BUFFER_SIZE=256`.
//! Invalid values are ignored with a warning rather than aborting startup.

use std::str::FromStr;

use crate::queue::WrittenCardFilter;

/// How written-card logging is laid out and drained. Derived from the flag
/// pair (`use_inline_written_card_buffers`, `defer_dirtying_written_cards`);
/// the two flags are mutually exclusive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WrittenCardMode {
    /// Entries live in the in-struct array; overflow dirties cards in place.
    Inline,
    /// Entries live in an allocated buffer; overflow dirties cards in place.
    Indirect,
    /// Entries live in an allocated buffer; overflow hands the filled buffer
    /// to the global completed list for refinement threads to dirty.
    Deferred,
}

#[derive(Clone, Debug)]
pub struct Options {
    /// Master switch for written-card queues. When false the write barrier is
    /// expected to dirty cards directly and the overflow entry points return
    /// without effect.
    pub use_written_card_queues: bool,
    /// Use the small in-struct buffer instead of allocated buffers.
    pub use_inline_written_card_buffers: bool,
    /// Publish filled written-card buffers instead of dirtying in the mutator.
    pub defer_dirtying_written_cards: bool,
    /// Filter mode applied by the write barrier; process-wide constant.
    pub written_card_filter: WrittenCardFilter,
    /// Capacity (entries) of SATB log buffers. The SATB queue itself is the
    /// barrier sibling's concern; the value is carried here because the two
    /// queues share one sizing contract in the embedding runtime.
    pub satb_buffer_size: usize,
    /// Capacity (entries) of allocated written-card buffers.
    pub written_card_buffer_size: usize,
    /// Capacity (entries) of dirty-card buffers.
    pub update_buffer_size: usize,
    /// Period of the refinement-control update, in milliseconds.
    pub refinement_update_period_ms: u64,
    /// Size of a heap region in bytes; converts region allocation rates to
    /// byte rates in the refinement controller.
    pub region_size_bytes: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            use_written_card_queues: true,
            use_inline_written_card_buffers: false,
            defer_dirtying_written_cards: false,
            written_card_filter: WrittenCardFilter::None,
            satb_buffer_size: 1024,
            written_card_buffer_size: 512,
            update_buffer_size: 256,
            refinement_update_period_ms: 200,
            region_size_bytes: 1 << 20,
        }
    }
}

impl Options {
    /// Defaults overridden by any `MANTLE_*` environment variables.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        options.read_env();
        options
    }

    /// The storage/drain mode the flag pair selects.
    pub fn written_card_mode(&self) -> WrittenCardMode {
        if self.use_inline_written_card_buffers {
            WrittenCardMode::Inline
        } else if self.defer_dirtying_written_cards {
            WrittenCardMode::Deferred
        } else {
            WrittenCardMode::Indirect
        }
    }

    /// Panic on option combinations the machinery cannot run with.
    pub(crate) fn validate(&self) {
        assert!(
            !(self.use_inline_written_card_buffers && self.defer_dirtying_written_cards),
            "inline written-card buffers cannot be deferred"
        );
        assert!(
            self.written_card_buffer_size >= 4,
            "written-card buffers need room for the initial entries and the sentinel"
        );
        assert!(self.update_buffer_size >= 2);
        assert!(self.region_size_bytes.is_power_of_two());
        assert!(self.refinement_update_period_ms > 0);
    }

    fn read_env(&mut self) {
        read_flag("MANTLE_USE_WRITTEN_CARD_QUEUES", &mut self.use_written_card_queues);
        read_flag(
            "MANTLE_USE_INLINE_WRITTEN_CARD_BUFFERS",
            &mut self.use_inline_written_card_buffers,
        );
        read_flag(
            "MANTLE_DEFER_DIRTYING_WRITTEN_CARDS",
            &mut self.defer_dirtying_written_cards,
        );
        read_filter("MANTLE_WRITTEN_CARD_FILTER", &mut self.written_card_filter);
        read_size("MANTLE_SATB_BUFFER_SIZE", &mut self.satb_buffer_size);
        read_size("MANTLE_WRITTEN_CARD_BUFFER_SIZE", &mut self.written_card_buffer_size);
        read_size("MANTLE_UPDATE_BUFFER_SIZE", &mut self.update_buffer_size);
        read_size_u64(
            "MANTLE_REFINEMENT_UPDATE_PERIOD_MS",
            &mut self.refinement_update_period_ms,
        );
        read_size("MANTLE_REGION_SIZE_BYTES", &mut self.region_size_bytes);
    }
}

fn read_env_var<T: FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!("ignoring unparsable option {}={}", name, raw),
        }
    }
}

fn read_flag(name: &str, slot: &mut bool) {
    read_env_var(name, slot)
}

fn read_size(name: &str, slot: &mut usize) {
    read_env_var(name, slot)
}

fn read_size_u64(name: &str, slot: &mut u64) {
    read_env_var(name, slot)
}

/// The filter accepts both the mode names and the numeric encodings 0/1/2
/// the embedding runtime exposes.
fn read_filter(name: &str, slot: &mut WrittenCardFilter) {
    if let Ok(raw) = std::env::var(name) {
        let parsed = raw
            .parse::<WrittenCardFilter>()
            .ok()
            .or_else(|| raw.parse::<u8>().ok().and_then(WrittenCardFilter::from_repr));
        match parsed {
            Some(v) => *slot = v,
            None => warn!("ignoring unparsable option {}={}", name, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Options::default().validate();
    }

    #[test]
    fn mode_selection() {
        let mut options = Options::default();
        assert_eq!(options.written_card_mode(), WrittenCardMode::Indirect);
        options.defer_dirtying_written_cards = true;
        assert_eq!(options.written_card_mode(), WrittenCardMode::Deferred);
        options.defer_dirtying_written_cards = false;
        options.use_inline_written_card_buffers = true;
        assert_eq!(options.written_card_mode(), WrittenCardMode::Inline);
    }

    #[test]
    #[should_panic]
    fn inline_and_deferred_conflict() {
        let options = Options {
            use_inline_written_card_buffers: true,
            defer_dirtying_written_cards: true,
            ..Options::default()
        };
        options.validate();
    }

    #[test]
    fn filter_parses_both_spellings() {
        assert_eq!("Previous".parse::<WrittenCardFilter>().unwrap(), WrittenCardFilter::Previous);
        assert_eq!(WrittenCardFilter::from_repr(1).unwrap(), WrittenCardFilter::Young);
    }
}
