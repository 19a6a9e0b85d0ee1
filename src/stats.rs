//! Per-thread refinement statistics.

use std::ops::{AddAssign, SubAssign};
use std::time::Duration;

/// Counts and times accumulated by refinement work and by written-card
/// processing. A plain value type: instances sum with `+=`, and `-=` undoes a
/// prior `+=` exactly.
///
/// `written_cards_total` counts every logged entry a drain examined;
/// `written_cards_dirtied` counts the entries whose card went clean to dirty,
/// and `written_cards_filtered` counts the rest (duplicate-collapsed entries
/// and entries whose card was already dirty or young).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RefinementStats {
    pub refinement_time: Duration,
    pub refined_cards: usize,
    pub precleaned_cards: usize,
    pub dirtied_cards: usize,
    pub written_cards_time: Duration,
    pub written_cards_dirtied: usize,
    pub written_cards_filtered: usize,
    pub written_cards_total: usize,
}

impl RefinementStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Cards refined per millisecond of refinement time; 0 with no time
    /// recorded yet.
    pub fn refined_cards_rate_ms(&self) -> f64 {
        Self::rate_per_ms(self.refined_cards, self.refinement_time)
    }

    /// Cards dirtied per millisecond of written-card processing time; 0 with
    /// no time recorded yet.
    pub fn written_cards_dirtied_rate_ms(&self) -> f64 {
        Self::rate_per_ms(self.written_cards_dirtied, self.written_cards_time)
    }

    fn rate_per_ms(count: usize, time: Duration) -> f64 {
        let ms = time.as_secs_f64() * 1000.0;
        if ms == 0.0 {
            0.0
        } else {
            count as f64 / ms
        }
    }
}

impl AddAssign for RefinementStats {
    fn add_assign(&mut self, rhs: Self) {
        self.refinement_time += rhs.refinement_time;
        self.refined_cards += rhs.refined_cards;
        self.precleaned_cards += rhs.precleaned_cards;
        self.dirtied_cards += rhs.dirtied_cards;
        self.written_cards_time += rhs.written_cards_time;
        self.written_cards_dirtied += rhs.written_cards_dirtied;
        self.written_cards_filtered += rhs.written_cards_filtered;
        self.written_cards_total += rhs.written_cards_total;
    }
}

impl SubAssign for RefinementStats {
    fn sub_assign(&mut self, rhs: Self) {
        self.refinement_time -= rhs.refinement_time;
        self.refined_cards -= rhs.refined_cards;
        self.precleaned_cards -= rhs.precleaned_cards;
        self.dirtied_cards -= rhs.dirtied_cards;
        self.written_cards_time -= rhs.written_cards_time;
        self.written_cards_dirtied -= rhs.written_cards_dirtied;
        self.written_cards_filtered -= rhs.written_cards_filtered;
        self.written_cards_total -= rhs.written_cards_total;
    }
}
