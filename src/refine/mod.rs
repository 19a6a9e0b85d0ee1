//! Concurrent-refinement control: how many refinement workers should run,
//! and the activation state machine those workers follow.

mod controller;
mod worker;

pub use self::controller::RefinementController;
pub use self::worker::{RefineStep, RefineWorkerGroup};

/// Analytic rate predictions consumed by the controller. All rates are per
/// millisecond; a returned 0.0 means "no estimate yet".
pub trait RefinementAnalytics {
    /// Predicted region allocation rate, regions/ms.
    fn alloc_region_rate_ms(&self) -> f64;
    /// Predicted rate at which written cards arrive, cards/ms.
    fn incoming_written_rate_ms(&self) -> f64;
    /// Predicted rate at which dirty cards arrive, cards/ms.
    fn incoming_dirty_rate_ms(&self) -> f64;
    /// Predicted per-thread rate of turning written cards into dirty cards,
    /// cards/ms.
    fn concurrent_dirtying_rate_ms(&self) -> f64;
    /// Predicted per-thread refinement rate, cards/ms.
    fn concurrent_refine_rate_ms(&self) -> f64;
}
