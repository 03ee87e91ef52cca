//! Event dispatch: the sharded router, the per-dialog workers, and the
//! stale-subscription reaper.

pub mod dispatcher;
pub mod reaper;
pub mod worker;

pub use dispatcher::{AggregateStats, DialogDispatcher};
pub use reaper::{ReaperStats, StaleReaper};
pub use worker::{DialogWorker, StaleInfo, WorkerHandle, WorkerStats};
