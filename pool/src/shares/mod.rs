/// Share verification and recording
///
/// `processor` runs the submit pipeline; `storage` persists accepted shares,
/// infractions and found blocks.

pub mod processor;
pub mod storage;

pub use processor::{ShareKind, ShareProcessor};
pub use storage::{BlockRecord, RedisStatsStore, ShareRecord, ShareTag, StatsStore};
