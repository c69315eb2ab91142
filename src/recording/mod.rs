//! Chunk finalization and the supervising control loop
//!
//! - `Finalizer`: renames closed chunks, discards short ones, salvages crash leftovers
//! - `Supervisor`: startup recovery, split on size limit, integrity checks

mod finalizer;
mod supervisor;

pub use finalizer::{ChunkFs, FinalizeResult, Finalizer, LocalFs, DISCARD_THRESHOLD};
pub use supervisor::{RecorderSettings, RecoveryReport, Supervisor, MONITOR_INTERVAL};
