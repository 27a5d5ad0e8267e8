//! Report synchronization and the turn pipeline.
//!
//! Each faction receives a partial, turn-stamped report of the world. The
//! [`SyncEngine`] folds such a report into that faction's snapshot of the
//! previous turn, producing a committed per-observer [`WorldSnapshot`]. The
//! [`TurnPipeline`] runs the engine through `engine_runtime` and feeds every
//! resulting report through the sync engine.

mod config;
pub mod hashing;
mod merge;
pub mod metrics;
mod parser;
mod pipeline;
mod reconcile;
mod snapshot;
mod store;
mod sync;

pub use config::{
    load_pipeline_config_from_env, PipelineConfig, PipelineConfigError, SyncConfig,
    BUILTIN_PIPELINE_CONFIG, PIPELINE_CONFIG_ENV,
};
pub use merge::{merge_reports, mutual_allies};
pub use metrics::SyncMetrics;
pub use parser::{JsonReportParser, ReportParseError, ReportParser};
pub use pipeline::{
    ObserverResult, ObserverStatus, PipelineError, TurnOutcome, TurnPipeline, TurnSubmission,
};
pub use reconcile::ReconciliationError;
pub use snapshot::{
    AttitudeTable, BattleRecord, CarriedForward, EventRecord, ExitRecord, FactionRecord,
    RecordMarks, RegionRecord, StructureRecord, UnitRecord, WorldSnapshot,
};
pub use store::{FactionSlot, GameRecord, MemoryStore, StoreError, TurnKey, WorldStore};
pub use sync::{
    ObserverReports, Seed, SyncContext, SyncEngine, SyncError, SyncMode, SyncOutcome,
};
