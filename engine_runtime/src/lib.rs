//! Runs the external turn engine in a disposable sandbox.
//!
//! The executor stages the world blob, roster and per-faction order files,
//! runs the engine with a wall-clock limit, and harvests the new world,
//! roster, faction reports and news articles. Nothing outside the sandbox is
//! touched; persisting the outputs is the caller's job.

mod executor;
mod orders;
mod roster;
mod sandbox;

pub use executor::{
    cancel_pair, Article, CancelHandle, CancelSignal, EngineOutput, EngineRequest, ExecutorConfig,
    ExecutorError, FailureReason, RunReport, TurnExecutor,
};
pub use orders::{FactionOrders, OrderBatch, SubmitError, UnitOrders};
pub use roster::{
    match_new_factions, render_players_in, validate_registrations, FactionMatches, Registration,
    RegistrationId, Roster, RosterEntry, RosterError,
};
pub use sandbox::{
    Sandbox, ARTICLE_PREFIX, PLAYERS_IN, PLAYERS_OUT, REPORT_PREFIX, WORLD_IN, WORLD_OUT,
};
