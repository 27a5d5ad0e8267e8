//! One full game cycle: engine run, new-faction resolution, raw output
//! persistence, per-observer sync and the turn pointer update.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use engine_runtime::{
    match_new_factions, validate_registrations, Article, CancelSignal, EngineRequest,
    ExecutorError, FactionOrders, OrderBatch, Registration, RegistrationId, Roster, RosterError,
    SubmitError, TurnExecutor,
};
use parking_lot::Mutex;
use rayon::prelude::*;
use report_schema::{FactionNumber, GameId, Report};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::merge::mutual_allies;
use crate::metrics::SyncMetrics;
use crate::parser::{JsonReportParser, ReportParseError, ReportParser};
use crate::store::{FactionSlot, GameRecord, StoreError, TurnKey, WorldStore};
use crate::sync::{ObserverReports, SyncContext, SyncEngine, SyncError, SyncMode, SyncOutcome};

/// Player input for one run.
#[derive(Debug, Clone, Default)]
pub struct TurnSubmission {
    pub orders: Vec<FactionOrders>,
    pub registrations: Vec<Registration>,
}

#[derive(Debug)]
pub enum ObserverStatus {
    Synced {
        mode: SyncMode,
        digest: u64,
        metrics: SyncMetrics,
    },
    NotYetAvailable,
    ParseFailed(ReportParseError),
    Failed(SyncError),
}

#[derive(Debug)]
pub struct ObserverResult {
    pub observer: FactionNumber,
    pub status: ObserverStatus,
}

impl ObserverResult {
    pub fn is_synced(&self) -> bool {
        matches!(self.status, ObserverStatus::Synced { .. })
    }
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub turn: u32,
    pub observers: Vec<ObserverResult>,
    pub resolved: Vec<(RegistrationId, FactionNumber)>,
    pub unresolved: Vec<RegistrationId>,
    pub articles: Vec<Article>,
}

impl TurnOutcome {
    pub fn observer(&self, faction: FactionNumber) -> Option<&ObserverResult> {
        self.observers.iter().find(|result| result.observer == faction)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("game {0} does not exist")]
    UnknownGame(GameId),
    #[error("game {0} already has a turn in progress")]
    Busy(GameId),
    #[error("invalid registrations for game {game}: {source}")]
    Registration {
        game: GameId,
        #[source]
        source: RosterError,
    },
    #[error("rejected orders for game {game}: {source}")]
    Orders {
        game: GameId,
        #[source]
        source: SubmitError,
    },
    #[error("engine run for game {game} turn {turn} failed: {source}")]
    Engine {
        game: GameId,
        turn: u32,
        #[source]
        source: ExecutorError,
    },
    #[error("engine roster for game {game} is unreadable: {source}")]
    Roster {
        game: GameId,
        #[source]
        source: RosterError,
    },
    #[error("store failure for game {game}: {source}")]
    Store {
        game: GameId,
        #[source]
        source: StoreError,
    },
    #[error("report of faction {faction} for game {game} turn {turn} is unreadable: {source}")]
    Parse {
        game: GameId,
        faction: FactionNumber,
        turn: u32,
        #[source]
        source: ReportParseError,
    },
    #[error("observer sync for game {game} was interrupted")]
    Interrupted { game: GameId },
    #[error(transparent)]
    Sync(#[from] SyncError),
}

struct ObserverJob {
    observer: FactionNumber,
    reports: Result<ObserverReports, ReportParseError>,
}

/// Sequences engine execution and report synchronization for hosted games.
pub struct TurnPipeline {
    config: Arc<PipelineConfig>,
    store: Arc<dyn WorldStore>,
    parser: Arc<dyn ReportParser>,
    executor: TurnExecutor,
    sync: SyncEngine,
    engine_binary: PathBuf,
    running: Mutex<HashSet<GameId>>,
}

/// Held from loading a game record until its next turn is saved.
struct TurnGuard<'a> {
    running: &'a Mutex<HashSet<GameId>>,
    game: GameId,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.game);
    }
}

impl TurnPipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<dyn WorldStore>,
        engine_binary: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor: TurnExecutor::new(config.executor.clone()),
            sync: SyncEngine::new(config.sync.clone()),
            config,
            store,
            parser: Arc::new(JsonReportParser),
            engine_binary: engine_binary.into(),
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn ReportParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorldStore> {
        &self.store
    }

    fn begin_turn(&self, game: GameId) -> Result<TurnGuard<'_>, PipelineError> {
        if !self.running.lock().insert(game) {
            return Err(PipelineError::Busy(game));
        }
        Ok(TurnGuard {
            running: &self.running,
            game,
        })
    }

    /// Run the engine for `game` and absorb its outputs.
    ///
    /// An engine failure returns before anything is persisted, leaving the
    /// game at its current turn. Sync failures are reported per observer and
    /// do not stop the turn from advancing. A second run for the same game
    /// is rejected with [`PipelineError::Busy`] until this one returns.
    pub async fn run_turn(
        &self,
        game: GameId,
        submission: TurnSubmission,
        cancel: Option<&CancelSignal>,
    ) -> Result<TurnOutcome, PipelineError> {
        let _turn = self.begin_turn(game)?;
        let store_err = |source: StoreError| PipelineError::Store { game, source };
        let mut record = self
            .store
            .load_game(game)
            .map_err(store_err)?
            .ok_or(PipelineError::UnknownGame(game))?;
        let turn = record.turn + 1;

        let mut pending = record.pending.clone();
        pending.extend(submission.registrations);
        validate_registrations(&pending)
            .map_err(|source| PipelineError::Registration { game, source })?;

        let orders = self.collect_orders(&record, submission.orders)?;
        let request = EngineRequest {
            game,
            engine_binary: self.engine_binary.clone(),
            world: record.world.clone(),
            roster: record.roster.clone(),
            registrations: pending.clone(),
            orders,
        };

        info!(
            target: "turn_runner::pipeline",
            %game,
            turn,
            factions = record.factions.len(),
            registrations = pending.len(),
            "turn.started"
        );
        let output = match self.executor.execute(&request, cancel).await {
            Ok(output) => output,
            Err(source) => {
                warn!(
                    target: "turn_runner::pipeline",
                    %game,
                    turn,
                    error = %source,
                    "turn.aborted=engine_failure"
                );
                return Err(PipelineError::Engine { game, turn, source });
            }
        };

        let roster = Roster::parse(&output.roster)
            .map_err(|source| PipelineError::Roster { game, source })?;
        self.persist_orders(game, record.turn, &request.orders)
            .map_err(store_err)?;
        let known: BTreeSet<FactionNumber> = record.active_factions().collect();
        let matches = match_new_factions(&roster, &known, &pending);
        for (registration, number) in &matches.resolved {
            let password = pending
                .iter()
                .find(|candidate| candidate.id == *registration)
                .and_then(|candidate| candidate.password.clone());
            record.factions.push(FactionSlot {
                number: *number,
                password,
            });
            info!(
                target: "turn_runner::pipeline",
                %game,
                registration = %registration,
                faction = %number,
                "registration.resolved"
            );
        }

        self.store
            .save_reports(game, turn, &output.reports)
            .map_err(store_err)?;
        self.store
            .save_articles(game, turn, &output.articles)
            .map_err(store_err)?;

        let mut observers: BTreeSet<FactionNumber> = record.active_factions().collect();
        observers.extend(output.reports.keys().copied());
        let parsed: BTreeMap<FactionNumber, Result<Report, ReportParseError>> = output
            .reports
            .iter()
            .map(|(faction, bytes)| (*faction, self.parser.parse_for(*faction, bytes)))
            .collect();
        let jobs = self.observer_jobs(observers, parsed);
        let results = self.sync_observers(game, turn, jobs).await?;

        record.turn = turn;
        record.world = output.world;
        record.roster = output.roster;
        record.pending = pending
            .into_iter()
            .filter(|registration| matches.unresolved.contains(&registration.id))
            .collect();
        self.store.save_game(&record).map_err(store_err)?;

        let synced = results.iter().filter(|result| result.is_synced()).count();
        info!(
            target: "turn_runner::pipeline",
            %game,
            turn,
            observers = results.len(),
            synced,
            unresolved = matches.unresolved.len(),
            elapsed_ms = output.run.elapsed.as_millis() as u64,
            "turn.completed"
        );

        Ok(TurnOutcome {
            turn,
            observers: results,
            resolved: matches.resolved,
            unresolved: matches.unresolved,
            articles: output.articles,
        })
    }

    /// Re-run the sync of one observer for a turn from the stored raw reports.
    pub fn resync_observer(
        &self,
        game: GameId,
        observer: FactionNumber,
        turn: u32,
    ) -> Result<SyncOutcome, PipelineError> {
        let store_err = |source: StoreError| PipelineError::Store { game, source };
        let Some(bytes) = self
            .store
            .load_report(game, turn, observer)
            .map_err(store_err)?
        else {
            return Ok(SyncOutcome::NotYetAvailable);
        };
        let own = self
            .parser
            .parse_for(observer, &bytes)
            .map_err(|source| PipelineError::Parse {
                game,
                faction: observer,
                turn,
                source,
            })?;

        let mut shared = Vec::new();
        if self.config.sync.share_allied_views {
            let record = self
                .store
                .load_game(game)
                .map_err(store_err)?
                .ok_or(PipelineError::UnknownGame(game))?;
            let mut reports = BTreeMap::new();
            for faction in record.active_factions().filter(|f| *f != observer) {
                let Some(bytes) = self.store.load_report(game, turn, faction).map_err(store_err)?
                else {
                    continue;
                };
                if let Ok(report) = self.parser.parse_for(faction, &bytes) {
                    reports.insert(faction, report);
                }
            }
            reports.insert(observer, own.clone());
            shared = mutual_allies(observer, &reports)
                .into_iter()
                .filter_map(|ally| reports.remove(&ally))
                .collect();
        }

        info!(
            target: "turn_runner::pipeline",
            %game,
            observer = %observer,
            turn,
            "observer.resync"
        );
        let outcome = self.sync.sync(
            self.store.as_ref(),
            SyncContext::new(game, observer, turn),
            ObserverReports {
                own: Some(own),
                shared,
            },
        )?;
        Ok(outcome)
    }

    /// Submitted orders verbatim; everyone else repeats the orders their
    /// units held in the latest committed snapshot.
    fn collect_orders(
        &self,
        record: &GameRecord,
        submitted: Vec<FactionOrders>,
    ) -> Result<Vec<FactionOrders>, PipelineError> {
        let game = record.id;
        let mut batch = OrderBatch::new(record.active_factions());
        for mut orders in submitted {
            if orders.password.is_none() {
                orders.password = record
                    .slot(orders.faction)
                    .and_then(|slot| slot.password.clone());
            }
            batch
                .submit(orders)
                .map_err(|source| PipelineError::Orders { game, source })?;
        }

        let mut standing = BTreeMap::new();
        for faction in batch.missing() {
            let password = record.slot(faction).and_then(|slot| slot.password.clone());
            let orders = self
                .standing_orders(game, faction, password)
                .map_err(|source| PipelineError::Store { game, source })?;
            info!(
                target: "turn_runner::pipeline",
                %game,
                %faction,
                units = orders.units.len(),
                "orders.auto_generated=standing"
            );
            standing.insert(faction, orders);
        }
        batch.fill_missing(|faction| {
            standing
                .remove(&faction)
                .unwrap_or_else(|| FactionOrders::new(faction, None))
        });
        Ok(batch.into_orders())
    }

    fn standing_orders(
        &self,
        game: GameId,
        faction: FactionNumber,
        password: Option<String>,
    ) -> Result<FactionOrders, StoreError> {
        let mut orders = FactionOrders::new(faction, password);
        let Some(latest) = self.store.latest_turn(game, faction)? else {
            return Ok(orders);
        };
        if let Some(snapshot) = self
            .store
            .load_snapshot(TurnKey::new(game, faction, latest))?
        {
            for unit in snapshot.own_units().filter(|unit| !unit.orders.is_empty()) {
                orders = orders.with_unit(unit.number, unit.orders.clone());
            }
        }
        Ok(orders)
    }

    /// Record the orders the engine just executed on the units of each
    /// faction's snapshot for `turn`, so the next carry-forward and the next
    /// standing orders repeat them.
    fn persist_orders(
        &self,
        game: GameId,
        turn: u32,
        orders: &[FactionOrders],
    ) -> Result<(), StoreError> {
        if turn == 0 {
            return Ok(());
        }
        for faction_orders in orders.iter().filter(|orders| !orders.units.is_empty()) {
            let faction = faction_orders.faction;
            let Some(mut snapshot) = self
                .store
                .load_snapshot(TurnKey::new(game, faction, turn))?
            else {
                continue;
            };
            let mut updated = 0usize;
            for unit_orders in &faction_orders.units {
                let Some(unit) = snapshot.units.get_mut(&unit_orders.unit) else {
                    continue;
                };
                if unit.faction == Some(faction) && unit.orders != unit_orders.orders {
                    unit.orders = unit_orders.orders.clone();
                    updated += 1;
                }
            }
            if updated > 0 {
                self.store.commit_snapshot(&snapshot)?;
                info!(
                    target: "turn_runner::pipeline",
                    %game,
                    %faction,
                    turn,
                    units = updated,
                    "orders.persisted"
                );
            }
        }
        Ok(())
    }

    fn observer_jobs(
        &self,
        observers: BTreeSet<FactionNumber>,
        mut parsed: BTreeMap<FactionNumber, Result<Report, ReportParseError>>,
    ) -> Vec<ObserverJob> {
        let readable: BTreeMap<FactionNumber, Report> = parsed
            .iter()
            .filter_map(|(faction, report)| Some((*faction, report.as_ref().ok()?.clone())))
            .collect();

        observers
            .into_iter()
            .map(|observer| {
                let reports = match parsed.remove(&observer) {
                    None => Ok(ObserverReports::default()),
                    Some(Err(err)) => Err(err),
                    Some(Ok(own)) => {
                        let shared = if self.config.sync.share_allied_views {
                            mutual_allies(observer, &readable)
                                .into_iter()
                                .filter_map(|ally| readable.get(&ally).cloned())
                                .collect()
                        } else {
                            Vec::new()
                        };
                        Ok(ObserverReports {
                            own: Some(own),
                            shared,
                        })
                    }
                };
                ObserverJob { observer, reports }
            })
            .collect()
    }

    /// Sync every observer on the blocking pool; observers run on rayon
    /// when `parallel_observers` is set.
    async fn sync_observers(
        &self,
        game: GameId,
        turn: u32,
        jobs: Vec<ObserverJob>,
    ) -> Result<Vec<ObserverResult>, PipelineError> {
        let store = Arc::clone(&self.store);
        let engine = self.sync.clone();
        let parallel = self.config.sync.parallel_observers;

        tokio::task::spawn_blocking(move || {
            let run = |job: ObserverJob| sync_observer(store.as_ref(), &engine, game, turn, job);
            let results: Vec<ObserverResult> = if parallel {
                jobs.into_par_iter().map(run).collect()
            } else {
                jobs.into_iter().map(run).collect()
            };
            results
        })
        .await
        .map_err(|_| PipelineError::Interrupted { game })
    }
}

fn sync_observer(
    store: &dyn WorldStore,
    engine: &SyncEngine,
    game: GameId,
    turn: u32,
    job: ObserverJob,
) -> ObserverResult {
    let observer = job.observer;
    let status = match job.reports {
        Err(err) => {
            warn!(
                target: "turn_runner::pipeline",
                %game,
                observer = %observer,
                turn,
                error = %err,
                "observer.report_unreadable"
            );
            ObserverStatus::ParseFailed(err)
        }
        Ok(reports) => match engine.sync(store, SyncContext::new(game, observer, turn), reports) {
            Ok(SyncOutcome::Committed {
                mode,
                metrics,
                digest,
            }) => ObserverStatus::Synced {
                mode,
                digest,
                metrics,
            },
            Ok(SyncOutcome::NotYetAvailable) => ObserverStatus::NotYetAvailable,
            Err(err) => {
                warn!(
                    target: "turn_runner::pipeline",
                    %game,
                    observer = %observer,
                    turn,
                    error = %err,
                    "observer.sync_failed"
                );
                ObserverStatus::Failed(err)
            }
        },
    };
    ObserverResult { observer, status }
}
