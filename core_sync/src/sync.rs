//! Report synchronization: seed a snapshot for (observer, turn), merge the
//! observer's report into it and commit the result in one step.

use std::collections::BTreeMap;

use report_schema::{FactionNumber, GameId, Report, UnitNumber};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::hashing::snapshot_digest;
use crate::merge::merge_reports;
use crate::metrics::SyncMetrics;
use crate::reconcile::{self, PassInput, ReconciliationError};
use crate::snapshot::WorldSnapshot;
use crate::store::{StoreError, TurnKey, WorldStore};

/// Which observer and turn a sync call is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncContext {
    pub game: GameId,
    pub observer: FactionNumber,
    pub turn: u32,
}

impl SyncContext {
    pub fn new(game: GameId, observer: FactionNumber, turn: u32) -> Self {
        Self {
            game,
            observer,
            turn,
        }
    }

    pub fn key(&self) -> TurnKey {
        TurnKey::new(self.game, self.observer, self.turn)
    }
}

/// The observer's own report plus any reports it is allowed to see.
#[derive(Debug, Clone, Default)]
pub struct ObserverReports {
    pub own: Option<Report>,
    pub shared: Vec<Report>,
}

impl ObserverReports {
    pub fn own(report: Report) -> Self {
        Self {
            own: Some(report),
            shared: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// The observer has no history yet.
    Fresh,
    /// A snapshot for this turn exists and is merged into again.
    Reload,
    /// Seeded from the previous turn's snapshot.
    CarryForward,
}

/// Snapshot a pass starts from.
#[derive(Debug, Clone)]
pub struct Seed {
    pub mode: SyncMode,
    pub snapshot: WorldSnapshot,
    pub prior_orders: BTreeMap<UnitNumber, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Committed {
        mode: SyncMode,
        metrics: SyncMetrics,
        digest: u64,
    },
    /// No own report for the turn; nothing was written.
    NotYetAvailable,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("reconciliation failed for observer {observer} at turn {turn}: {source}")]
    Reconciliation {
        observer: FactionNumber,
        turn: u32,
        #[source]
        source: ReconciliationError,
    },
    #[error(
        "observer {observer} has history up to turn {latest}; turn {requested} cannot be seeded"
    )]
    HistoryGap {
        observer: FactionNumber,
        latest: u32,
        requested: u32,
    },
    #[error("store failure for observer {observer} at turn {turn}: {source}")]
    Store {
        observer: FactionNumber,
        turn: u32,
        #[source]
        source: StoreError,
    },
}

/// Report synchronization engine. Stateless apart from its config, so one
/// instance can serve many observers concurrently.
#[derive(Debug, Clone, Default)]
pub struct SyncEngine {
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Pick the entry mode for `ctx` and load its seed.
    pub fn seed<S>(&self, store: &S, ctx: SyncContext) -> Result<Seed, SyncError>
    where
        S: WorldStore + ?Sized,
    {
        let store_err = |source: StoreError| SyncError::Store {
            observer: ctx.observer,
            turn: ctx.turn,
            source,
        };

        if let Some(snapshot) = store.load_snapshot(ctx.key()).map_err(store_err)? {
            return Ok(Seed {
                mode: SyncMode::Reload,
                snapshot,
                prior_orders: BTreeMap::new(),
            });
        }

        if let Some(previous_turn) = ctx.turn.checked_sub(1) {
            let previous_key = TurnKey::new(ctx.game, ctx.observer, previous_turn);
            if let Some(previous) = store.load_snapshot(previous_key).map_err(store_err)? {
                let carried = previous.carry_forward(ctx.turn);
                return Ok(Seed {
                    mode: SyncMode::CarryForward,
                    snapshot: carried.snapshot,
                    prior_orders: carried.prior_orders,
                });
            }
        }

        match store
            .latest_turn(ctx.game, ctx.observer)
            .map_err(store_err)?
        {
            None => Ok(Seed {
                mode: SyncMode::Fresh,
                snapshot: WorldSnapshot::new(ctx.game, ctx.observer, ctx.turn),
                prior_orders: BTreeMap::new(),
            }),
            Some(latest) => Err(SyncError::HistoryGap {
                observer: ctx.observer,
                latest,
                requested: ctx.turn,
            }),
        }
    }

    /// Merge `report` into `seed` without touching any store.
    ///
    /// The returned snapshot has its marks cleared and is ready to commit;
    /// the metrics describe what the pass changed.
    pub fn apply(
        &self,
        ctx: SyncContext,
        seed: Seed,
        report: &Report,
    ) -> Result<(WorldSnapshot, SyncMetrics), SyncError> {
        let reconciliation = |source: ReconciliationError| SyncError::Reconciliation {
            observer: ctx.observer,
            turn: ctx.turn,
            source,
        };
        if report.faction.number != ctx.observer {
            return Err(reconciliation(ReconciliationError::ForeignReport {
                expected: ctx.observer,
                found: report.faction.number,
            }));
        }

        let mut snapshot = seed.snapshot;
        let metrics = reconcile::apply(
            &mut snapshot,
            PassInput {
                report,
                prior_orders: &seed.prior_orders,
                pending_ship_grace_turns: self.config.pending_ship_grace_turns,
            },
        )
        .map_err(reconciliation)?;
        snapshot.clear_marks();
        Ok((snapshot, metrics))
    }

    /// Synchronize one observer's view of one turn and commit it.
    ///
    /// Nothing is written unless the whole merge succeeds; the commit is a
    /// single store call.
    pub fn sync<S>(
        &self,
        store: &S,
        ctx: SyncContext,
        reports: ObserverReports,
    ) -> Result<SyncOutcome, SyncError>
    where
        S: WorldStore + ?Sized,
    {
        let Some(own) = reports.own else {
            info!(
                target: "turn_runner::sync",
                game = %ctx.game,
                observer = %ctx.observer,
                turn = ctx.turn,
                "sync.skipped=not_yet_available"
            );
            return Ok(SyncOutcome::NotYetAvailable);
        };
        let report = if reports.shared.is_empty() {
            own
        } else {
            merge_reports(&own, &reports.shared)
        };

        let seed = self.seed(store, ctx)?;
        let mode = seed.mode;
        debug!(
            target: "turn_runner::sync",
            game = %ctx.game,
            observer = %ctx.observer,
            turn = ctx.turn,
            mode = ?mode,
            shared = reports.shared.len(),
            "sync.seeded"
        );

        let (snapshot, metrics) = match self.apply(ctx, seed, &report) {
            Ok(merged) => merged,
            Err(err) => {
                warn!(
                    target: "turn_runner::sync",
                    game = %ctx.game,
                    observer = %ctx.observer,
                    turn = ctx.turn,
                    error = %err,
                    "sync.aborted"
                );
                return Err(err);
            }
        };

        let store_err = |source: StoreError| SyncError::Store {
            observer: ctx.observer,
            turn: ctx.turn,
            source,
        };
        let digest = snapshot_digest(&snapshot)
            .map_err(StoreError::from)
            .map_err(store_err)?;
        store.commit_snapshot(&snapshot).map_err(store_err)?;

        info!(
            target: "turn_runner::sync",
            game = %ctx.game,
            observer = %ctx.observer,
            turn = ctx.turn,
            mode = ?mode,
            regions = snapshot.regions.len(),
            units = snapshot.units.len(),
            created = metrics.entities_created(),
            digest,
            "sync.committed"
        );
        Ok(SyncOutcome::Committed {
            mode,
            metrics,
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use report_schema::{
        BattleReport, Coords, Direction, EventCategory, ExitReport, FactionRef, RegionReport,
        ReportEvent, StructureKind, StructureReport, StructureUid, TemplateUnit, UnitReport,
    };

    use super::*;
    use crate::store::MemoryStore;

    const GAME: GameId = GameId(7);
    const OBSERVER: FactionNumber = FactionNumber(3);

    fn ctx(turn: u32) -> SyncContext {
        SyncContext::new(GAME, OBSERVER, turn)
    }

    fn own_unit(number: u32) -> UnitReport {
        UnitReport {
            number: UnitNumber(number),
            name: format!("Unit {number}"),
            faction: Some(FactionRef::new(OBSERVER.0, "Wardens")),
        }
    }

    /// A turn with a harbour region, a docked ship, an exit into fog, a
    /// battle and an income event.
    fn turn_report(ship_at: Coords) -> Report {
        let harbour = Coords::new(4, 4, 0);
        let mut report = Report::new(FactionRef::new(OBSERVER.0, "Wardens"));
        report.stances.ally.push(FactionRef::new(5, "Traders"));

        let mut region = RegionReport::new(harbour, "plain");
        region.population = 1200;
        region.units.push(own_unit(10));
        region.structures.push(StructureReport {
            number: 1,
            name: "Harbour Keep".into(),
            kind: StructureKind::Building,
            structure_type: "Tower".into(),
            units: vec![own_unit(11)],
        });
        region.exits.push(ExitReport {
            direction: Direction::Northeast,
            coords: Coords::new(5, 3, 0),
            terrain: "ocean".into(),
            name: "Atlantic".into(),
        });
        report.regions.push(region);

        let mut ship_region = RegionReport::new(ship_at, "ocean");
        if ship_at == harbour {
            report.regions[0].structures.push(StructureReport {
                number: 9,
                name: "Swift".into(),
                kind: StructureKind::Ship,
                structure_type: "Longboat".into(),
                units: vec![own_unit(12)],
            });
        } else {
            ship_region.structures.push(StructureReport {
                number: 9,
                name: "Swift".into(),
                kind: StructureKind::Ship,
                structure_type: "Longboat".into(),
                units: vec![own_unit(12)],
            });
            report.regions.push(ship_region);
        }

        report.battles.push(BattleReport {
            coords: Coords::new(6, 6, 0),
            attacker: UnitNumber(40),
            defender: UnitNumber(10),
            attacker_faction: Some(FactionRef::new(8, "Raiders")),
            defender_faction: Some(FactionRef::new(OBSERVER.0, "Wardens")),
            summary: "Raiders ambush the Wardens".into(),
        });
        report.events.push(ReportEvent {
            category: EventCategory::Income,
            message: "Collects $300 in taxes.".into(),
            region: Some(harbour),
            unit: Some(UnitNumber(10)),
        });
        report.order_template = vec![
            TemplateUnit {
                number: UnitNumber(10),
                orders: "tax".into(),
            },
            TemplateUnit {
                number: UnitNumber(12),
                orders: "sail NE".into(),
            },
        ];
        report
    }

    fn committed(outcome: SyncOutcome) -> (SyncMode, SyncMetrics, u64) {
        match outcome {
            SyncOutcome::Committed {
                mode,
                metrics,
                digest,
            } => (mode, metrics, digest),
            SyncOutcome::NotYetAvailable => panic!("expected a committed sync"),
        }
    }

    #[test]
    fn first_sync_is_fresh_and_seeds_orders_from_template() {
        let store = MemoryStore::new();
        let engine = SyncEngine::default();
        let report = turn_report(Coords::new(4, 4, 0));

        let (mode, metrics, _) =
            committed(engine.sync(&store, ctx(1), ObserverReports::own(report)).unwrap());
        assert_eq!(mode, SyncMode::Fresh);
        assert_eq!(metrics.units_created, 3);

        let snapshot = store.load_snapshot(ctx(1).key()).unwrap().unwrap();
        assert_eq!(snapshot.units[&UnitNumber(10)].orders, "tax");
        assert_eq!(snapshot.units[&UnitNumber(11)].orders, "");
        assert!(snapshot.factions.contains_key(&FactionNumber(8)));
        assert!(snapshot
            .factions
            .values()
            .all(|faction| faction.marks.is_empty()));
    }

    #[test]
    fn reload_is_idempotent() {
        let store = MemoryStore::new();
        let engine = SyncEngine::default();
        let report = turn_report(Coords::new(4, 4, 0));

        let (_, _, first_digest) = committed(
            engine
                .sync(&store, ctx(1), ObserverReports::own(report.clone()))
                .unwrap(),
        );
        let first = store.load_snapshot(ctx(1).key()).unwrap().unwrap();

        let (mode, metrics, second_digest) =
            committed(engine.sync(&store, ctx(1), ObserverReports::own(report)).unwrap());
        let second = store.load_snapshot(ctx(1).key()).unwrap().unwrap();

        assert_eq!(mode, SyncMode::Reload);
        assert_eq!(first, second);
        assert_eq!(first_digest, second_digest);
        assert!(metrics.events_skipped);
        assert_eq!(metrics.entities_created(), 0);
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.battles.len(), 1);
        assert_eq!(second.units.len(), 3);
    }

    #[test]
    fn carry_forward_keeps_identity_and_drops_transients() {
        let store = MemoryStore::new();
        let engine = SyncEngine::default();
        let harbour = Coords::new(4, 4, 0);
        let offshore = Coords::new(5, 3, 0);

        engine
            .sync(&store, ctx(1), ObserverReports::own(turn_report(harbour)))
            .unwrap();

        let seed = engine.seed(&store, ctx(2)).unwrap();
        assert_eq!(seed.mode, SyncMode::CarryForward);
        assert!(seed.snapshot.units.is_empty());
        assert!(seed.snapshot.events.is_empty());
        assert!(seed.snapshot.battles.is_empty());
        assert!(seed.snapshot.structures.keys().all(|uid| !uid.is_ship()));
        assert_eq!(seed.prior_orders.get(&UnitNumber(12)).map(String::as_str), Some("sail NE"));

        let mut next = turn_report(offshore);
        next.events.clear();
        next.battles.clear();
        next.order_template[1].orders = "sail N".into();
        let (mode, _, _) =
            committed(engine.sync(&store, ctx(2), ObserverReports::own(next)).unwrap());
        assert_eq!(mode, SyncMode::CarryForward);

        let turn1 = store.load_snapshot(ctx(1).key()).unwrap().unwrap();
        let turn2 = store.load_snapshot(ctx(2).key()).unwrap().unwrap();
        let ship = StructureUid::ship(9);
        assert_eq!(turn1.structures[&ship].region, harbour.uid());
        assert_eq!(turn2.structures[&ship].region, offshore.uid());
        let keep = StructureUid::building(harbour.uid(), 1).unwrap();
        assert!(turn2.structures.contains_key(&keep));
        // The placeholder from turn 1's exit gained full detail without a new UID.
        assert!(!turn1.regions[&offshore.uid()].explored);
        assert!(turn2.regions[&offshore.uid()].explored);
        // Orders carried from the previous turn beat the new template.
        assert_eq!(turn2.units[&UnitNumber(12)].orders, "sail NE");
        assert!(turn2.events.is_empty());
        assert!(turn2.battles.is_empty());
        // Committed history of turn 1 is untouched.
        assert_eq!(turn1.events.len(), 1);
    }

    #[test]
    fn missing_own_report_commits_nothing() {
        let store = MemoryStore::new();
        let outcome = SyncEngine::default()
            .sync(&store, ctx(1), ObserverReports::default())
            .unwrap();
        assert_eq!(outcome, SyncOutcome::NotYetAvailable);
        assert_eq!(store.snapshot_count(), 0);
    }

    #[test]
    fn skipped_turn_is_a_history_gap() {
        let store = MemoryStore::new();
        let engine = SyncEngine::default();
        engine
            .sync(
                &store,
                ctx(1),
                ObserverReports::own(turn_report(Coords::new(4, 4, 0))),
            )
            .unwrap();

        let err = engine
            .sync(
                &store,
                ctx(3),
                ObserverReports::own(turn_report(Coords::new(4, 4, 0))),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::HistoryGap {
                latest: 1,
                requested: 3,
                ..
            }
        ));
    }

    #[test]
    fn failed_merge_leaves_history_untouched() {
        let store = MemoryStore::new();
        let engine = SyncEngine::default();
        let mut report = turn_report(Coords::new(4, 4, 0));
        report.events.push(ReportEvent {
            category: EventCategory::Movement,
            message: "Walks off the map.".into(),
            region: Some(Coords::new(99, 99, 0)),
            unit: None,
        });

        let err = engine
            .sync(&store, ctx(1), ObserverReports::own(report))
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Reconciliation {
                source: ReconciliationError::UnresolvedEventRegion { .. },
                ..
            }
        ));
        assert_eq!(store.snapshot_count(), 0);
    }

    #[test]
    fn foreign_report_is_rejected() {
        let store = MemoryStore::new();
        let report = Report::new(FactionRef::new(4, "Someone else"));
        let err = SyncEngine::default()
            .sync(&store, ctx(1), ObserverReports::own(report))
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Reconciliation {
                source: ReconciliationError::ForeignReport { .. },
                ..
            }
        ));
    }

    #[test]
    fn shared_reports_add_allied_sightings() {
        let store = MemoryStore::new();
        let own = turn_report(Coords::new(4, 4, 0));
        let mut ally = Report::new(FactionRef::new(5, "Traders"));
        let mut far = RegionReport::new(Coords::new(20, 20, 0), "desert");
        far.units.push(UnitReport {
            number: UnitNumber(50),
            name: "Caravan".into(),
            faction: Some(FactionRef::new(5, "Traders")),
        });
        ally.regions.push(far);
        ally.battles.push(own.battles[0].clone());

        SyncEngine::default()
            .sync(
                &store,
                ctx(1),
                ObserverReports {
                    own: Some(own),
                    shared: vec![ally],
                },
            )
            .unwrap();

        let snapshot = store.load_snapshot(ctx(1).key()).unwrap().unwrap();
        assert!(snapshot.region_at(Coords::new(20, 20, 0)).unwrap().explored);
        assert_eq!(snapshot.units[&UnitNumber(50)].faction, Some(FactionNumber(5)));
        assert_eq!(snapshot.battles.len(), 1);
        assert_eq!(snapshot.events.len(), 1);
    }
}
