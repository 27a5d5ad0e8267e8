//! The merge passes applied to a seeded snapshot, in commit order.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use report_schema::{
    BattleKey, Coords, Direction, FactionNumber, RegionUid, Report, StructureKind,
    StructureReport, StructureUid, UidError, UnitNumber,
};
use thiserror::Error;
use tracing::debug;

use crate::metrics::SyncMetrics;
use crate::snapshot::{
    BattleRecord, EventRecord, ExitRecord, FactionRecord, RecordMarks, RegionRecord,
    StructureRecord, UnitRecord, WorldSnapshot,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error("report belongs to faction {found}, not to observer {expected}")]
    ForeignReport {
        expected: FactionNumber,
        found: FactionNumber,
    },
    #[error("event '{message}' references unknown region {coords}")]
    UnresolvedEventRegion { coords: Coords, message: String },
    #[error("unit {unit} references unknown faction {faction}")]
    UnknownUnitFaction {
        unit: UnitNumber,
        faction: FactionNumber,
    },
    #[error("unit {unit} is placed in {structure}, which is not in region {region}")]
    StructureOutsideRegion {
        unit: UnitNumber,
        structure: StructureUid,
        region: RegionUid,
    },
    #[error(transparent)]
    Uid(#[from] UidError),
}

/// Inputs of one pass besides the snapshot being merged into.
pub(crate) struct PassInput<'a> {
    pub report: &'a Report,
    pub prior_orders: &'a BTreeMap<UnitNumber, String>,
    pub pending_ship_grace_turns: u32,
}

/// Merge `input.report` into `snapshot`.
///
/// On error the snapshot is left half-merged; callers discard it.
pub(crate) fn apply(
    snapshot: &mut WorldSnapshot,
    input: PassInput<'_>,
) -> Result<SyncMetrics, ReconciliationError> {
    let mut metrics = SyncMetrics::default();
    let report = input.report;

    sync_factions(snapshot, report, &mut metrics);
    sync_attitudes(snapshot, report, &mut metrics);
    sync_regions(snapshot, report, &mut metrics);
    sync_structures(snapshot, report, &mut metrics)?;
    sync_units(snapshot, report, input.prior_orders, &mut metrics)?;
    sync_battles(snapshot, report, &mut metrics);
    sync_exits(snapshot, report, &mut metrics);
    sync_events(snapshot, report, &mut metrics)?;
    prune_pending_ships(snapshot, input.pending_ship_grace_turns, &mut metrics);

    Ok(metrics)
}

fn sync_factions(snapshot: &mut WorldSnapshot, report: &Report, metrics: &mut SyncMetrics) {
    for faction in report.mentioned_factions() {
        match snapshot.factions.entry(faction.number) {
            Entry::Vacant(slot) => {
                slot.insert(FactionRecord {
                    number: faction.number,
                    name: faction.name.clone(),
                    marks: RecordMarks::NEW,
                });
                metrics.factions_created += 1;
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if !faction.name.is_empty() && record.name != faction.name {
                    record.name = faction.name.clone();
                    record.marks.touch();
                    metrics.factions_renamed += 1;
                }
            }
        }
    }
}

/// Per stance, drop targets no longer listed and add newly listed ones.
/// Stances are applied in [`report_schema::Stance::ALL`] order, so a target
/// listed twice keeps the later stance.
fn sync_attitudes(snapshot: &mut WorldSnapshot, report: &Report, metrics: &mut SyncMetrics) {
    let observer = snapshot.observer;
    let attitudes = &mut snapshot.attitudes;
    attitudes.default_stance = report.default_stance;

    for (stance, listed) in report.stances.iter() {
        let declared: BTreeSet<FactionNumber> = listed
            .iter()
            .map(|faction| faction.number)
            .filter(|number| *number != observer)
            .collect();
        let current: BTreeSet<FactionNumber> = attitudes.targets_with(stance).collect();

        for stale in current.difference(&declared) {
            attitudes.stances.remove(stale);
            metrics.attitudes_removed += 1;
        }
        for added in declared.difference(&current) {
            attitudes.stances.insert(*added, stance);
            metrics.attitudes_added += 1;
        }
    }
}

fn sync_regions(snapshot: &mut WorldSnapshot, report: &Report, metrics: &mut SyncMetrics) {
    let observer = snapshot.observer;
    let turn = snapshot.turn;
    for region in &report.regions {
        let visited = region.has_units_of(observer);
        match snapshot.regions.entry(region.coords.uid()) {
            Entry::Vacant(slot) => {
                let mut record = RegionRecord::from_report(region);
                record.last_visited = visited.then_some(turn);
                slot.insert(record);
                metrics.regions_created += 1;
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                let mut changed = record.apply_report(region);
                if visited && record.last_visited != Some(turn) {
                    record.last_visited = Some(turn);
                    changed = true;
                }
                if changed {
                    record.marks.touch();
                    metrics.regions_updated += 1;
                }
            }
        }
    }
}

fn structure_uid(region: RegionUid, structure: &StructureReport) -> Result<StructureUid, UidError> {
    match structure.kind {
        StructureKind::Building => StructureUid::building(region, structure.number),
        StructureKind::Ship => Ok(StructureUid::ship(structure.number)),
    }
}

fn refresh_structure(
    record: &mut StructureRecord,
    report: &StructureReport,
    region: RegionUid,
    turn: u32,
) -> bool {
    let changed = record.name != report.name
        || record.structure_type != report.structure_type
        || record.region != region;
    record.name = report.name.clone();
    record.structure_type = report.structure_type.clone();
    record.region = region;
    record.last_seen = turn;
    changed
}

/// Buildings are refreshed in place; a building missing from a region that
/// was observed this pass is gone. Ships are matched by UID wherever they
/// show up; unseen ships move to the pending table instead of being removed.
fn sync_structures(
    snapshot: &mut WorldSnapshot,
    report: &Report,
    metrics: &mut SyncMetrics,
) -> Result<(), ReconciliationError> {
    let turn = snapshot.turn;
    let observed_regions: BTreeSet<RegionUid> =
        report.regions.iter().map(|region| region.coords.uid()).collect();
    let mut seen = BTreeSet::new();

    for region in &report.regions {
        let region_uid = region.coords.uid();
        for structure in &region.structures {
            let uid = structure_uid(region_uid, structure)?;
            seen.insert(uid);

            if let Some(existing) = snapshot.structures.get_mut(&uid) {
                if refresh_structure(existing, structure, region_uid, turn) {
                    existing.marks.touch();
                }
            } else if let Some(mut parked) = snapshot.pending_ships.remove(&uid) {
                refresh_structure(&mut parked, structure, region_uid, turn);
                parked.marks.touch();
                snapshot.structures.insert(uid, parked);
                metrics.ships_reattached += 1;
            } else {
                snapshot.structures.insert(
                    uid,
                    StructureRecord {
                        uid,
                        number: structure.number,
                        kind: structure.kind,
                        name: structure.name.clone(),
                        structure_type: structure.structure_type.clone(),
                        region: region_uid,
                        last_seen: turn,
                        marks: RecordMarks::NEW,
                    },
                );
                metrics.structures_created += 1;
            }
        }
    }

    let unseen: Vec<StructureUid> = snapshot
        .structures
        .keys()
        .filter(|uid| !seen.contains(uid))
        .copied()
        .collect();
    for uid in unseen {
        if uid.is_ship() {
            if let Some(ship) = snapshot.structures.remove(&uid) {
                snapshot.pending_ships.insert(uid, ship);
                metrics.ships_pending += 1;
            }
        } else if uid
            .home_region()
            .is_some_and(|home| observed_regions.contains(&home))
        {
            snapshot.structures.remove(&uid);
            metrics.structures_removed += 1;
        }
    }
    Ok(())
}

/// Orders are resolved once per unit: the record's existing orders, then the
/// previous turn's, then the report's order template.
fn sync_units(
    snapshot: &mut WorldSnapshot,
    report: &Report,
    prior_orders: &BTreeMap<UnitNumber, String>,
    metrics: &mut SyncMetrics,
) -> Result<(), ReconciliationError> {
    let template: BTreeMap<UnitNumber, &str> = report
        .order_template
        .iter()
        .map(|unit| (unit.number, unit.orders.as_str()))
        .collect();
    let mut seen = BTreeSet::new();

    for region in &report.regions {
        let region_uid = region.coords.uid();
        let placements = region.units.iter().map(|unit| (unit, None)).chain(
            region
                .structures
                .iter()
                .flat_map(|structure| structure.units.iter().map(move |unit| (unit, Some(structure)))),
        );

        for (unit, structure) in placements {
            if !seen.insert(unit.number) {
                debug!(
                    target: "turn_runner::sync",
                    unit = %unit.number,
                    region = %region_uid,
                    "unit.skipped=duplicate_sighting"
                );
                continue;
            }

            let structure_uid = structure
                .map(|structure| structure_uid(region_uid, structure))
                .transpose()?;
            if let Some(uid) = structure_uid {
                let in_region = snapshot
                    .structures
                    .get(&uid)
                    .is_some_and(|structure| structure.region == region_uid);
                if !in_region {
                    return Err(ReconciliationError::StructureOutsideRegion {
                        unit: unit.number,
                        structure: uid,
                        region: region_uid,
                    });
                }
            }

            let faction = unit.faction.as_ref().map(|faction| faction.number);
            if let Some(faction) = faction {
                if !snapshot.factions.contains_key(&faction) {
                    return Err(ReconciliationError::UnknownUnitFaction {
                        unit: unit.number,
                        faction,
                    });
                }
            }

            match snapshot.units.entry(unit.number) {
                Entry::Occupied(mut slot) => {
                    let record = slot.get_mut();
                    let changed = record.name != unit.name
                        || record.faction != faction
                        || record.region != region_uid
                        || record.structure != structure_uid;
                    if changed {
                        record.name = unit.name.clone();
                        record.faction = faction;
                        record.region = region_uid;
                        record.structure = structure_uid;
                        record.marks.touch();
                    }
                }
                Entry::Vacant(slot) => {
                    let orders = prior_orders
                        .get(&unit.number)
                        .cloned()
                        .or_else(|| template.get(&unit.number).map(|orders| orders.to_string()))
                        .unwrap_or_default();
                    slot.insert(UnitRecord {
                        number: unit.number,
                        name: unit.name.clone(),
                        faction,
                        region: region_uid,
                        structure: structure_uid,
                        orders,
                        marks: RecordMarks::NEW,
                    });
                    metrics.units_created += 1;
                }
            }
        }
    }

    let before = snapshot.units.len();
    snapshot.units.retain(|number, _| seen.contains(number));
    metrics.units_removed += (before - snapshot.units.len()) as u32;
    Ok(())
}

fn sync_battles(snapshot: &mut WorldSnapshot, report: &Report, metrics: &mut SyncMetrics) {
    for battle in &report.battles {
        let region = battle.coords.uid();
        if let Entry::Vacant(slot) = snapshot.regions.entry(region) {
            slot.insert(RegionRecord::placeholder(battle.coords, "", ""));
            metrics.placeholders_created += 1;
        }

        let key = BattleKey {
            region,
            attacker: battle.attacker,
            defender: battle.defender,
        };
        if snapshot.battle(&key).is_some() {
            metrics.battles_duplicate += 1;
            continue;
        }
        snapshot.battles.push(BattleRecord {
            key,
            attacker_faction: battle.attacker_faction.as_ref().map(|f| f.number),
            defender_faction: battle.defender_faction.as_ref().map(|f| f.number),
            summary: battle.summary.clone(),
            marks: RecordMarks::NEW,
        });
        metrics.battles_recorded += 1;
    }
}

/// Write every reported edge, creating placeholder targets. An edge into a
/// region that is still unexplored also gets its reverse edge, so the link is
/// reachable from both ends.
fn sync_exits(snapshot: &mut WorldSnapshot, report: &Report, metrics: &mut SyncMetrics) {
    for region in &report.regions {
        let origin = region.coords.uid();
        for exit in &region.exits {
            let target = exit.coords.uid();
            let target_explored = match snapshot.regions.entry(target) {
                Entry::Vacant(slot) => {
                    slot.insert(RegionRecord::placeholder(exit.coords, &exit.terrain, &exit.name));
                    metrics.placeholders_created += 1;
                    false
                }
                Entry::Occupied(mut slot) => {
                    let record = slot.get_mut();
                    if !record.explored {
                        let mut changed = false;
                        if !exit.terrain.is_empty() && record.terrain != exit.terrain {
                            record.terrain = exit.terrain.clone();
                            changed = true;
                        }
                        if !exit.name.is_empty() && record.name != exit.name {
                            record.name = exit.name.clone();
                            changed = true;
                        }
                        if changed {
                            record.marks.touch();
                        }
                    }
                    record.explored
                }
            };

            if write_edge(snapshot, origin, exit.direction, target, false) {
                metrics.exits_written += 1;
            }
            if !target_explored
                && write_edge(snapshot, target, exit.direction.opposite(), origin, true)
            {
                metrics.exits_reciprocal += 1;
            }
        }
    }
}

/// Upsert one directed edge. A synthesized edge never replaces a reported one.
fn write_edge(
    snapshot: &mut WorldSnapshot,
    origin: RegionUid,
    direction: Direction,
    target: RegionUid,
    reciprocal: bool,
) -> bool {
    match snapshot.exits.entry(origin).or_default().entry(direction) {
        Entry::Vacant(slot) => {
            slot.insert(ExitRecord {
                target,
                reciprocal,
                marks: RecordMarks::NEW,
            });
            true
        }
        Entry::Occupied(mut slot) => {
            let record = slot.get_mut();
            if reciprocal && !record.reciprocal {
                return false;
            }
            if record.target == target && record.reciprocal == reciprocal {
                return false;
            }
            record.target = target;
            record.reciprocal = reciprocal;
            record.marks.touch();
            true
        }
    }
}

/// Events are imported at most once per (observer, turn).
fn sync_events(
    snapshot: &mut WorldSnapshot,
    report: &Report,
    metrics: &mut SyncMetrics,
) -> Result<(), ReconciliationError> {
    let observer = snapshot.observer;
    let turn = snapshot.turn;
    if snapshot.has_events_for(observer, turn) {
        metrics.events_skipped = true;
        return Ok(());
    }

    let mut staged = Vec::with_capacity(report.events.len());
    for event in &report.events {
        let region = match event.region {
            Some(coords) if snapshot.regions.contains_key(&coords.uid()) => Some(coords.uid()),
            Some(coords) => {
                return Err(ReconciliationError::UnresolvedEventRegion {
                    coords,
                    message: event.message.clone(),
                })
            }
            None => None,
        };
        if event.category.is_economic() {
            metrics.economic_events += 1;
        }
        staged.push(EventRecord {
            faction: observer,
            turn,
            category: event.category,
            message: event.message.clone(),
            region,
            unit: event.unit,
        });
    }
    metrics.events_appended += staged.len() as u32;
    snapshot.events.extend(staged);
    Ok(())
}

fn prune_pending_ships(snapshot: &mut WorldSnapshot, grace_turns: u32, metrics: &mut SyncMetrics) {
    let turn = snapshot.turn;
    snapshot.pending_ships.retain(|uid, ship| {
        let keep = turn.saturating_sub(ship.last_seen) <= grace_turns;
        if !keep {
            debug!(
                target: "turn_runner::sync",
                ship = %uid,
                last_seen = ship.last_seen,
                "ship.dropped=unobserved"
            );
            metrics.ships_dropped += 1;
        }
        keep
    });
}
