//! Combining several factions' partial views of one turn into a single report.

use std::collections::{BTreeMap, BTreeSet};

use report_schema::{BattleKey, BattleReport, FactionNumber, Report, Stance};

/// Merge `shared` reports into `own`.
///
/// Regions are unioned by coordinates; where both sides describe a region
/// the own report's detail wins and units and structures missing from it
/// are added. Battles are deduplicated by key. Events, stances and the order
/// template only ever come from the own report.
pub fn merge_reports(own: &Report, shared: &[Report]) -> Report {
    let mut merged = own.clone();
    let mut region_index: BTreeMap<_, usize> = merged
        .regions
        .iter()
        .enumerate()
        .map(|(idx, region)| (region.coords, idx))
        .collect();
    let mut battle_keys: BTreeSet<BattleKey> =
        merged.battles.iter().map(battle_key).collect();

    for report in shared {
        for region in &report.regions {
            let Some(&idx) = region_index.get(&region.coords) else {
                region_index.insert(region.coords, merged.regions.len());
                merged.regions.push(region.clone());
                continue;
            };
            let target = &mut merged.regions[idx];
            for unit in &region.units {
                if !target.units.iter().any(|known| known.number == unit.number) {
                    target.units.push(unit.clone());
                }
            }
            for structure in &region.structures {
                match target
                    .structures
                    .iter_mut()
                    .find(|known| known.number == structure.number && known.kind == structure.kind)
                {
                    Some(known) => {
                        for unit in &structure.units {
                            if !known.units.iter().any(|u| u.number == unit.number) {
                                known.units.push(unit.clone());
                            }
                        }
                    }
                    None => target.structures.push(structure.clone()),
                }
            }
            for exit in &region.exits {
                if !target.exits.iter().any(|known| known.direction == exit.direction) {
                    target.exits.push(exit.clone());
                }
            }
        }

        for battle in &report.battles {
            if battle_keys.insert(battle_key(battle)) {
                merged.battles.push(battle.clone());
            }
        }
    }
    merged
}

fn battle_key(battle: &BattleReport) -> BattleKey {
    BattleKey {
        region: battle.coords.uid(),
        attacker: battle.attacker,
        defender: battle.defender,
    }
}

/// Factions whose reports `observer` may see: those it declares as allies
/// that declare it an ally in return.
pub fn mutual_allies(
    observer: FactionNumber,
    reports: &BTreeMap<FactionNumber, Report>,
) -> Vec<FactionNumber> {
    let Some(own) = reports.get(&observer) else {
        return Vec::new();
    };
    own.stances
        .list(Stance::Ally)
        .iter()
        .map(|ally| ally.number)
        .filter(|ally| *ally != observer)
        .filter(|ally| {
            reports
                .get(ally)
                .is_some_and(|theirs| theirs.stances.declares(Stance::Ally, observer))
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use report_schema::{
        Coords, EventCategory, FactionRef, RegionReport, ReportEvent, StructureKind,
        StructureReport, UnitNumber, UnitReport,
    };

    use super::*;

    fn unit(number: u32, faction: u32) -> UnitReport {
        UnitReport {
            number: UnitNumber(number),
            name: format!("Unit {number}"),
            faction: Some(FactionRef::new(faction, format!("Faction {faction}"))),
        }
    }

    fn battle(attacker: u32, defender: u32) -> BattleReport {
        BattleReport {
            coords: Coords::new(4, 4, 0),
            attacker: UnitNumber(attacker),
            defender: UnitNumber(defender),
            attacker_faction: None,
            defender_faction: None,
            summary: "Skirmish".into(),
        }
    }

    #[test]
    fn shared_regions_are_unioned_with_own_detail_winning() {
        let mut own = Report::new(FactionRef::new(1, "Own"));
        let mut home = RegionReport::new(Coords::new(0, 0, 0), "plain");
        home.population = 500;
        home.units.push(unit(10, 1));
        own.regions.push(home);

        let mut ally = Report::new(FactionRef::new(2, "Ally"));
        let mut seen = RegionReport::new(Coords::new(0, 0, 0), "plain");
        seen.population = 480;
        seen.units.push(unit(10, 1));
        seen.units.push(unit(20, 2));
        seen.structures.push(StructureReport {
            number: 3,
            name: "Cog".into(),
            kind: StructureKind::Ship,
            structure_type: "Cog".into(),
            units: vec![unit(21, 2)],
        });
        ally.regions.push(seen);
        ally.regions
            .push(RegionReport::new(Coords::new(0, 1, 0), "forest"));
        ally.events.push(ReportEvent {
            category: EventCategory::Income,
            message: "Ally income".into(),
            region: None,
            unit: None,
        });

        let merged = merge_reports(&own, &[ally]);
        assert_eq!(merged.regions.len(), 2);
        let home = merged.region(Coords::new(0, 0, 0)).unwrap();
        assert_eq!(home.population, 500);
        let units: Vec<u32> = home.all_units().map(|u| u.number.0).collect();
        assert_eq!(units, vec![10, 20, 21]);
        assert!(merged.events.is_empty());
        assert_eq!(merged.faction.number, FactionNumber(1));
    }

    #[test]
    fn battles_seen_by_both_sides_are_kept_once() {
        let mut own = Report::new(FactionRef::new(1, "Own"));
        own.battles.push(battle(10, 20));
        let mut other = Report::new(FactionRef::new(2, "Other"));
        other.battles.push(battle(10, 20));
        other.battles.push(battle(11, 20));

        let merged = merge_reports(&own, &[other]);
        assert_eq!(merged.battles.len(), 2);
    }

    #[test]
    fn only_mutual_allies_share_views() {
        let mut reports = BTreeMap::new();
        let mut one = Report::new(FactionRef::new(1, "One"));
        one.stances.ally.push(FactionRef::new(2, "Two"));
        one.stances.ally.push(FactionRef::new(3, "Three"));
        let mut two = Report::new(FactionRef::new(2, "Two"));
        two.stances.ally.push(FactionRef::new(1, "One"));
        let three = Report::new(FactionRef::new(3, "Three"));
        reports.insert(FactionNumber(1), one);
        reports.insert(FactionNumber(2), two);
        reports.insert(FactionNumber(3), three);

        assert_eq!(mutual_allies(FactionNumber(1), &reports), vec![FactionNumber(2)]);
        assert_eq!(mutual_allies(FactionNumber(3), &reports), Vec::new());
        assert_eq!(mutual_allies(FactionNumber(9), &reports), Vec::new());
    }
}
