//! Per-observer, per-turn world model.

use std::collections::BTreeMap;

use bitflags::bitflags;
use report_schema::{
    BattleKey, Coords, Direction, EventCategory, FactionNumber, GameId, MarketEntry, Production,
    RegionReport, RegionUid, Settlement, Stance, StructureKind, StructureUid, UnitNumber,
};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Change marks set while a sync pass runs. Cleared on commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RecordMarks: u8 {
        const NEW = 1 << 0;
        const UPDATED = 1 << 1;
    }
}

impl RecordMarks {
    /// Flag an existing record as updated unless it was created in this pass.
    pub fn touch(&mut self) {
        if !self.contains(RecordMarks::NEW) {
            self.insert(RecordMarks::UPDATED);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactionRecord {
    pub number: FactionNumber,
    pub name: String,
    pub marks: RecordMarks,
}

/// The observer's declared stances. At most one stance per target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttitudeTable {
    pub default_stance: Stance,
    pub stances: BTreeMap<FactionNumber, Stance>,
}

impl AttitudeTable {
    pub fn stance_toward(&self, target: FactionNumber) -> Stance {
        self.stances
            .get(&target)
            .copied()
            .unwrap_or(self.default_stance)
    }

    pub fn targets_with(&self, stance: Stance) -> impl Iterator<Item = FactionNumber> + '_ {
        self.stances
            .iter()
            .filter(move |(_, s)| **s == stance)
            .map(|(target, _)| *target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub uid: RegionUid,
    pub coords: Coords,
    /// False for placeholders known only as an exit or battle location.
    pub explored: bool,
    pub terrain: String,
    pub name: String,
    pub settlement: Option<Settlement>,
    pub population: u32,
    pub race: Option<String>,
    pub wealth: u32,
    pub tax: u32,
    pub wages: f32,
    pub wanted: Vec<MarketEntry>,
    pub for_sale: Vec<MarketEntry>,
    pub products: Vec<Production>,
    pub last_visited: Option<u32>,
    pub marks: RecordMarks,
}

impl RegionRecord {
    pub fn placeholder(coords: Coords, terrain: &str, name: &str) -> Self {
        Self {
            uid: coords.uid(),
            coords,
            explored: false,
            terrain: terrain.to_string(),
            name: name.to_string(),
            settlement: None,
            population: 0,
            race: None,
            wealth: 0,
            tax: 0,
            wages: 0.0,
            wanted: Vec::new(),
            for_sale: Vec::new(),
            products: Vec::new(),
            last_visited: None,
            marks: RecordMarks::NEW,
        }
    }

    pub fn from_report(report: &RegionReport) -> Self {
        let mut record = Self::placeholder(report.coords, "", "");
        record.apply_report(report);
        record
    }

    /// Overwrite every descriptive field. Returns whether anything changed.
    pub fn apply_report(&mut self, report: &RegionReport) -> bool {
        let before = self.clone();
        self.explored = true;
        self.terrain = report.terrain.clone();
        self.name = report.name.clone();
        self.settlement = report.settlement.clone();
        self.population = report.population;
        self.race = report.race.clone();
        self.wealth = report.wealth;
        self.tax = report.tax;
        self.wages = report.wages;
        self.wanted = report.wanted.clone();
        self.for_sale = report.for_sale.clone();
        self.products = report.products.clone();
        *self != before
    }
}

/// Directed edge `origin --direction--> target`. The origin and direction are
/// the key in [`WorldSnapshot::exits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub target: RegionUid,
    /// Synthesized from the other end rather than reported.
    pub reciprocal: bool,
    pub marks: RecordMarks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureRecord {
    pub uid: StructureUid,
    pub number: u32,
    pub kind: StructureKind,
    pub name: String,
    pub structure_type: String,
    pub region: RegionUid,
    pub last_seen: u32,
    pub marks: RecordMarks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub number: UnitNumber,
    pub name: String,
    pub faction: Option<FactionNumber>,
    pub region: RegionUid,
    pub structure: Option<StructureUid>,
    pub orders: String,
    pub marks: RecordMarks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub faction: FactionNumber,
    pub turn: u32,
    pub category: EventCategory,
    pub message: String,
    pub region: Option<RegionUid>,
    pub unit: Option<UnitNumber>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleRecord {
    pub key: BattleKey,
    pub attacker_faction: Option<FactionNumber>,
    pub defender_faction: Option<FactionNumber>,
    pub summary: String,
    pub marks: RecordMarks,
}

/// Everything one observer knows about the world at one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub game: GameId,
    pub observer: FactionNumber,
    pub turn: u32,
    pub factions: BTreeMap<FactionNumber, FactionRecord>,
    pub attitudes: AttitudeTable,
    pub regions: BTreeMap<RegionUid, RegionRecord>,
    pub exits: BTreeMap<RegionUid, BTreeMap<Direction, ExitRecord>>,
    pub structures: BTreeMap<StructureUid, StructureRecord>,
    /// Ships that were not seen in the latest pass, neither attached nor dropped.
    pub pending_ships: BTreeMap<StructureUid, StructureRecord>,
    pub units: BTreeMap<UnitNumber, UnitRecord>,
    pub events: Vec<EventRecord>,
    pub battles: Vec<BattleRecord>,
}

/// Seed for the turn after a committed snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CarriedForward {
    pub snapshot: WorldSnapshot,
    /// Orders the previous turn's units held, by unit number.
    pub prior_orders: BTreeMap<UnitNumber, String>,
}

impl WorldSnapshot {
    pub fn new(game: GameId, observer: FactionNumber, turn: u32) -> Self {
        Self {
            game,
            observer,
            turn,
            factions: BTreeMap::new(),
            attitudes: AttitudeTable::default(),
            regions: BTreeMap::new(),
            exits: BTreeMap::new(),
            structures: BTreeMap::new(),
            pending_ships: BTreeMap::new(),
            units: BTreeMap::new(),
            events: Vec::new(),
            battles: Vec::new(),
        }
    }

    pub fn region_at(&self, coords: Coords) -> Option<&RegionRecord> {
        self.regions.get(&coords.uid())
    }

    pub fn exit(&self, origin: RegionUid, direction: Direction) -> Option<&ExitRecord> {
        self.exits.get(&origin)?.get(&direction)
    }

    pub fn battle(&self, key: &BattleKey) -> Option<&BattleRecord> {
        self.battles.iter().find(|battle| battle.key == *key)
    }

    pub fn own_units(&self) -> impl Iterator<Item = &UnitRecord> {
        let observer = self.observer;
        self.units
            .values()
            .filter(move |unit| unit.faction == Some(observer))
    }

    pub fn has_events_for(&self, faction: FactionNumber, turn: u32) -> bool {
        self.events
            .iter()
            .any(|event| event.faction == faction && event.turn == turn)
    }

    pub fn clear_marks(&mut self) {
        for faction in self.factions.values_mut() {
            faction.marks = RecordMarks::empty();
        }
        for region in self.regions.values_mut() {
            region.marks = RecordMarks::empty();
        }
        for exit in self.exits.values_mut().flat_map(BTreeMap::values_mut) {
            exit.marks = RecordMarks::empty();
        }
        for structure in self
            .structures
            .values_mut()
            .chain(self.pending_ships.values_mut())
        {
            structure.marks = RecordMarks::empty();
        }
        for unit in self.units.values_mut() {
            unit.marks = RecordMarks::empty();
        }
        for battle in &mut self.battles {
            battle.marks = RecordMarks::empty();
        }
    }

    /// Copy the long-lived part of this snapshot forward to `next_turn`.
    ///
    /// Regions, exits, buildings, factions and attitudes are kept. Ships move
    /// to the pending table, units are dropped (their orders are returned as
    /// `prior_orders`), events and battles are dropped.
    pub fn carry_forward(&self, next_turn: u32) -> CarriedForward {
        let mut structures = BTreeMap::new();
        let mut pending_ships = self.pending_ships.clone();
        for (uid, structure) in &self.structures {
            if uid.is_ship() {
                pending_ships.insert(*uid, structure.clone());
            } else {
                structures.insert(*uid, structure.clone());
            }
        }

        let prior_orders = self
            .units
            .values()
            .filter(|unit| !unit.orders.is_empty())
            .map(|unit| (unit.number, unit.orders.clone()))
            .collect();

        let mut snapshot = WorldSnapshot {
            game: self.game,
            observer: self.observer,
            turn: next_turn,
            factions: self.factions.clone(),
            attitudes: self.attitudes.clone(),
            regions: self.regions.clone(),
            exits: self.exits.clone(),
            structures,
            pending_ships,
            units: BTreeMap::new(),
            events: Vec::new(),
            battles: Vec::new(),
        };
        snapshot.clear_marks();
        CarriedForward {
            snapshot,
            prior_orders,
        }
    }
}
