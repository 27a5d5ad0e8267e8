use schemars::schema::RootSchema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Coords, Direction, EventCategory, FactionNumber, Stance, StructureKind, UnitNumber};

/// One faction's parsed report for a single turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Report {
    pub faction: FactionRef,
    #[serde(default)]
    pub default_stance: Stance,
    #[serde(default)]
    pub stances: StanceLists,
    #[serde(default)]
    pub events: Vec<ReportEvent>,
    #[serde(default)]
    pub battles: Vec<BattleReport>,
    #[serde(default)]
    pub regions: Vec<RegionReport>,
    #[serde(default)]
    pub order_template: Vec<TemplateUnit>,
}

impl Report {
    pub fn new(faction: FactionRef) -> Self {
        Self {
            faction,
            default_stance: Stance::default(),
            stances: StanceLists::default(),
            events: Vec::new(),
            battles: Vec::new(),
            regions: Vec::new(),
            order_template: Vec::new(),
        }
    }

    pub fn region(&self, coords: Coords) -> Option<&RegionReport> {
        self.regions.iter().find(|region| region.coords == coords)
    }

    /// Every faction the report mentions: owner, unit owners, battle sides
    /// and stance targets, in first-seen order (duplicates included).
    pub fn mentioned_factions(&self) -> impl Iterator<Item = &FactionRef> + '_ {
        let units = self
            .regions
            .iter()
            .flat_map(|region| region.all_units())
            .filter_map(|unit| unit.faction.as_ref());
        let battles = self
            .battles
            .iter()
            .flat_map(|battle| [battle.attacker_faction.as_ref(), battle.defender_faction.as_ref()])
            .flatten();
        std::iter::once(&self.faction)
            .chain(units)
            .chain(battles)
            .chain(self.stances.iter().flat_map(|(_, factions)| factions.iter()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FactionRef {
    pub number: FactionNumber,
    #[serde(default)]
    pub name: String,
}

impl FactionRef {
    pub fn new(number: u32, name: impl Into<String>) -> Self {
        Self {
            number: FactionNumber(number),
            name: name.into(),
        }
    }
}

/// Declared attitudes, one list per stance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StanceLists {
    pub ally: Vec<FactionRef>,
    pub friendly: Vec<FactionRef>,
    pub neutral: Vec<FactionRef>,
    pub unfriendly: Vec<FactionRef>,
    pub hostile: Vec<FactionRef>,
}

impl StanceLists {
    pub fn list(&self, stance: Stance) -> &[FactionRef] {
        match stance {
            Stance::Ally => &self.ally,
            Stance::Friendly => &self.friendly,
            Stance::Neutral => &self.neutral,
            Stance::Unfriendly => &self.unfriendly,
            Stance::Hostile => &self.hostile,
        }
    }

    /// Stances in application order paired with their lists.
    pub fn iter(&self) -> impl Iterator<Item = (Stance, &[FactionRef])> + '_ {
        Stance::ALL
            .into_iter()
            .map(move |stance| (stance, self.list(stance)))
    }

    pub fn declares(&self, stance: Stance, faction: FactionNumber) -> bool {
        self.list(stance).iter().any(|f| f.number == faction)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReportEvent {
    #[serde(default)]
    pub category: EventCategory,
    pub message: String,
    #[serde(default)]
    pub region: Option<Coords>,
    #[serde(default)]
    pub unit: Option<UnitNumber>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BattleReport {
    pub coords: Coords,
    pub attacker: UnitNumber,
    pub defender: UnitNumber,
    #[serde(default)]
    pub attacker_faction: Option<FactionRef>,
    #[serde(default)]
    pub defender_faction: Option<FactionRef>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Settlement {
    pub name: String,
    #[serde(default)]
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MarketEntry {
    pub item: String,
    pub amount: u32,
    pub price: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Production {
    pub item: String,
    pub amount: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExitReport {
    pub direction: Direction,
    pub coords: Coords,
    #[serde(default)]
    pub terrain: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UnitReport {
    pub number: UnitNumber,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub faction: Option<FactionRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StructureReport {
    pub number: u32,
    #[serde(default)]
    pub name: String,
    pub kind: StructureKind,
    #[serde(default)]
    pub structure_type: String,
    #[serde(default)]
    pub units: Vec<UnitReport>,
}

/// Full detail of one region as seen by the reporting faction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RegionReport {
    pub coords: Coords,
    pub terrain: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub settlement: Option<Settlement>,
    #[serde(default)]
    pub population: u32,
    #[serde(default)]
    pub race: Option<String>,
    #[serde(default)]
    pub wealth: u32,
    #[serde(default)]
    pub tax: u32,
    #[serde(default)]
    pub wages: f32,
    #[serde(default)]
    pub wanted: Vec<MarketEntry>,
    #[serde(default)]
    pub for_sale: Vec<MarketEntry>,
    #[serde(default)]
    pub products: Vec<Production>,
    #[serde(default)]
    pub exits: Vec<ExitReport>,
    #[serde(default)]
    pub structures: Vec<StructureReport>,
    #[serde(default)]
    pub units: Vec<UnitReport>,
}

impl RegionReport {
    pub fn new(coords: Coords, terrain: impl Into<String>) -> Self {
        Self {
            coords,
            terrain: terrain.into(),
            name: String::new(),
            settlement: None,
            population: 0,
            race: None,
            wealth: 0,
            tax: 0,
            wages: 0.0,
            wanted: Vec::new(),
            for_sale: Vec::new(),
            products: Vec::new(),
            exits: Vec::new(),
            structures: Vec::new(),
            units: Vec::new(),
        }
    }

    /// Units in the region, including those inside structures.
    pub fn all_units(&self) -> impl Iterator<Item = &UnitReport> + '_ {
        self.units
            .iter()
            .chain(self.structures.iter().flat_map(|s| s.units.iter()))
    }

    pub fn has_units_of(&self, faction: FactionNumber) -> bool {
        self.all_units()
            .any(|unit| unit.faction.as_ref().map(|f| f.number) == Some(faction))
    }
}

/// One unit block of the order template at the end of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateUnit {
    pub number: UnitNumber,
    #[serde(default)]
    pub orders: String,
}

/// JSON schema a report parser's output must satisfy.
pub fn report_json_schema() -> RootSchema {
    schemars::schema_for!(Report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_report_parses_with_defaults() {
        let report: Report = serde_json::from_str(
            r#"{"faction":{"number":3,"name":"Reds"},"regions":[{"coords":{"x":1,"y":2},"terrain":"plain"}]}"#,
        )
        .unwrap();
        assert_eq!(report.faction.number, FactionNumber(3));
        assert_eq!(report.default_stance, Stance::Neutral);
        assert_eq!(report.regions[0].coords, Coords::new(1, 2, 0));
        assert!(report.events.is_empty());
    }

    #[test]
    fn mentioned_factions_cover_units_battles_and_stances() {
        let mut report = Report::new(FactionRef::new(1, "Own"));
        let mut region = RegionReport::new(Coords::new(0, 0, 0), "forest");
        region.units.push(UnitReport {
            number: UnitNumber(10),
            name: "Scouts".into(),
            faction: Some(FactionRef::new(2, "Neighbour")),
        });
        report.regions.push(region);
        report.stances.hostile.push(FactionRef::new(5, "Raiders"));
        report.battles.push(BattleReport {
            coords: Coords::new(0, 0, 0),
            attacker: UnitNumber(40),
            defender: UnitNumber(10),
            attacker_faction: Some(FactionRef::new(4, "Horde")),
            defender_faction: None,
            summary: String::new(),
        });

        let numbers: Vec<u32> = report.mentioned_factions().map(|f| f.number.0).collect();
        assert_eq!(numbers, vec![1, 2, 4, 5]);
    }

    #[test]
    fn schema_names_the_report_root() {
        let schema = report_json_schema();
        let title = schema.schema.metadata.as_ref().and_then(|m| m.title.clone());
        assert_eq!(title.as_deref(), Some("Report"));
    }
}
