//! Data contracts shared by the turn runner crates.
//!
//! Holds the parsed, faction-scoped report of one turn together with the
//! identity types (faction and unit numbers, region and structure UIDs) used
//! to key the persisted world model across turns.

mod report;
mod uid;

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use report::{
    report_json_schema, BattleReport, ExitReport, FactionRef, MarketEntry, Production, Report,
    RegionReport, ReportEvent, Settlement, StanceLists, StructureReport, TemplateUnit, UnitReport,
};
pub use uid::{BattleKey, Coords, RegionUid, StructureUid, UidError};

/// Identifier of a game hosted by the turn runner.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct GameId(pub u64);

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number the engine assigns to a faction. Long-lived; names may change.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct FactionNumber(pub u32);

impl fmt::Display for FactionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unit number, unique within a single turn's merged view.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct UnitNumber(pub u32);

impl fmt::Display for UnitNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declared relationship of one faction toward another.
///
/// Variant order is the order stance lists are applied in; a faction listed
/// under two stances keeps the later one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Ally,
    Friendly,
    Neutral,
    Unfriendly,
    Hostile,
}

impl Stance {
    pub const ALL: [Stance; 5] = [
        Stance::Ally,
        Stance::Friendly,
        Stance::Neutral,
        Stance::Unfriendly,
        Stance::Hostile,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stance::Ally => "ally",
            Stance::Friendly => "friendly",
            Stance::Neutral => "neutral",
            Stance::Unfriendly => "unfriendly",
            Stance::Hostile => "hostile",
        }
    }
}

impl Default for Stance {
    fn default() -> Self {
        Stance::Neutral
    }
}

/// Exit direction on the hex map, plus the vertical links between levels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    North,
    Northeast,
    Southeast,
    South,
    Southwest,
    Northwest,
    In,
    Out,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::Northeast => Direction::Southwest,
            Direction::Southeast => Direction::Northwest,
            Direction::South => Direction::North,
            Direction::Southwest => Direction::Northeast,
            Direction::Northwest => Direction::Southeast,
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    }
}

/// Closed set of report event categories.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Income,
    Production,
    Movement,
    Combat,
    Error,
    General,
}

impl EventCategory {
    /// Economic events describe the observer's own holdings.
    pub fn is_economic(self) -> bool {
        match self {
            EventCategory::Income | EventCategory::Production => true,
            EventCategory::Movement
            | EventCategory::Combat
            | EventCategory::Error
            | EventCategory::General => false,
        }
    }
}

impl Default for EventCategory {
    fn default() -> Self {
        EventCategory::General
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum StructureKind {
    Building,
    Ship,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_directions_pair_up() {
        let all = [
            Direction::North,
            Direction::Northeast,
            Direction::Southeast,
            Direction::South,
            Direction::Southwest,
            Direction::Northwest,
            Direction::In,
            Direction::Out,
        ];
        for direction in all {
            assert_ne!(direction.opposite(), direction);
            assert_eq!(direction.opposite().opposite(), direction);
        }
        assert_eq!(Direction::Northeast.opposite(), Direction::Southwest);
    }

    #[test]
    fn stance_order_matches_application_order() {
        let mut sorted = Stance::ALL;
        sorted.sort();
        assert_eq!(sorted, Stance::ALL);
        assert_eq!(Stance::default(), Stance::Neutral);
    }
}
