use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::UnitNumber;

/// Map coordinates of a region. `z` is the map level (surface, underworld, ...).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct Coords {
    pub x: u16,
    pub y: u16,
    #[serde(default)]
    pub z: u8,
}

impl Coords {
    pub const fn new(x: u16, y: u16, z: u8) -> Self {
        Self { x, y, z }
    }

    pub fn uid(self) -> RegionUid {
        RegionUid::from_coords(self)
    }
}

impl fmt::Display for Coords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Stable identity of a region, packed from its coordinates.
///
/// Layout: `z << 32 | y << 16 | x`. The packing is reversible, so two regions
/// share a UID iff their coordinates match.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct RegionUid(pub u64);

impl RegionUid {
    pub const fn from_coords(coords: Coords) -> Self {
        Self(((coords.z as u64) << 32) | ((coords.y as u64) << 16) | coords.x as u64)
    }

    pub const fn coords(self) -> Coords {
        Coords {
            x: (self.0 & 0xffff) as u16,
            y: ((self.0 >> 16) & 0xffff) as u16,
            z: ((self.0 >> 32) & 0xff) as u8,
        }
    }
}

impl fmt::Display for RegionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.coords())
    }
}

const SHIP_TAG: u64 = 1 << 63;
const BUILDING_NUMBER_BITS: u32 = 20;
const BUILDING_NUMBER_MASK: u64 = (1 << BUILDING_NUMBER_BITS) - 1;

/// Stable identity of a structure.
///
/// Buildings are bound to their region: `region_uid << 20 | number`.
/// Ships carry the top bit and only their number, so relocating a ship never
/// changes its UID.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct StructureUid(pub u64);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UidError {
    #[error("building number {number} in region {region} exceeds the {bits}-bit uid range")]
    BuildingNumberOutOfRange {
        region: RegionUid,
        number: u32,
        bits: u32,
    },
}

impl StructureUid {
    pub fn building(region: RegionUid, number: u32) -> Result<Self, UidError> {
        if u64::from(number) > BUILDING_NUMBER_MASK {
            return Err(UidError::BuildingNumberOutOfRange {
                region,
                number,
                bits: BUILDING_NUMBER_BITS,
            });
        }
        Ok(Self((region.0 << BUILDING_NUMBER_BITS) | u64::from(number)))
    }

    pub const fn ship(number: u32) -> Self {
        Self(SHIP_TAG | number as u64)
    }

    pub const fn is_ship(self) -> bool {
        self.0 & SHIP_TAG != 0
    }

    pub const fn number(self) -> u32 {
        if self.is_ship() {
            (self.0 & !SHIP_TAG) as u32
        } else {
            (self.0 & BUILDING_NUMBER_MASK) as u32
        }
    }

    /// Region a building is bound to. Ships have none.
    pub const fn home_region(self) -> Option<RegionUid> {
        if self.is_ship() {
            None
        } else {
            Some(RegionUid(self.0 >> BUILDING_NUMBER_BITS))
        }
    }
}

impl fmt::Display for StructureUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.home_region() {
            Some(region) => write!(f, "building {} in {}", self.number(), region),
            None => write!(f, "ship {}", self.number()),
        }
    }
}

/// Natural key used to deduplicate battles within one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BattleKey {
    pub region: RegionUid,
    pub attacker: UnitNumber,
    pub defender: UnitNumber,
}
