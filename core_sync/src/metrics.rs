use serde::Serialize;

/// Counters collected during one sync pass.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncMetrics {
    pub factions_created: u32,
    pub factions_renamed: u32,
    pub attitudes_added: u32,
    pub attitudes_removed: u32,
    pub regions_created: u32,
    pub regions_updated: u32,
    pub placeholders_created: u32,
    pub structures_created: u32,
    pub structures_removed: u32,
    pub ships_pending: u32,
    pub ships_reattached: u32,
    pub ships_dropped: u32,
    pub units_created: u32,
    pub units_removed: u32,
    pub events_appended: u32,
    pub economic_events: u32,
    pub events_skipped: bool,
    pub battles_recorded: u32,
    pub battles_duplicate: u32,
    pub exits_written: u32,
    pub exits_reciprocal: u32,
}

impl SyncMetrics {
    pub fn entities_created(&self) -> u32 {
        self.factions_created
            + self.regions_created
            + self.placeholders_created
            + self.structures_created
            + self.units_created
            + self.battles_recorded
            + self.events_appended
    }
}
