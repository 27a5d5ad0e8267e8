use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use report_schema::{FactionNumber, UnitNumber};

/// Raw order text for a single unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOrders {
    pub unit: UnitNumber,
    pub orders: String,
}

/// Orders submitted by one faction for the upcoming run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactionOrders {
    pub faction: FactionNumber,
    pub password: Option<String>,
    pub units: Vec<UnitOrders>,
}

impl FactionOrders {
    pub fn new(faction: FactionNumber, password: Option<String>) -> Self {
        Self {
            faction,
            password,
            units: Vec::new(),
        }
    }

    pub fn with_unit(mut self, unit: UnitNumber, orders: impl Into<String>) -> Self {
        self.units.push(UnitOrders {
            unit,
            orders: orders.into(),
        });
        self
    }

    pub fn file_name(&self) -> String {
        format!("orders.{}", self.faction)
    }

    /// Render the `orders.<n>` file the engine reads.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "#atlantis {} \"{}\"",
            self.faction,
            self.password.as_deref().unwrap_or_default()
        );
        for unit in &self.units {
            let _ = writeln!(out, "unit {}", unit.unit);
            for line in unit.orders.lines() {
                let line = line.trim_end();
                if !line.is_empty() {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        out.push_str("#end\n");
        out
    }
}

/// Error that can occur when collecting a turn's order submissions.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("faction {0} is not active in this game")]
    UnknownFaction(FactionNumber),
    #[error("orders for faction {0} already submitted")]
    DuplicateSubmission(FactionNumber),
}

/// Collects submissions for the active factions of one run.
///
/// Factions that submitted nothing are reported back through
/// [`OrderBatch::missing`] so the caller can fill them in.
#[derive(Debug, Clone)]
pub struct OrderBatch {
    active: BTreeSet<FactionNumber>,
    submissions: BTreeMap<FactionNumber, FactionOrders>,
}

impl OrderBatch {
    pub fn new(active: impl IntoIterator<Item = FactionNumber>) -> Self {
        Self {
            active: active.into_iter().collect(),
            submissions: BTreeMap::new(),
        }
    }

    pub fn submit(&mut self, orders: FactionOrders) -> Result<(), SubmitError> {
        if !self.active.contains(&orders.faction) {
            return Err(SubmitError::UnknownFaction(orders.faction));
        }
        if self.submissions.contains_key(&orders.faction) {
            return Err(SubmitError::DuplicateSubmission(orders.faction));
        }
        self.submissions.insert(orders.faction, orders);
        Ok(())
    }

    pub fn missing(&self) -> Vec<FactionNumber> {
        self.active
            .iter()
            .filter(|faction| !self.submissions.contains_key(faction))
            .copied()
            .collect()
    }

    /// Fill every missing faction with orders produced by `builder`.
    pub fn fill_missing<F>(&mut self, mut builder: F)
    where
        F: FnMut(FactionNumber) -> FactionOrders,
    {
        for faction in self.missing() {
            self.submissions.insert(faction, builder(faction));
        }
    }

    pub fn into_orders(self) -> Vec<FactionOrders> {
        self.submissions.into_values().collect()
    }
}
