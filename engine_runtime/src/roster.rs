//! The engine's player roster (`players.in` / `players.out`).
//!
//! The roster is a flat `Key: Value` text file. Lines before the first
//! `Faction:` line form the header; every `Faction:` line opens a new entry.

use std::collections::BTreeSet;
use std::fmt;
use std::num::ParseIntError;

use report_schema::FactionNumber;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Identifier of a pending faction registration (owned by the caller).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A faction that joins on the next run and has no engine number yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: RegistrationId,
    pub name: String,
    pub password: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("invalid faction number '{value}' on roster line {line}: {source}")]
    InvalidFaction {
        line: usize,
        value: String,
        source: ParseIntError,
    },
    #[error("registration {0} has an empty name")]
    EmptyName(RegistrationId),
    #[error("registration names '{first}' and '{second}' are not prefix-distinct")]
    AmbiguousNames { first: String, second: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    /// `None` for `Faction: new` blocks that have not been numbered yet.
    pub faction: Option<FactionNumber>,
    pub fields: Vec<(String, String)>,
}

impl RosterEntry {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.field("Name")
    }

    pub fn password(&self) -> Option<&str> {
        self.field("Password").filter(|p| *p != "none")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub header: Vec<(String, String)>,
    pub entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn parse(text: &str) -> Result<Self, RosterError> {
        let mut roster = Roster::default();
        for (idx, raw) in text.lines().enumerate() {
            let Some((key, value)) = raw.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key.eq_ignore_ascii_case("Faction") {
                let faction = if value.eq_ignore_ascii_case("new") {
                    None
                } else {
                    let number =
                        value
                            .parse::<u32>()
                            .map_err(|source| RosterError::InvalidFaction {
                                line: idx + 1,
                                value: value.to_string(),
                                source,
                            })?;
                    Some(FactionNumber(number))
                };
                roster.entries.push(RosterEntry {
                    faction,
                    fields: Vec::new(),
                });
                continue;
            }
            let pair = (key.to_string(), value.to_string());
            match roster.entries.last_mut() {
                Some(entry) => entry.fields.push(pair),
                None => roster.header.push(pair),
            }
        }
        Ok(roster)
    }

    pub fn factions(&self) -> impl Iterator<Item = FactionNumber> + '_ {
        self.entries.iter().filter_map(|entry| entry.faction)
    }

    pub fn entry(&self, faction: FactionNumber) -> Option<&RosterEntry> {
        self.entries
            .iter()
            .find(|entry| entry.faction == Some(faction))
    }
}

/// Append registration blocks to an existing roster, producing `players.in`.
pub fn render_players_in(existing: &str, registrations: &[Registration]) -> String {
    let mut out = String::with_capacity(existing.len() + registrations.len() * 80);
    out.push_str(existing);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    for registration in registrations {
        let password = registration
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or("none");
        out.push_str("Faction: new\n");
        out.push_str(&format!("Name: {}\n", registration.name));
        out.push_str(&format!("Password: {}\n", password));
        out.push_str("SendTimes: 1\n");
        out.push_str("Template: long\n");
    }
    out
}

/// Reject registrations whose names could not be told apart by prefix match.
pub fn validate_registrations(pending: &[Registration]) -> Result<(), RosterError> {
    for (idx, registration) in pending.iter().enumerate() {
        if registration.name.trim().is_empty() {
            return Err(RosterError::EmptyName(registration.id));
        }
        for other in &pending[idx + 1..] {
            if names_collide(&registration.name, &other.name) {
                return Err(RosterError::AmbiguousNames {
                    first: registration.name.clone(),
                    second: other.name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn names_collide(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactionMatches {
    pub resolved: Vec<(RegistrationId, FactionNumber)>,
    pub unresolved: Vec<RegistrationId>,
}

/// Resolve engine-assigned numbers for pending registrations.
///
/// The roster writer prints newly created factions as `Name: <name> (<n>)`,
/// so a registration matches a roster entry that was not numbered before the
/// run and whose name starts with the registered name. Registrations with no
/// candidate, several candidates, or a prefix-colliding sibling stay
/// unresolved.
pub fn match_new_factions(
    roster: &Roster,
    known: &BTreeSet<FactionNumber>,
    pending: &[Registration],
) -> FactionMatches {
    let fresh: Vec<(FactionNumber, &str)> = roster
        .entries
        .iter()
        .filter_map(|entry| match (entry.faction, entry.name()) {
            (Some(number), Some(name)) if !known.contains(&number) => Some((number, name)),
            _ => None,
        })
        .collect();

    let mut matches = FactionMatches::default();
    let mut claimed = BTreeSet::new();
    for registration in pending {
        let colliding = pending
            .iter()
            .any(|other| other.id != registration.id && names_collide(&other.name, &registration.name));
        if colliding {
            warn!(
                target: "turn_runner::executor",
                registration = %registration.id,
                name = %registration.name,
                "registration.unresolved=ambiguous_name"
            );
            matches.unresolved.push(registration.id);
            continue;
        }

        let candidates: Vec<FactionNumber> = fresh
            .iter()
            .filter(|(_, name)| name.starts_with(registration.name.as_str()))
            .map(|(number, _)| *number)
            .collect();

        match candidates.as_slice() {
            [number] if claimed.insert(*number) => {
                matches.resolved.push((registration.id, *number));
            }
            _ => {
                warn!(
                    target: "turn_runner::executor",
                    registration = %registration.id,
                    name = %registration.name,
                    candidates = candidates.len(),
                    "registration.unresolved"
                );
                matches.unresolved.push(registration.id);
            }
        }
    }
    matches
}
