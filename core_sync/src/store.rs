//! Persistence contract for committed snapshots, game records and raw
//! engine outputs, plus the in-memory implementation.

use std::collections::BTreeMap;

use engine_runtime::{Article, Registration};
use parking_lot::RwLock;
use report_schema::{FactionNumber, GameId, RegionUid, UnitNumber};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::snapshot::{FactionRecord, RegionRecord, UnitRecord, WorldSnapshot};

/// Address of one observer's snapshot for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TurnKey {
    pub game: GameId,
    pub observer: FactionNumber,
    pub turn: u32,
}

impl TurnKey {
    pub fn new(game: GameId, observer: FactionNumber, turn: u32) -> Self {
        Self {
            game,
            observer,
            turn,
        }
    }

    pub fn of(snapshot: &WorldSnapshot) -> Self {
        Self::new(snapshot.game, snapshot.observer, snapshot.turn)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactionSlot {
    pub number: FactionNumber,
    pub password: Option<String>,
}

/// Engine-side state of a game between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameRecord {
    pub id: GameId,
    /// Last turn the engine completed; reports of the next run belong to `turn + 1`.
    pub turn: u32,
    pub world: Vec<u8>,
    pub roster: String,
    pub factions: Vec<FactionSlot>,
    /// Registrations still waiting for an engine-assigned number.
    pub pending: Vec<Registration>,
}

impl GameRecord {
    pub fn new(id: GameId, world: Vec<u8>, roster: impl Into<String>) -> Self {
        Self {
            id,
            turn: 0,
            world,
            roster: roster.into(),
            factions: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn slot(&self, number: FactionNumber) -> Option<&FactionSlot> {
        self.factions.iter().find(|slot| slot.number == number)
    }

    pub fn active_factions(&self) -> impl Iterator<Item = FactionNumber> + '_ {
        self.factions.iter().map(|slot| slot.number)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to encode or decode snapshot: {0}")]
    Codec(#[from] bincode::Error),
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Keyed storage used by the sync engine and the pipeline.
///
/// `commit_snapshot` must be atomic: readers see either the previous
/// snapshot for a key or the new one, never a mix. Snapshots are handed out
/// as deep copies.
pub trait WorldStore: Send + Sync {
    fn load_snapshot(&self, key: TurnKey) -> Result<Option<WorldSnapshot>, StoreError>;

    fn latest_turn(
        &self,
        game: GameId,
        observer: FactionNumber,
    ) -> Result<Option<u32>, StoreError>;

    fn commit_snapshot(&self, snapshot: &WorldSnapshot) -> Result<(), StoreError>;

    fn lookup_region(
        &self,
        key: TurnKey,
        region: RegionUid,
    ) -> Result<Option<RegionRecord>, StoreError> {
        Ok(self
            .load_snapshot(key)?
            .and_then(|mut snapshot| snapshot.regions.remove(&region)))
    }

    fn lookup_faction(
        &self,
        key: TurnKey,
        faction: FactionNumber,
    ) -> Result<Option<FactionRecord>, StoreError> {
        Ok(self
            .load_snapshot(key)?
            .and_then(|mut snapshot| snapshot.factions.remove(&faction)))
    }

    fn lookup_unit(
        &self,
        key: TurnKey,
        unit: UnitNumber,
    ) -> Result<Option<UnitRecord>, StoreError> {
        Ok(self
            .load_snapshot(key)?
            .and_then(|mut snapshot| snapshot.units.remove(&unit)))
    }

    fn load_game(&self, game: GameId) -> Result<Option<GameRecord>, StoreError>;

    fn save_game(&self, record: &GameRecord) -> Result<(), StoreError>;

    fn save_reports(
        &self,
        game: GameId,
        turn: u32,
        reports: &BTreeMap<FactionNumber, Vec<u8>>,
    ) -> Result<(), StoreError>;

    fn load_report(
        &self,
        game: GameId,
        turn: u32,
        faction: FactionNumber,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    fn save_articles(&self, game: GameId, turn: u32, articles: &[Article])
        -> Result<(), StoreError>;

    fn articles(&self, game: GameId, turn: u32) -> Result<Vec<Article>, StoreError>;

    /// Remove the game record and everything scoped to it.
    fn delete_game(&self, game: GameId) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    games: BTreeMap<GameId, GameRecord>,
    snapshots: BTreeMap<TurnKey, Vec<u8>>,
    reports: BTreeMap<(GameId, u32, FactionNumber), Vec<u8>>,
    articles: BTreeMap<(GameId, u32), Vec<Article>>,
}

/// [`WorldStore`] kept in process memory. Snapshots are stored
/// bincode-encoded so every load decodes a fresh copy.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_count(&self) -> usize {
        self.tables.read().snapshots.len()
    }
}

impl WorldStore for MemoryStore {
    fn load_snapshot(&self, key: TurnKey) -> Result<Option<WorldSnapshot>, StoreError> {
        let tables = self.tables.read();
        match tables.snapshots.get(&key) {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    fn latest_turn(
        &self,
        game: GameId,
        observer: FactionNumber,
    ) -> Result<Option<u32>, StoreError> {
        let tables = self.tables.read();
        let range = TurnKey::new(game, observer, 0)..=TurnKey::new(game, observer, u32::MAX);
        Ok(tables
            .snapshots
            .range(range)
            .next_back()
            .map(|(key, _)| key.turn))
    }

    fn commit_snapshot(&self, snapshot: &WorldSnapshot) -> Result<(), StoreError> {
        let encoded = bincode::serialize(snapshot)?;
        self.tables
            .write()
            .snapshots
            .insert(TurnKey::of(snapshot), encoded);
        Ok(())
    }

    fn load_game(&self, game: GameId) -> Result<Option<GameRecord>, StoreError> {
        Ok(self.tables.read().games.get(&game).cloned())
    }

    fn save_game(&self, record: &GameRecord) -> Result<(), StoreError> {
        self.tables.write().games.insert(record.id, record.clone());
        Ok(())
    }

    fn save_reports(
        &self,
        game: GameId,
        turn: u32,
        reports: &BTreeMap<FactionNumber, Vec<u8>>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        for (faction, bytes) in reports {
            tables.reports.insert((game, turn, *faction), bytes.clone());
        }
        Ok(())
    }

    fn load_report(
        &self,
        game: GameId,
        turn: u32,
        faction: FactionNumber,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tables.read().reports.get(&(game, turn, faction)).cloned())
    }

    fn save_articles(
        &self,
        game: GameId,
        turn: u32,
        articles: &[Article],
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .articles
            .insert((game, turn), articles.to_vec());
        Ok(())
    }

    fn articles(&self, game: GameId, turn: u32) -> Result<Vec<Article>, StoreError> {
        Ok(self
            .tables
            .read()
            .articles
            .get(&(game, turn))
            .cloned()
            .unwrap_or_default())
    }

    fn delete_game(&self, game: GameId) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        tables.games.remove(&game);
        tables.snapshots.retain(|key, _| key.game != game);
        tables.reports.retain(|(owner, _, _), _| *owner != game);
        tables.articles.retain(|(owner, _), _| *owner != game);
        Ok(())
    }
}
