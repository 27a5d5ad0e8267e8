#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use core_sync::{
    load_pipeline_config_from_env, FactionSlot, GameRecord, MemoryStore, PipelineConfig,
    TurnPipeline, WorldStore,
};
use engine_runtime::{Registration, RegistrationId};
use report_schema::{FactionNumber, GameId};
use tempfile::TempDir;

static INIT: Once = Once::new();

pub const GAME: GameId = GameId(42);

/// Fake engine used across the suite.
///
/// The world blob is the last completed turn number. Factions 1 and 2 are
/// mutual allies; faction 1 runs a ship that alternates between two ocean
/// regions. A registration named `Newcomers` becomes faction 3.
pub const ENGINE: &str = r#"[ "$1" = "run" ] || exit 9
turn=$(cat game.in)
next=$((turn + 1))
echo "$next" > game.out
sed -e 's/^Faction: new$/Faction: 3/' -e 's/^Name: Newcomers$/Name: Newcomers (3)/' players.in > players.out
if [ $((next % 2)) -eq 1 ]; then shipx=4; else shipx=5; fi
cat > report.1 <<REPORT
{"faction":{"number":1,"name":"Alpha"},
 "stances":{"ally":[{"number":2,"name":"Beta"}]},
 "events":[{"category":"income","message":"Taxes collected on turn $next","region":{"x":4,"y":4,"z":1}}],
 "regions":[
  {"coords":{"x":4,"y":4,"z":1},"terrain":"plain","name":"Harbour","population":800,
   "exits":[{"direction":"north","coords":{"x":4,"y":3,"z":1},"terrain":"forest","name":"Wood"}],
   "units":[{"number":10,"name":"Guards","faction":{"number":1,"name":"Alpha"}}]},
  {"coords":{"x":$shipx,"y":5,"z":1},"terrain":"ocean","name":"Sound",
   "structures":[{"number":3,"name":"Swift","kind":"ship","structure_type":"Longship",
     "units":[{"number":11,"name":"Crew","faction":{"number":1,"name":"Alpha"}}]}]}],
 "order_template":[{"number":10,"orders":"work"},{"number":11,"orders":"sail"}]}
REPORT
cat > report.2 <<REPORT
{"faction":{"number":2,"name":"Beta"},
 "stances":{"ally":[{"number":1,"name":"Alpha"}]},
 "regions":[
  {"coords":{"x":8,"y":8,"z":1},"terrain":"mountain","name":"Far Isle",
   "units":[{"number":20,"name":"Miners","faction":{"number":2,"name":"Beta"}}]}]}
REPORT
if grep -q '^Faction: 3$' players.out; then
  echo '{"faction":{"number":3,"name":"Newcomers"},"regions":[{"coords":{"x":1,"y":1,"z":1},"terrain":"plain","units":[{"number":30,"faction":{"number":3,"name":"Newcomers"}}]}]}' > report.3
fi
echo "Chronicle of turn $next" > times.1"#;

pub fn ensure_test_config() {
    INIT.call_once(|| {
        let config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join("test_pipeline_config.json");

        debug_assert!(
            config_path.exists(),
            "missing test pipeline config at {}",
            config_path.display()
        );

        std::env::set_var(core_sync::PIPELINE_CONFIG_ENV, &config_path);
    });
}

pub struct Harness {
    pub scratch: TempDir,
    pub store: Arc<MemoryStore>,
    pub pipeline: TurnPipeline,
}

/// Build a pipeline around a fake engine running `body` and a game with
/// factions 1 and 2 at turn 0.
pub fn harness(body: &str) -> Harness {
    ensure_test_config();
    let (config, path) = load_pipeline_config_from_env();
    assert!(path.is_some(), "fixture config was not picked up");

    let scratch = tempfile::tempdir().expect("scratch dir");
    let mut config = PipelineConfig::clone(&config);
    config.executor.sandbox_root = Some(scratch.path().join("sandboxes"));

    let engine = write_engine(scratch.path(), body);
    let store = Arc::new(MemoryStore::new());
    let pipeline = TurnPipeline::new(Arc::new(config), store.clone(), engine);

    let mut record = GameRecord::new(
        GAME,
        b"0".to_vec(),
        "Faction: 1\nName: Alpha (1)\nFaction: 2\nName: Beta (2)\n",
    );
    for number in [1, 2] {
        record.factions.push(FactionSlot {
            number: FactionNumber(number),
            password: Some(format!("pw{number}")),
        });
    }
    store.save_game(&record).expect("seed game");

    Harness {
        scratch,
        store,
        pipeline,
    }
}

pub fn write_engine(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-engine.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write engine");
    path
}

pub fn registration(id: u64, name: &str) -> Registration {
    Registration {
        id: RegistrationId(id),
        name: name.to_string(),
        password: Some("joined".into()),
    }
}
