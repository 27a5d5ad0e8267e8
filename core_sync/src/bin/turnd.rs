use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use core_sync::{
    load_pipeline_config_from_env, JsonReportParser, MemoryStore, ObserverReports, ReportParser,
    SyncContext, SyncEngine, SyncOutcome, TurnKey, WorldSnapshot, WorldStore,
};
use engine_runtime::{
    EngineRequest, FactionOrders, Registration, RegistrationId, TurnExecutor, ARTICLE_PREFIX,
    PLAYERS_OUT, REPORT_PREFIX, WORLD_OUT,
};
use report_schema::{FactionNumber, GameId, UnitNumber};
use serde::Deserialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Turn runner for hosted play-by-turn games", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine once against a world file and write its outputs
    Execute {
        /// Engine executable
        #[arg(long)]
        engine: PathBuf,
        /// World blob from the previous run
        #[arg(long)]
        world: PathBuf,
        /// Roster written by the previous run
        #[arg(long)]
        roster: PathBuf,
        /// Orders JSON: {"<faction>": {"password": "...", "units": {"<unit>": "orders"}}}
        #[arg(long)]
        orders: Option<PathBuf>,
        /// Register a new faction under this name (repeatable)
        #[arg(long = "register")]
        registrations: Vec<String>,
        /// Directory receiving game.out, players.out, reports and articles
        #[arg(long)]
        out: PathBuf,
        /// Override the configured engine timeout (milliseconds)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Synchronize one parsed report into an observer snapshot
    Sync {
        #[arg(long, default_value_t = 1)]
        game: u64,
        #[arg(long)]
        observer: u32,
        #[arg(long)]
        turn: u32,
        /// Report JSON for the observer at `turn`
        #[arg(long)]
        report: PathBuf,
        /// Snapshot JSON committed for `turn - 1`
        #[arg(long)]
        previous: Option<PathBuf>,
        /// Where to write the committed snapshot JSON
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the JSON schema report parsers must produce
    Schema,
}

#[derive(Debug, Deserialize)]
struct OrdersFile {
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    units: BTreeMap<u32, String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.command {
        Command::Execute {
            engine,
            world,
            roster,
            orders,
            registrations,
            out,
            timeout_ms,
        } => execute(ExecuteArgs {
            engine,
            world,
            roster,
            orders,
            registrations,
            out,
            timeout_ms,
        }),
        Command::Sync {
            game,
            observer,
            turn,
            report,
            previous,
            out,
        } => sync(
            SyncContext::new(GameId(game), FactionNumber(observer), turn),
            &report,
            previous.as_deref(),
            &out,
        ),
        Command::Schema => {
            let schema = report_schema::report_json_schema();
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
    }
}

struct ExecuteArgs {
    engine: PathBuf,
    world: PathBuf,
    roster: PathBuf,
    orders: Option<PathBuf>,
    registrations: Vec<String>,
    out: PathBuf,
    timeout_ms: Option<u64>,
}

fn execute(args: ExecuteArgs) -> Result<()> {
    let (config, _) = load_pipeline_config_from_env();
    let mut executor_config = config.executor.clone();
    if let Some(timeout_ms) = args.timeout_ms {
        executor_config.engine_timeout_ms = timeout_ms;
    }

    let world = fs::read(&args.world)
        .with_context(|| format!("Failed to read world at {}", args.world.display()))?;
    let roster = fs::read_to_string(&args.roster)
        .with_context(|| format!("Failed to read roster at {}", args.roster.display()))?;
    let orders = match &args.orders {
        Some(path) => read_orders(path)?,
        None => Vec::new(),
    };
    let registrations = args
        .registrations
        .into_iter()
        .enumerate()
        .map(|(idx, name)| Registration {
            id: RegistrationId(idx as u64 + 1),
            name,
            password: None,
        })
        .collect();

    let request = EngineRequest {
        game: GameId(0),
        engine_binary: args.engine,
        world,
        roster,
        registrations,
        orders,
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let output = runtime
        .block_on(TurnExecutor::new(executor_config).execute(&request, None))
        .context("Engine run failed")?;

    fs::create_dir_all(&args.out)
        .with_context(|| format!("Failed to create {}", args.out.display()))?;
    write_file(&args.out.join(WORLD_OUT), &output.world)?;
    write_file(&args.out.join(PLAYERS_OUT), output.roster.as_bytes())?;
    for (faction, report) in &output.reports {
        write_file(&args.out.join(format!("{REPORT_PREFIX}{faction}")), report)?;
    }
    for article in &output.articles {
        write_file(
            &args.out.join(format!("{ARTICLE_PREFIX}{}", article.index)),
            article.text.as_bytes(),
        )?;
    }

    info!(
        target: "turn_runner::cli",
        reports = output.reports.len(),
        articles = output.articles.len(),
        elapsed_ms = output.run.elapsed.as_millis() as u64,
        out = %args.out.display(),
        "execute.completed"
    );
    Ok(())
}

fn read_orders(path: &Path) -> Result<Vec<FactionOrders>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read orders at {}", path.display()))?;
    let files: BTreeMap<u32, OrdersFile> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse orders JSON at {}", path.display()))?;
    Ok(files
        .into_iter()
        .map(|(faction, file)| {
            file.units.into_iter().fold(
                FactionOrders::new(FactionNumber(faction), file.password),
                |orders, (unit, text)| orders.with_unit(UnitNumber(unit), text),
            )
        })
        .collect())
}

fn sync(ctx: SyncContext, report: &Path, previous: Option<&Path>, out: &Path) -> Result<()> {
    let (config, _) = load_pipeline_config_from_env();
    let store = MemoryStore::new();

    if let Some(path) = previous {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot at {}", path.display()))?;
        let snapshot: WorldSnapshot = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse snapshot JSON at {}", path.display()))?;
        if snapshot.observer != ctx.observer || snapshot.game != ctx.game {
            bail!(
                "snapshot at {} belongs to faction {} of game {}",
                path.display(),
                snapshot.observer,
                snapshot.game
            );
        }
        store.commit_snapshot(&snapshot)?;
    }

    let bytes =
        fs::read(report).with_context(|| format!("Failed to read report at {}", report.display()))?;
    let parsed = JsonReportParser.parse_for(ctx.observer, &bytes)?;

    let engine = SyncEngine::new(config.sync.clone());
    match engine.sync(&store, ctx, ObserverReports::own(parsed))? {
        SyncOutcome::Committed {
            mode,
            metrics,
            digest,
        } => {
            let snapshot = store
                .load_snapshot(TurnKey::new(ctx.game, ctx.observer, ctx.turn))?
                .context("Committed snapshot is missing from the store")?;
            write_file(out, serde_json::to_string_pretty(&snapshot)?.as_bytes())?;
            let summary = serde_json::json!({
                "mode": mode,
                "digest": format!("{digest:016x}"),
                "metrics": metrics,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        SyncOutcome::NotYetAvailable => bail!("report did not produce a snapshot"),
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}
