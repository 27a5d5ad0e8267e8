use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use report_schema::{FactionNumber, GameId};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::orders::FactionOrders;
use crate::roster::Registration;
use crate::sandbox::Sandbox;

/// Executor settings, deserialized from the `executor` section of the
/// pipeline config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub engine_timeout_ms: u64,
    pub sandbox_root: Option<PathBuf>,
    pub sandbox_attempts: u32,
    pub stderr_limit_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            engine_timeout_ms: 300_000,
            sandbox_root: None,
            sandbox_attempts: 3,
            stderr_limit_bytes: 64 * 1024,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms)
    }

    pub fn sandbox_root(&self) -> PathBuf {
        self.sandbox_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("turn-runner"))
    }
}

/// Everything the engine needs for one run.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub game: GameId,
    pub engine_binary: PathBuf,
    pub world: Vec<u8>,
    /// Roster written by the previous run (`players.out`), verbatim.
    pub roster: String,
    pub registrations: Vec<Registration>,
    pub orders: Vec<FactionOrders>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub index: u32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub elapsed: Duration,
    pub stdout: String,
    pub stderr: String,
}

/// Raw outputs harvested after a successful run.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub world: Vec<u8>,
    pub roster: String,
    pub reports: BTreeMap<FactionNumber, Vec<u8>>,
    pub articles: Vec<Article>,
    pub run: RunReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    ExitCode(i32),
    Signal,
    TimedOut(Duration),
    Spawn(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitCode(code) => write!(f, "exit code {code}"),
            FailureReason::Signal => write!(f, "terminated by signal"),
            FailureReason::TimedOut(limit) => write!(f, "timed out after {}ms", limit.as_millis()),
            FailureReason::Spawn(err) => write!(f, "could not start engine: {err}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("sandbox resource failure while {context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("engine failed ({reason}); stderr: {stderr}")]
    EngineFailure { reason: FailureReason, stderr: String },
    #[error("engine finished without producing {file}")]
    MissingOutput { file: String },
    #[error("engine run cancelled")]
    Cancelled,
    #[error("an engine run is already in flight for game {0}")]
    Busy(GameId),
}

impl ExecutorError {
    /// Engine failures can be retried with the same inputs.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExecutorError::EngineFailure { .. } | ExecutorError::Cancelled | ExecutorError::Busy(_)
        )
    }
}

/// Cancellation side of a [`cancel_pair`].
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Observed by a running engine; fires once the paired handle cancels.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                // Handle dropped without cancelling.
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

/// Runs the external engine, at most once per game at a time.
#[derive(Debug)]
pub struct TurnExecutor {
    config: ExecutorConfig,
    in_flight: Mutex<HashSet<GameId>>,
}

struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<GameId>>,
    game: GameId,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.game);
    }
}

impl TurnExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn begin_flight(&self, game: GameId) -> Result<FlightGuard<'_>, ExecutorError> {
        if !self.in_flight.lock().insert(game) {
            return Err(ExecutorError::Busy(game));
        }
        Ok(FlightGuard {
            in_flight: &self.in_flight,
            game,
        })
    }

    /// Stage, run and harvest one engine invocation.
    ///
    /// The sandbox is removed before this returns on every path; dropping the
    /// returned future kills the engine and removes the sandbox as well.
    pub async fn execute(
        &self,
        request: &EngineRequest,
        cancel: Option<&CancelSignal>,
    ) -> Result<EngineOutput, ExecutorError> {
        let _flight = self.begin_flight(request.game)?;
        let sandbox = Sandbox::create(&self.config.sandbox_root(), self.config.sandbox_attempts)?;

        info!(
            target: "turn_runner::executor",
            game = %request.game,
            sandbox = %sandbox.path().display(),
            factions = request.orders.len(),
            "engine.staging"
        );
        sandbox.stage_inputs(request).await?;

        let run = match sandbox
            .run(self.config.timeout(), self.config.stderr_limit_bytes, cancel)
            .await
        {
            Ok(run) => run,
            Err(err) => {
                warn!(
                    target: "turn_runner::executor",
                    game = %request.game,
                    error = %err,
                    "engine.failed"
                );
                return Err(err);
            }
        };
        info!(
            target: "turn_runner::executor",
            game = %request.game,
            elapsed_ms = run.elapsed.as_millis() as u64,
            "engine.completed"
        );

        let output = sandbox.harvest(run).await?;
        if let Err(err) = sandbox.close() {
            error!(
                target: "turn_runner::executor",
                game = %request.game,
                error = %err,
                "sandbox.cleanup_failed"
            );
        }
        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;
    use std::time::Instant;

    use report_schema::UnitNumber;

    use super::*;

    fn write_engine(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-engine.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path
    }

    fn request(engine: PathBuf) -> EngineRequest {
        EngineRequest {
            game: GameId(1),
            engine_binary: engine,
            world: b"world-v1".to_vec(),
            roster: "Faction: 1\nName: Alpha (1)\n".to_string(),
            registrations: vec![Registration {
                id: crate::RegistrationId(5),
                name: "Newcomers".into(),
                password: None,
            }],
            orders: vec![FactionOrders::new(FactionNumber(1), Some("pw".into()))
                .with_unit(UnitNumber(17), "work")],
        }
    }

    fn executor(root: &Path, timeout_ms: u64) -> TurnExecutor {
        TurnExecutor::new(ExecutorConfig {
            engine_timeout_ms: timeout_ms,
            sandbox_root: Some(root.to_path_buf()),
            ..ExecutorConfig::default()
        })
    }

    fn sandbox_count(root: &Path) -> usize {
        std::fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn successful_run_is_harvested_and_cleaned_up() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("sandboxes");
        let engine = write_engine(
            scratch.path(),
            r#"[ "$1" = "run" ] || exit 9
cat game.in > game.out
printf '%s' '-next' >> game.out
cat players.in > players.out
cp orders.1 report.1
echo "extra extra" > times.2
echo "news" > times.1
echo "noise" > report.notes"#,
        );

        let output = executor(&root, 10_000)
            .execute(&request(engine), None)
            .await
            .unwrap();

        assert_eq!(output.world, b"world-v1-next".to_vec());
        assert!(output.roster.contains("Faction: new\nName: Newcomers\nPassword: none\n"));
        let report = String::from_utf8(output.reports[&FactionNumber(1)].clone()).unwrap();
        assert_eq!(report, "#atlantis 1 \"pw\"\nunit 17\nwork\n#end\n");
        assert_eq!(output.reports.len(), 1);
        let indices: Vec<u32> = output.articles.iter().map(|a| a.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(sandbox_count(&root), 0);
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_engine_failure_with_stderr() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("sandboxes");
        let engine = write_engine(scratch.path(), "echo 'bad orders file' >&2\nexit 3");

        let err = executor(&root, 10_000)
            .execute(&request(engine), None)
            .await
            .unwrap_err();

        match err {
            ExecutorError::EngineFailure { reason, stderr } => {
                assert_eq!(reason, FailureReason::ExitCode(3));
                assert!(stderr.contains("bad orders file"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sandbox_count(&root), 0);
    }

    #[tokio::test]
    async fn hung_engine_is_killed_at_the_timeout() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("sandboxes");
        let engine = write_engine(scratch.path(), "echo 'thinking' >&2\nexec sleep 30");

        let started = Instant::now();
        let err = executor(&root, 300)
            .execute(&request(engine), None)
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(err.is_recoverable());
        match err {
            ExecutorError::EngineFailure { reason, .. } => {
                assert_eq!(reason, FailureReason::TimedOut(Duration::from_millis(300)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sandbox_count(&root), 0);
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(") ")
                .next()
                .map_or(false, |fields| !fields.starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_processes_the_engine_forked() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("sandboxes");
        let pid_file = scratch.path().join("worker.pid");
        let engine = write_engine(
            scratch.path(),
            &format!("sleep 30 &\necho $! > {}\nwait", pid_file.display()),
        );

        let err = executor(&root, 300)
            .execute(&request(engine), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::EngineFailure {
                reason: FailureReason::TimedOut(_),
                ..
            }
        ));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim();
        let deadline = Instant::now() + Duration::from_secs(5);
        while is_running(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!is_running(pid), "forked worker {pid} outlived the engine");
    }

    #[tokio::test]
    async fn cancellation_kills_the_engine_and_cleans_up() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("sandboxes");
        let engine = write_engine(scratch.path(), "exec sleep 30");
        let (handle, signal) = cancel_pair();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.cancel();
        });
        let err = executor(&root, 60_000)
            .execute(&request(engine), Some(&signal))
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, ExecutorError::Cancelled));
        assert_eq!(sandbox_count(&root), 0);
    }

    #[tokio::test]
    async fn missing_world_output_is_reported() {
        let scratch = tempfile::tempdir().unwrap();
        let root = scratch.path().join("sandboxes");
        let engine = write_engine(scratch.path(), "cat players.in > players.out");

        let err = executor(&root, 10_000)
            .execute(&request(engine), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::MissingOutput { ref file } if file == "game.out"));
        assert_eq!(sandbox_count(&root), 0);
    }

    #[tokio::test]
    async fn second_run_for_the_same_game_is_rejected() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = executor(&scratch.path().join("sandboxes"), 10_000);

        let _guard = executor.begin_flight(GameId(1)).unwrap();
        let engine = write_engine(scratch.path(), "exit 0");
        let err = executor.execute(&request(engine), None).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Busy(GameId(1))));
    }
}
