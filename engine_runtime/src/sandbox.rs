//! Disposable working directory for one engine invocation.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use report_schema::FactionNumber;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::executor::{
    Article, CancelSignal, EngineOutput, EngineRequest, ExecutorError, FailureReason, RunReport,
};
use crate::roster::render_players_in;

pub const ENGINE_FILE: &str = "engine";
pub const WORLD_IN: &str = "game.in";
pub const WORLD_OUT: &str = "game.out";
pub const PLAYERS_IN: &str = "players.in";
pub const PLAYERS_OUT: &str = "players.out";
pub const REPORT_PREFIX: &str = "report.";
pub const ARTICLE_PREFIX: &str = "times.";

const SANDBOX_PREFIX: &str = "turn-";
const SPAWN_RETRIES: u32 = 5;
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);
#[cfg(unix)]
const ETXTBSY: i32 = 26;

/// A uniquely named scratch directory.
///
/// The directory is removed when the sandbox is dropped, whatever the exit
/// path; [`Sandbox::close`] removes it eagerly and reports failures.
#[derive(Debug)]
pub struct Sandbox {
    dir: TempDir,
}

enum RunEnd {
    Exited(io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

impl Sandbox {
    pub fn create(root: &Path, attempts: u32) -> Result<Self, ExecutorError> {
        std::fs::create_dir_all(root).map_err(|source| ExecutorError::Resource {
            context: format!("creating sandbox root {}", root.display()),
            source,
        })?;

        let mut last_error = None;
        for attempt in 1..=attempts.max(1) {
            match tempfile::Builder::new()
                .prefix(SANDBOX_PREFIX)
                .tempdir_in(root)
            {
                Ok(dir) => {
                    debug!(
                        target: "turn_runner::executor",
                        path = %dir.path().display(),
                        attempt,
                        "sandbox.created"
                    );
                    return Ok(Self { dir });
                }
                Err(err) => {
                    warn!(
                        target: "turn_runner::executor",
                        root = %root.display(),
                        attempt,
                        error = %err,
                        "sandbox.create_failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(ExecutorError::Resource {
            context: format!("allocating sandbox under {}", root.display()),
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no sandbox attempts")),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write the engine binary, world blob, roster and order files.
    pub async fn stage_inputs(&self, request: &EngineRequest) -> Result<(), ExecutorError> {
        let engine = self.file(ENGINE_FILE);
        tokio::fs::copy(&request.engine_binary, &engine)
            .await
            .map_err(|source| ExecutorError::Resource {
                context: format!("copying engine {}", request.engine_binary.display()),
                source,
            })?;
        make_executable(&engine).await?;

        self.write(WORLD_IN, &request.world).await?;
        let roster = render_players_in(&request.roster, &request.registrations);
        self.write(PLAYERS_IN, roster.as_bytes()).await?;
        for orders in &request.orders {
            self.write(&orders.file_name(), orders.render().as_bytes())
                .await?;
        }

        debug!(
            target: "turn_runner::executor",
            game = %request.game,
            factions = request.orders.len(),
            registrations = request.registrations.len(),
            "sandbox.staged"
        );
        Ok(())
    }

    async fn write(&self, name: &str, contents: &[u8]) -> Result<(), ExecutorError> {
        tokio::fs::write(self.file(name), contents)
            .await
            .map_err(|source| ExecutorError::Resource {
                context: format!("writing {name}"),
                source,
            })
    }

    /// Run the staged engine with `run` as its only argument.
    ///
    /// The process is killed and reaped before returning when the timeout
    /// elapses or `cancel` fires.
    pub async fn run(
        &self,
        timeout: Duration,
        stderr_limit: usize,
        cancel: Option<&CancelSignal>,
    ) -> Result<RunReport, ExecutorError> {
        let started = Instant::now();
        let mut child = match self.spawn_engine().await {
            Ok(child) => child,
            Err(err) => {
                return Err(ExecutorError::EngineFailure {
                    reason: FailureReason::Spawn(err.to_string()),
                    stderr: String::new(),
                })
            }
        };

        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let mut cancel = cancel.cloned();
        let end = tokio::select! {
            status = child.wait() => RunEnd::Exited(status),
            _ = tokio::time::sleep(timeout) => RunEnd::TimedOut,
            _ = wait_cancelled(cancel.as_mut()) => RunEnd::Cancelled,
        };

        if !matches!(end, RunEnd::Exited(_)) {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                if let Err(err) = kill_group(pid).await {
                    warn!(
                        target: "turn_runner::executor",
                        pid,
                        error = %err,
                        "engine.group_kill_failed"
                    );
                }
            }
            if let Err(err) = child.kill().await {
                warn!(
                    target: "turn_runner::executor",
                    error = %err,
                    "engine.kill_failed"
                );
            }
        }

        let stdout = collect(stdout_task).await;
        let stderr = tail_lossy(&collect(stderr_task).await, stderr_limit);
        let elapsed = started.elapsed();

        match end {
            RunEnd::Exited(Ok(status)) if status.success() => Ok(RunReport {
                elapsed,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr,
            }),
            RunEnd::Exited(Ok(status)) => {
                let reason = match status.code() {
                    Some(code) => FailureReason::ExitCode(code),
                    None => FailureReason::Signal,
                };
                Err(ExecutorError::EngineFailure { reason, stderr })
            }
            RunEnd::Exited(Err(err)) => Err(ExecutorError::EngineFailure {
                reason: FailureReason::Spawn(err.to_string()),
                stderr,
            }),
            RunEnd::TimedOut => Err(ExecutorError::EngineFailure {
                reason: FailureReason::TimedOut(timeout),
                stderr,
            }),
            RunEnd::Cancelled => Err(ExecutorError::Cancelled),
        }
    }

    async fn spawn_engine(&self) -> io::Result<Child> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut command = Command::new(self.file(ENGINE_FILE));
            command
                .arg("run")
                .current_dir(self.path())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            // Own process group, so a timeout reaches whatever the engine forked.
            #[cfg(unix)]
            command.process_group(0);
            let result = command.spawn();
            match result {
                // The freshly copied binary can still be open for writing in a
                // concurrently forked process.
                #[cfg(unix)]
                Err(err) if err.raw_os_error() == Some(ETXTBSY) && attempt < SPAWN_RETRIES => {
                    tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    /// Read back everything the engine produced.
    pub async fn harvest(&self, run: RunReport) -> Result<EngineOutput, ExecutorError> {
        let world = self.read_required(WORLD_OUT).await?;
        let roster = String::from_utf8_lossy(&self.read_required(PLAYERS_OUT).await?).into_owned();

        let mut reports = BTreeMap::new();
        let mut articles = Vec::new();
        let mut entries = tokio::fs::read_dir(self.path())
            .await
            .map_err(|source| ExecutorError::Resource {
                context: "listing sandbox".to_string(),
                source,
            })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| ExecutorError::Resource {
                context: "listing sandbox".to_string(),
                source,
            })?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(suffix) = name.strip_prefix(REPORT_PREFIX) {
                let Ok(number) = suffix.parse::<u32>() else {
                    warn!(target: "turn_runner::executor", file = %name, "harvest.skipped=unnumbered_report");
                    continue;
                };
                let bytes = self.read_required(&name).await?;
                reports.insert(FactionNumber(number), bytes);
            } else if let Some(suffix) = name.strip_prefix(ARTICLE_PREFIX) {
                let Ok(index) = suffix.parse::<u32>() else {
                    warn!(target: "turn_runner::executor", file = %name, "harvest.skipped=unnumbered_article");
                    continue;
                };
                let bytes = self.read_required(&name).await?;
                articles.push(Article {
                    index,
                    text: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }
        }
        articles.sort_by_key(|article| article.index);

        debug!(
            target: "turn_runner::executor",
            reports = reports.len(),
            articles = articles.len(),
            world_bytes = world.len(),
            "sandbox.harvested"
        );

        Ok(EngineOutput {
            world,
            roster,
            reports,
            articles,
            run,
        })
    }

    async fn read_required(&self, name: &str) -> Result<Vec<u8>, ExecutorError> {
        match tokio::fs::read(self.file(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(ExecutorError::MissingOutput {
                file: name.to_string(),
            }),
            Err(source) => Err(ExecutorError::Resource {
                context: format!("reading {name}"),
                source,
            }),
        }
    }

    /// Remove the sandbox now, surfacing removal errors.
    pub fn close(self) -> Result<(), ExecutorError> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|source| ExecutorError::Resource {
            context: format!("removing sandbox {}", path.display()),
            source,
        })
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), ExecutorError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|source| ExecutorError::Resource {
            context: "marking engine executable".to_string(),
            source,
        })
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<(), ExecutorError> {
    Ok(())
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
async fn kill_group(pid: u32) -> io::Result<()> {
    let status = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("kill exited with {status}"),
        ))
    }
}

async fn wait_cancelled(cancel: Option<&mut CancelSignal>) {
    match cancel {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

async fn drain<R>(reader: Option<R>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buffer).await;
    }
    buffer
}

/// Wait briefly for a pipe reader; a grandchild may still hold the pipe open.
async fn collect(mut task: JoinHandle<Vec<u8>>) -> Vec<u8> {
    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut task).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            task.abort();
            Vec::new()
        }
    }
}

fn tail_lossy(bytes: &[u8], limit: usize) -> String {
    let start = bytes.len().saturating_sub(limit);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}
