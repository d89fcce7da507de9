use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::orchestrator::Supervisor;
use crate::platform;

/// Marker set on a relaunched instance so it sweeps up duplicates once up.
pub const RELAUNCHED_ENV: &str = "POCKETRIG_RELAUNCHED";
/// Start delay handed to a relaunched instance so the old port is released.
pub const START_DELAY_ENV: &str = "PC_START_DELAY";
const RELAUNCH_START_DELAY_SECS: &str = "2";

const HIDDEN_FLAG: &str = "--hidden";

/// How this supervisor instance presents itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// No console, stdio detached.
    Hidden,
    /// Attached to a console of its own.
    Visible,
}

impl RunMode {
    pub fn is_hidden(self) -> bool {
        self == RunMode::Hidden
    }
}

#[derive(Debug, Error)]
pub enum RelaunchError {
    #[error("cannot determine the current executable: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("failed to spawn replacement {}: {source}", exe.display())]
    Spawn {
        exe: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Command-line for the replacement: the original arguments without any
/// `--hidden`, with it re-added for hidden mode.
pub fn relaunch_args<I>(original: I, mode: RunMode) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args: Vec<OsString> = original
        .into_iter()
        .filter(|a| a.as_os_str() != OsStr::new(HIDDEN_FLAG))
        .collect();
    if mode.is_hidden() {
        args.push(OsString::from(HIDDEN_FLAG));
    }
    args
}

/// Terminal transitions of a running supervisor.
pub struct Relauncher {
    supervisor: Supervisor,
    /// Program the replacement runs and the singleton sweep matches on.
    /// Defaults to the current executable.
    entry: Option<PathBuf>,
}

impl Relauncher {
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            entry: None,
        }
    }

    pub fn with_entry(mut self, entry: impl Into<PathBuf>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    fn entry(&self) -> std::io::Result<PathBuf> {
        match &self.entry {
            Some(entry) => Ok(entry.clone()),
            None => std::env::current_exe(),
        }
    }

    /// stop-all, spawn a replacement in `mode`, then end this instance.
    /// If the spawn fails this instance keeps serving.
    pub async fn relaunch(&self, mode: RunMode) -> Result<(), RelaunchError> {
        let timings = &self.supervisor.config().timings;
        self.supervisor.stop_all().await;
        tokio::time::sleep(timings.relaunch_pause).await;

        let exe = self.entry().map_err(RelaunchError::CurrentExe)?;
        let args = relaunch_args(std::env::args_os().skip(1), mode);

        let mut cmd = Command::new(&exe);
        cmd.args(&args)
            .env(START_DELAY_ENV, RELAUNCH_START_DELAY_SECS)
            .env(RELAUNCHED_ENV, "1");
        if let Some(dir) = exe.parent() {
            cmd.current_dir(dir);
        }
        platform::configure_relaunch(&mut cmd, mode.is_hidden());

        let child = cmd.spawn().map_err(|source| RelaunchError::Spawn {
            exe: exe.clone(),
            source,
        })?;
        info!(pid = ?child.id(), ?mode, "replacement supervisor started, exiting");
        // The replacement must outlive us; dropping the handle does not kill it.
        drop(child);

        tokio::time::sleep(timings.exit_grace).await;
        self.supervisor.shutdown_token().cancel();
        Ok(())
    }

    /// stop-all, pause, remove duplicate supervisors, then end this instance.
    pub async fn shutdown(&self) {
        let timings = &self.supervisor.config().timings;
        self.supervisor.stop_all().await;
        tokio::time::sleep(timings.shutdown_pause).await;

        match self.entry() {
            Ok(exe) => {
                let killed = tokio::task::spawn_blocking(move || enforce_singleton(&exe))
                    .await
                    .unwrap_or_default();
                if !killed.is_empty() {
                    info!(?killed, "terminated duplicate supervisors");
                }
            }
            Err(e) => warn!(error = %e, "singleton sweep skipped"),
        }

        tokio::time::sleep(timings.exit_grace).await;
        info!("shutting down");
        self.supervisor.shutdown_token().cancel();
    }

    /// Background form of [`Self::relaunch`] that logs failures.
    pub async fn relaunch_logged(self, mode: RunMode) {
        if let Err(e) = self.relaunch(mode).await {
            error!("relaunch failed, keeping this instance: {}", e);
        }
    }
}

/// Whether a process with `exe` and `cmd` (working directory `cwd`) runs the
/// same entry point as `entry`.
pub fn is_same_entry_point(
    entry: &Path,
    exe: Option<&Path>,
    cmd: &[OsString],
    cwd: Option<&Path>,
) -> bool {
    let entry = canonical(entry);
    if exe.map(canonical).is_some_and(|e| e == entry) {
        return true;
    }
    cmd.iter().any(|arg| {
        let arg = Path::new(arg);
        let resolved = match (arg.is_absolute(), cwd) {
            (true, _) => arg.to_path_buf(),
            (false, Some(dir)) => dir.join(arg),
            (false, None) => return false,
        };
        canonical(&resolved) == entry
    })
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Kill every other process running `entry`. Returns the PIDs terminated.
pub fn enforce_singleton(entry: &Path) -> Vec<u32> {
    let me = std::process::id();
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing()
            .with_exe(UpdateKind::OnlyIfNotSet)
            .with_cmd(UpdateKind::OnlyIfNotSet)
            .with_cwd(UpdateKind::OnlyIfNotSet),
    );

    let mut duplicates: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != me)
        .filter(|(_, p)| {
            // Threads share the parent's command line; only look at processes.
            p.thread_kind().is_none()
                && is_same_entry_point(entry, p.exe(), p.cmd(), p.cwd())
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();
    duplicates.sort_unstable();

    let mut killed = Vec::new();
    for pid in duplicates {
        match platform::kill_tree(pid) {
            Ok(()) => {
                info!(pid, "terminated duplicate supervisor");
                killed.push(pid);
            }
            Err(e) => warn!(pid, error = %e, "could not terminate duplicate supervisor"),
        }
    }
    killed
}
