use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::ports::PortOracle;
use super::reclaim::Reclaimer;
use super::table::ProcessTable;
use crate::config::model::{LauncherKind, Role, SupervisorConfig};
use crate::platform;

/// Why a launch was not attempted. None of these are failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No launcher configured: the role is intentionally disabled.
    NotConfigured,
    LauncherMissing(PathBuf),
    /// The launcher cannot run on this host (a batch file off Windows).
    UnsupportedPlatform(PathBuf),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotConfigured => write!(f, "launcher not configured"),
            SkipReason::LauncherMissing(p) => write!(f, "launcher not found: {}", p.display()),
            SkipReason::UnsupportedPlatform(p) => {
                write!(f, "launcher not supported on this platform: {}", p.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Started { pid: u32 },
    Skipped(SkipReason),
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to launch {role} ({}): {source}", path.display())]
    Spawn {
        role: Role,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Validates, prepares and spawns one role's launcher.
#[derive(Clone)]
pub struct LaunchCoordinator {
    config: Arc<SupervisorConfig>,
    table: Arc<ProcessTable>,
    oracle: PortOracle,
    reclaimer: Reclaimer,
}

impl LaunchCoordinator {
    pub fn new(
        config: Arc<SupervisorConfig>,
        table: Arc<ProcessTable>,
        oracle: PortOracle,
        reclaimer: Reclaimer,
    ) -> Self {
        Self {
            config,
            table,
            oracle,
            reclaimer,
        }
    }

    /// Start `role`. Spawns at most one OS process. On spawn failure the
    /// process table is left untouched.
    pub async fn launch(&self, role: Role) -> Result<LaunchOutcome, LaunchError> {
        let rc = self.config.role(role);
        let label = role.label();

        let Some(path) = rc.launcher.clone() else {
            info!(role = %role, "{} launcher not configured, skipping", label);
            return Ok(LaunchOutcome::Skipped(SkipReason::NotConfigured));
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(role = %role, path = %path.display(), "{} launcher not found, skipping", label);
            return Ok(LaunchOutcome::Skipped(SkipReason::LauncherMissing(path)));
        }
        if !platform::supports_launcher(&path) {
            warn!(role = %role, path = %path.display(), "{} launcher cannot run on this platform, skipping", label);
            return Ok(LaunchOutcome::Skipped(SkipReason::UnsupportedPlatform(path)));
        }

        if role.launcher_kind() == LauncherKind::PythonScript && self.config.patch_gallery_escapes {
            let script = path.clone();
            match tokio::task::spawn_blocking(move || patch_windows_path_literals(&script)).await {
                Ok(Ok(true)) => info!(role = %role, "rewrote Windows path literals as raw strings"),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => debug!(role = %role, error = %e, "path literal patch skipped"),
                Err(e) => debug!(role = %role, error = %e, "path literal patch aborted"),
            }
        }

        let port = rc.preferred_port;
        if rc.force_free_port && self.oracle.is_port_in_use(port).await {
            warn!(role = %role, port, "{} port busy, reclaiming", label);
            self.reclaimer.free_port(port, label).await;
        }

        let mut cmd = self.command_for(role, &path);
        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            role,
            path: path.clone(),
            source,
        })?;
        let installed = self.table.set(role, child);
        let pid = installed.pid.unwrap_or_default();
        info!(role = %role, pid, path = %path.display(), "launched {}", label);
        if let Some(old) = installed.displaced {
            warn!(role = %role, pid = old, "replaced a live {} handle, terminating it", label);
            if let Err(e) = self.reclaimer.terminate(old).await {
                warn!(role = %role, pid = old, error = %e, "could not terminate replaced {}", label);
            }
        }
        Ok(LaunchOutcome::Started { pid })
    }

    fn command_for(&self, role: Role, path: &Path) -> Command {
        let mut cmd = match role.launcher_kind() {
            LauncherKind::Executable => platform::launcher_command(path),
            LauncherKind::PythonScript => {
                let mut cmd = Command::new(&self.config.gallery_python);
                cmd.arg("-u").arg(path);
                if std::env::var_os("PYTHONWARNINGS").is_none() {
                    cmd.env("PYTHONWARNINGS", "ignore::SyntaxWarning");
                }
                cmd
            }
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

/// `NAME = 'C:\...'` at the start of a line. Raw strings do not match
/// because the quote must follow the `=` directly.
static PATH_LITERAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*\w+\s*=\s*)'([A-Za-z]:\\[^']*)'").expect("valid regex")
});

/// Rewrite bare Windows path string assignments as raw strings. Returns
/// `None` when nothing needed changing.
pub fn rewrite_path_literals(content: &str) -> Option<String> {
    let mut changed = false;
    let mut out = String::with_capacity(content.len() + 8);
    for line in content.split_inclusive('\n') {
        if PATH_LITERAL_RE.is_match(line) {
            out.push_str(&PATH_LITERAL_RE.replace(line, "${1}r'${2}'"));
            changed = true;
        } else {
            out.push_str(line);
        }
    }
    changed.then_some(out)
}

/// Apply [`rewrite_path_literals`] to a script in place.
pub fn patch_windows_path_literals(path: &Path) -> std::io::Result<bool> {
    let content = std::fs::read_to_string(path)?;
    match rewrite_path_literals(&content) {
        Some(patched) => {
            std::fs::write(path, patched)?;
            Ok(true)
        }
        None => Ok(false),
    }
}
