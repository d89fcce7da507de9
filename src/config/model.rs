use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// One of the three externally developed processes under supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The image-generation server. Primary role.
    Comfy,
    /// Lightweight companion UI. Depends on `Comfy`.
    Mini,
    /// Gallery viewer. Independent of the other two.
    Gallery,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Comfy, Role::Mini, Role::Gallery];

    /// Dependent first, then primary, then independent.
    pub const STOP_ORDER: [Role; 3] = [Role::Mini, Role::Comfy, Role::Gallery];

    pub fn name(self) -> &'static str {
        match self {
            Role::Comfy => "comfy",
            Role::Mini => "mini",
            Role::Gallery => "gallery",
        }
    }

    /// Human-readable label used in log lines.
    pub fn label(self) -> &'static str {
        match self {
            Role::Comfy => "ComfyUI",
            Role::Mini => "Mini",
            Role::Gallery => "Smart Gallery",
        }
    }

    /// The role that must be reachable before this one is started.
    pub fn prerequisite(self) -> Option<Role> {
        match self {
            Role::Mini => Some(Role::Comfy),
            Role::Comfy | Role::Gallery => None,
        }
    }

    /// How the configured launcher is turned into a command line.
    pub fn launcher_kind(self) -> LauncherKind {
        match self {
            Role::Gallery => LauncherKind::PythonScript,
            Role::Comfy | Role::Mini => LauncherKind::Executable,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    /// Run the launcher file itself (batch file, shell script, binary).
    Executable,
    /// Run `<python> -u <launcher>`.
    PythonScript,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoleConfig {
    /// `None` means the role is intentionally disabled.
    pub launcher: Option<PathBuf>,
    pub preferred_port: u16,
    pub force_free_port: bool,
    pub ready_timeout: Duration,
}

/// Fixed pauses used by the lifecycle flows. Tests shrink these.
#[derive(Debug, Clone, PartialEq)]
pub struct Timings {
    pub reclaim_settle: Duration,
    pub restart_pause: Duration,
    pub relaunch_pause: Duration,
    pub shutdown_pause: Duration,
    pub exit_grace: Duration,
    pub ready_poll: Duration,
    pub exited_poll: Duration,
    pub failed_login_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            reclaim_settle: Duration::from_secs(1),
            restart_pause: Duration::from_secs(2),
            relaunch_pause: Duration::from_millis(800),
            shutdown_pause: Duration::from_secs(5),
            exit_grace: Duration::from_millis(300),
            ready_poll: Duration::from_secs(2),
            exited_poll: Duration::from_secs(1),
            failed_login_delay: Duration::from_millis(400),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub comfy: RoleConfig,
    pub mini: RoleConfig,
    pub gallery: RoleConfig,
    pub fallback_delay: Duration,
    pub control_port: u16,
    pub login_password: String,
    pub delete_password: String,
    pub delete_path: Option<PathBuf>,
    pub session_idle_timeout: Duration,
    pub gallery_python: String,
    pub patch_gallery_escapes: bool,
    pub start_delay: Duration,
    pub skip_launch: bool,
    pub timings: Timings,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: port must be between 1 and 65535, got {value:?}")]
    InvalidPort { key: &'static str, value: String },
}

fn default_gallery_python() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

/// Reads settings through a key lookup so callers decide the precedence of
/// env file vs. host environment.
struct Reader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    fn string(&self, key: &str) -> String {
        (self.lookup)(key).map(|v| v.trim().to_string()).unwrap_or_default()
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        let value = self.string(key);
        if value.is_empty() {
            None
        } else {
            Some(PathBuf::from(value))
        }
    }

    /// Malformed numbers fall back to the default with a warning.
    fn number(&self, key: &str, default: u64) -> u64 {
        match (self.lookup)(key) {
            None => default,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(n) => n,
                Err(_) => {
                    warn!(key, value = %raw, default, "not a number, using default");
                    default
                }
            },
        }
    }

    fn port(&self, key: &'static str, default: u16) -> Result<u16, ConfigError> {
        let Some(raw) = (self.lookup)(key) else {
            return Ok(default);
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(default);
        }
        match raw.parse::<i64>() {
            Ok(n) if (1..=65535).contains(&n) => Ok(n as u16),
            Ok(_) => Err(ConfigError::InvalidPort {
                key,
                value: raw.to_string(),
            }),
            Err(_) => {
                warn!(key, value = %raw, default, "not a number, using default");
                Ok(default)
            }
        }
    }

    /// On unless explicitly set to `0`.
    fn enabled_unless_zero(&self, key: &str) -> bool {
        (self.lookup)(key).map_or(true, |v| v.trim() != "0")
    }

    /// Off unless explicitly set to `1`.
    fn enabled_if_one(&self, key: &str) -> bool {
        (self.lookup)(key).is_some_and(|v| v.trim() == "1")
    }

    fn secs(&self, key: &str, default: u64) -> Duration {
        Duration::from_secs(self.number(key, default))
    }
}

impl SupervisorConfig {
    /// Build the configuration from a key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let r = Reader { lookup };

        let control_port = match (r.lookup)("CONTROL_PORT") {
            Some(_) => r.port("CONTROL_PORT", 5000)?,
            None => r.port("FLASK_PORT", 5000)?,
        };

        let gallery_python = {
            let v = r.string("GALLERY_PYTHON");
            if v.is_empty() {
                default_gallery_python().to_string()
            } else {
                v
            }
        };

        Ok(Self {
            comfy: RoleConfig {
                launcher: r.path("COMFY_PATH"),
                preferred_port: r.port("COMFY_PORT", 8188)?,
                force_free_port: r.enabled_unless_zero("FORCE_FREE_COMFY_PORT"),
                ready_timeout: r.secs("WAIT_FOR_COMFY_SECS", 120),
            },
            mini: RoleConfig {
                launcher: r.path("MINI_PATH"),
                preferred_port: r.port("MINI_PORT", 3000)?,
                force_free_port: r.enabled_unless_zero("FORCE_FREE_MINI_PORT"),
                ready_timeout: r.secs("WAIT_FOR_MINI_SECS", 60),
            },
            gallery: RoleConfig {
                launcher: r.path("SMART_GALLERY_PATH"),
                preferred_port: r.port("SMART_GALLERY_PORT", 8189)?,
                force_free_port: r.enabled_unless_zero("FORCE_FREE_SMART_GALLERY_PORT"),
                ready_timeout: r.secs("WAIT_FOR_GALLERY_SECS", 60),
            },
            fallback_delay: r.secs("FALLBACK_MINI_DELAY_SECS", 30),
            control_port,
            login_password: r.string("LOGIN_PASS"),
            delete_password: r.string("DELETE_PASSWORD"),
            delete_path: r.path("DELETE_PATH"),
            session_idle_timeout: r.secs("SESSION_IDLE_TIMEOUT_SECS", 3600),
            gallery_python,
            patch_gallery_escapes: r.enabled_unless_zero("PATCH_GALLERY_ESCAPES"),
            start_delay: r.secs("PC_START_DELAY", 0),
            skip_launch: r.enabled_if_one("PC_SKIP_LAUNCH"),
            timings: Timings::default(),
        })
    }

    pub fn role(&self, role: Role) -> &RoleConfig {
        match role {
            Role::Comfy => &self.comfy,
            Role::Mini => &self.mini,
            Role::Gallery => &self.gallery,
        }
    }

    pub fn preferred_port(&self, role: Role) -> u16 {
        self.role(role).preferred_port
    }

    /// Folder operations need both a password and a path.
    pub fn folder_target(&self) -> Option<(&str, &Path)> {
        match (&self.delete_path, self.delete_password.is_empty()) {
            (Some(path), false) => Some((self.delete_password.as_str(), path.as_path())),
            _ => None,
        }
    }
}
