//! The delete/recreate folder actions behind `/checkpw`, `/delete` and
//! `/recreate`, gated by their own password.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::dashboard::security::constant_time_eq;

/// Target folder plus the password that unlocks it.
#[derive(Debug, Clone)]
pub struct FolderGuard {
    target: Option<(String, PathBuf)>,
}

impl FolderGuard {
    /// Disabled unless both a password and a path are configured.
    pub fn new(target: Option<(&str, &Path)>) -> Self {
        Self {
            target: target.map(|(pw, path)| (pw.to_string(), path.to_path_buf())),
        }
    }

    /// The configured folder, if the password matches.
    pub fn unlock(&self, password: &str) -> Option<&Path> {
        let (expected, path) = self.target.as_ref()?;
        constant_time_eq(password.as_bytes(), expected.as_bytes()).then_some(path.as_path())
    }

    pub fn check(&self, password: &str) -> bool {
        self.unlock(password).is_some()
    }

    /// Remove the folder tree. A folder that does not exist is a success.
    pub async fn delete(&self, password: &str) -> bool {
        let Some(path) = self.unlock(password) else {
            return false;
        };
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!(path = %path.display(), "folder deleted");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "folder delete failed");
                false
            }
        }
    }

    /// Ensure the folder exists.
    pub async fn recreate(&self, password: &str) -> bool {
        let Some(path) = self.unlock(password) else {
            return false;
        };
        match tokio::fs::create_dir_all(path).await {
            Ok(()) => {
                info!(path = %path.display(), "folder recreated");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "folder recreate failed");
                false
            }
        }
    }
}
