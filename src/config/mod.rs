pub mod env_file;
pub mod model;

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info};

use env_file::{lookup_with_host_env, parse_env_file, SecretRegistry};
use model::SupervisorConfig;

/// `pocketrig.env` next to the running executable.
pub fn default_env_file() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .map(|exe| exe.with_extension("env"))
}

/// Load the supervisor configuration from an optional env file plus the
/// process environment. Host environment values take precedence.
pub fn load_config(env_file: Option<&Path>) -> anyhow::Result<SupervisorConfig> {
    let path = env_file.map(Path::to_path_buf).or_else(default_env_file);

    let file_vars = match &path {
        Some(p) => {
            let vars = parse_env_file(p)?;
            if vars.is_empty() {
                debug!(path = %p.display(), "no env file values loaded");
            } else {
                info!(path = %p.display(), keys = vars.len(), "loaded env file");
            }
            vars
        }
        None => Default::default(),
    };

    let config = SupervisorConfig::from_lookup(lookup_with_host_env(&file_vars))
        .with_context(|| match &path {
            Some(p) => format!("invalid configuration (env file {})", p.display()),
            None => "invalid configuration".to_string(),
        })?;

    log_config(&config);
    Ok(config)
}

fn log_config(config: &SupervisorConfig) {
    let mut secrets = SecretRegistry::new();
    secrets.track(&config.login_password);
    secrets.track(&config.delete_password);

    for role in model::Role::ALL {
        let rc = config.role(role);
        let launcher = rc
            .launcher
            .as_ref()
            .map(|p| secrets.mask_value(&p.display().to_string()))
            .unwrap_or_else(|| "(not configured)".to_string());
        info!(
            role = %role,
            port = rc.preferred_port,
            force_free = rc.force_free_port,
            "launcher: {}",
            launcher
        );
    }
    if config.login_password.is_empty() {
        tracing::warn!("LOGIN_PASS is empty; the control API accepts an empty password");
    }
}
