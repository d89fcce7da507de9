use std::path::Path;

use anyhow::Result;

use crate::config::load_config;
use crate::config::model::Role;
use crate::orchestrator::Supervisor;
use crate::relaunch::RunMode;

/// Free the three configured ports without a running server.
pub async fn run(env_file: Option<&Path>) -> Result<()> {
    let config = load_config(env_file)?;
    let supervisor = Supervisor::new(config, RunMode::Visible);

    let mut total = 0;
    for role in Role::STOP_ORDER {
        let port = supervisor.config().preferred_port(role);
        let killed = supervisor.reclaimer().free_port(port, role.label()).await;
        if killed > 0 {
            println!("  {:<16} port {:<6} {} process(es) terminated", role.label(), port, killed);
        }
        total += killed;
    }

    if total == 0 {
        println!("Nothing was listening on the configured ports.");
    }
    Ok(())
}
