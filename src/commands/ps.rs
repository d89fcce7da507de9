use std::path::Path;

use anyhow::Result;

use crate::config::load_config;
use crate::config::model::Role;
use crate::orchestrator::ports::PortOracle;

pub async fn run(env_file: Option<&Path>) -> Result<()> {
    let config = load_config(env_file)?;
    let oracle = PortOracle::system();

    println!("  {:<16} {:<8} {:<10} PIDS", "ROLE", "PORT", "STATUS");
    println!("  {}", "-".repeat(50));

    for role in Role::ALL {
        let rc = config.role(role);
        let port = rc.preferred_port;
        let status = if rc.launcher.is_none() {
            "disabled"
        } else if oracle.is_port_in_use(port).await {
            "running"
        } else {
            "stopped"
        };
        let pids = oracle.pids_listening_on(port).await;
        let pids = if pids.is_empty() {
            "-".to_string()
        } else {
            pids.iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        println!("  {:<16} {:<8} {:<10} {}", role.label(), port, status, pids);
    }
    println!();
    Ok(())
}
