use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::cli::ServeArgs;
use crate::config::load_config;
use crate::dashboard::routes::ControlState;
use crate::dashboard::server::{bind, serve_control_api};
use crate::orchestrator::Supervisor;
use crate::platform;
use crate::relaunch::{enforce_singleton, RunMode, RELAUNCHED_ENV};

/// Launch the supervised processes and serve the control API until a
/// shutdown, relaunch or Ctrl-C ends this instance.
pub async fn run(env_file: Option<&Path>, mode: RunMode, args: ServeArgs) -> Result<()> {
    let mut config = load_config(env_file)?;
    if let Some(secs) = args.start_delay {
        config.start_delay = Duration::from_secs(secs);
    }
    if let Some(port) = args.port {
        config.control_port = port;
    }
    config.skip_launch |= args.skip_launch;

    if !config.start_delay.is_zero() {
        info!("waiting {:?} before starting", config.start_delay);
        tokio::time::sleep(config.start_delay).await;
    }

    let skip_launch = config.skip_launch;
    let supervisor = Supervisor::new(config, mode);
    let listener = bind(supervisor.config().control_port).await?;
    let lan_ip = tokio::task::spawn_blocking(platform::lan_ip)
        .await
        .unwrap_or_else(|_| "127.0.0.1".to_string());
    info!(
        ?mode,
        "control API listening on http://{}:{}",
        lan_ip,
        supervisor.config().control_port
    );

    if std::env::var_os(RELAUNCHED_ENV).is_some() {
        match std::env::current_exe() {
            Ok(exe) => {
                let killed = tokio::task::spawn_blocking(move || enforce_singleton(&exe))
                    .await
                    .unwrap_or_default();
                if !killed.is_empty() {
                    info!(?killed, "removed supervisors left over from before the relaunch");
                }
            }
            Err(e) => warn!(error = %e, "singleton sweep skipped"),
        }
    }

    if skip_launch {
        info!("launch skipped, serving the control API only");
    } else {
        // The tracks report through the log; nothing here waits on them.
        let _ = supervisor.start_all().await;
    }

    let cancel = supervisor.shutdown_token().clone();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, leaving supervised processes running");
                cancel.cancel();
            }
        }
    });

    serve_control_api(listener, ControlState::new(supervisor.clone()), cancel).await?;

    let tracker = supervisor.tracker();
    tracker.close();
    if tokio::time::timeout(Duration::from_secs(2), tracker.wait())
        .await
        .is_err()
    {
        warn!("background tasks still running at exit");
    }
    info!("control API stopped");
    Ok(())
}
