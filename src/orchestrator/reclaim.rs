use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::ports::PortOracle;
use crate::platform::{self, KillError};

/// Something that can force-terminate a process tree.
pub trait Terminator: Send + Sync + 'static {
    fn kill_tree(&self, pid: u32) -> Result<(), KillError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTerminator;

impl Terminator for SystemTerminator {
    fn kill_tree(&self, pid: u32) -> Result<(), KillError> {
        platform::kill_tree(pid)
    }
}

/// Frees a preferred port by terminating whoever is listening on it.
#[derive(Clone)]
pub struct Reclaimer {
    oracle: PortOracle,
    terminator: Arc<dyn Terminator>,
    settle: Duration,
}

impl Reclaimer {
    pub fn new(oracle: PortOracle, terminator: Arc<dyn Terminator>, settle: Duration) -> Self {
        Self {
            oracle,
            terminator,
            settle,
        }
    }

    /// Terminate one process tree off the async runtime.
    pub async fn terminate(&self, pid: u32) -> Result<(), KillError> {
        let terminator = Arc::clone(&self.terminator);
        tokio::task::spawn_blocking(move || terminator.kill_tree(pid))
            .await
            .unwrap_or_else(|e| {
                Err(KillError {
                    root: pid,
                    failed: vec![(pid, format!("kill task aborted: {e}"))],
                })
            })
    }

    /// Terminate every tree listening on `port`, except this process.
    ///
    /// Individual failures are logged and skipped. Returns how many owners
    /// were killed. Sleeps the settle delay when anything was attempted so
    /// the OS can release the socket.
    pub async fn free_port(&self, port: u16, label: &str) -> usize {
        let me = std::process::id();
        let owners: Vec<u32> = self
            .oracle
            .pids_listening_on(port)
            .await
            .into_iter()
            .filter(|&pid| pid != 0 && pid != me)
            .collect();
        if owners.is_empty() {
            return 0;
        }

        let mut killed = 0;
        for &pid in &owners {
            match self.terminate(pid).await {
                Ok(()) => {
                    info!(port, pid, "freed {} port", label);
                    killed += 1;
                }
                Err(e) => warn!(port, pid, error = %e, "could not free {} port", label),
            }
        }

        tokio::time::sleep(self.settle).await;
        killed
    }
}
