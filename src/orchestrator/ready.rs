use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ports::{select_port, PortOracle};
use super::table::ProcessTable;
use crate::config::model::{Role, Timings};

/// Where a readiness wait currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Waiting,
    Ready(u16),
    TimedOut,
}

/// Final judgement after a wait, including the post-timeout heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A listening port was observed.
    Ready(u16),
    /// Timed out, but the process is alive or its port is in use. Not a
    /// confirmed-ready signal; callers treat it as a delayed success.
    SoftReady,
    /// Timed out and the process has exited.
    Failed,
}

/// Outcome of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Ready(u16),
    Exited,
    NoPort,
}

/// Polls for a just-launched role's listening port until a deadline.
pub struct ReadinessWaiter {
    role: Role,
    preferred: u16,
    table: Arc<ProcessTable>,
    oracle: PortOracle,
    ready_poll: Duration,
    exited_poll: Duration,
}

impl ReadinessWaiter {
    pub fn new(
        role: Role,
        preferred: u16,
        table: Arc<ProcessTable>,
        oracle: PortOracle,
        timings: &Timings,
    ) -> Self {
        Self {
            role,
            preferred,
            table,
            oracle,
            ready_poll: timings.ready_poll,
            exited_poll: timings.exited_poll,
        }
    }

    async fn probe(&self) -> Probe {
        if self.oracle.is_port_in_use(self.preferred).await {
            return Probe::Ready(self.preferred);
        }
        let Some(pid) = self.table.pid(self.role) else {
            return Probe::Exited;
        };
        match select_port(&self.oracle.listening_ports(pid).await, self.preferred) {
            Some(port) => Probe::Ready(port),
            None => Probe::NoPort,
        }
    }

    /// One state-machine step. Records the detected port on `Ready`.
    pub async fn step(&self) -> ReadyState {
        match self.probe().await {
            Probe::Ready(port) => {
                self.table.set_detected_port(self.role, port);
                ReadyState::Ready(port)
            }
            Probe::Exited | Probe::NoPort => ReadyState::Waiting,
        }
    }

    /// Drive [`Self::step`] until `Ready`, the deadline, or cancellation.
    pub async fn wait(&self, timeout: Duration, cancel: &CancellationToken) -> ReadyState {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                return ReadyState::TimedOut;
            }
            let pause = match self.probe().await {
                Probe::Ready(port) => {
                    self.table.set_detected_port(self.role, port);
                    debug!(role = %self.role, port, "ready");
                    return ReadyState::Ready(port);
                }
                // Exited may just be start-up lag (a launcher that re-execs).
                Probe::Exited => self.exited_poll,
                Probe::NoPort => self.ready_poll,
            };
            let wake = (Instant::now() + pause).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = cancel.cancelled() => return ReadyState::TimedOut,
            }
        }
    }

    /// Post-timeout heuristic: alive or port in use means a soft success.
    pub async fn settle(&self) -> Verdict {
        if self.oracle.is_port_in_use(self.preferred).await || self.table.is_alive(self.role) {
            Verdict::SoftReady
        } else {
            Verdict::Failed
        }
    }

    /// [`Self::wait`] followed by [`Self::settle`] on timeout.
    pub async fn run(&self, timeout: Duration, cancel: &CancellationToken) -> Verdict {
        match self.wait(timeout, cancel).await {
            ReadyState::Ready(port) => Verdict::Ready(port),
            ReadyState::TimedOut | ReadyState::Waiting => self.settle().await,
        }
    }
}
