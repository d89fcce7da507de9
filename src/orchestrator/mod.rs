pub mod launch;
pub mod ports;
pub mod ready;
pub mod reclaim;
pub mod table;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::model::{Role, SupervisorConfig};
use crate::relaunch::RunMode;

use launch::{LaunchCoordinator, LaunchError, LaunchOutcome, SkipReason};
use ports::PortOracle;
use ready::{ReadinessWaiter, Verdict};
use reclaim::{Reclaimer, SystemTerminator, Terminator};
use table::ProcessTable;

/// The role everything else waits for.
const PRIMARY: Role = Role::Comfy;
/// Started once the primary is ready.
const COMPANION: Role = Role::Mini;
/// Started alongside, with no dependencies.
const INDEPENDENT: Role = Role::Gallery;

/// Result of starting one role and waiting for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleOutcome {
    /// Already reachable, nothing spawned.
    AlreadyRunning,
    Started { pid: u32, verdict: Verdict },
    Skipped(SkipReason),
    /// A stop-all ran before the spawn, so nothing was started.
    Superseded,
}

/// Whether a gated launch went ahead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Launched(LaunchOutcome),
    AlreadyRunning,
    /// A stop-all ran before the spawn.
    Superseded,
}

/// What the spawn phase of an ensure request did. Readiness is awaited on
/// a background worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureAck {
    AlreadyRunning,
    Skipped(SkipReason),
    Started { pid: u32 },
    /// The prerequisite was spawned; the role follows once it is ready.
    AfterPrerequisite { prerequisite: Role, pid: u32 },
    Superseded,
}

/// What happened to the companion chain of start-all.
#[derive(Debug)]
pub enum CompanionOutcome {
    Launched { fallback: bool, outcome: RoleOutcome },
    /// The primary exited without ever exposing a port.
    PrimaryDied,
    LaunchFailed(LaunchError),
    /// A stop-all, restart or shutdown superseded the chain.
    Cancelled,
}

/// Handles to the three tracks of a start-all.
#[derive(Debug)]
pub struct StartAll {
    pub primary: Result<Admission, LaunchError>,
    /// Present only when the primary was spawned.
    pub companion: Option<JoinHandle<CompanionOutcome>>,
    pub independent: JoinHandle<Result<RoleOutcome, LaunchError>>,
}

/// Liveness plus best-known port, as reported by `/netinfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    pub port: Option<u16>,
    pub running: bool,
}

/// What counts as "already running" before a spawn.
#[derive(Debug, Clone, Copy)]
enum Reach {
    /// Our handle is alive or anything listens on the preferred port.
    Host,
    /// Only our own live handle. Foreign occupants are reclaimed by the launch.
    Owned,
}

struct Inner {
    config: Arc<SupervisorConfig>,
    table: Arc<ProcessTable>,
    oracle: PortOracle,
    reclaimer: Reclaimer,
    launcher: LaunchCoordinator,
    /// Held across the reachability check and the spawn of one role.
    launch_gates: BTreeMap<Role, tokio::sync::Mutex<()>>,
    /// Child of `shutdown`. Every stop-all cancels it and installs a fresh
    /// one so chains started earlier stand down.
    generation: Mutex<CancellationToken>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    mode: RunMode,
    started_at: DateTime<Utc>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn report_ensure(role: Role, result: &Result<RoleOutcome, LaunchError>) {
    match result {
        Ok(RoleOutcome::AlreadyRunning) => info!(role = %role, "ensure: already running"),
        Ok(outcome) => info!(role = %role, ?outcome, "ensure finished"),
        Err(e) => error!(role = %role, "ensure failed: {}", e),
    }
}

/// Owns the process table and composes launch, readiness and termination
/// into the start-all, stop-all, restart and ensure flows.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, mode: RunMode) -> Self {
        Self::with_parts(
            config,
            PortOracle::system(),
            Arc::new(SystemTerminator),
            mode,
        )
    }

    /// Build a supervisor over explicit port and kill backends.
    pub fn with_parts(
        config: SupervisorConfig,
        oracle: PortOracle,
        terminator: Arc<dyn Terminator>,
        mode: RunMode,
    ) -> Self {
        let config = Arc::new(config);
        let table = Arc::new(ProcessTable::new(&config));
        let reclaimer = Reclaimer::new(oracle.clone(), terminator, config.timings.reclaim_settle);
        let launcher = LaunchCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&table),
            oracle.clone(),
            reclaimer.clone(),
        );
        let launch_gates = Role::ALL
            .into_iter()
            .map(|r| (r, tokio::sync::Mutex::new(())))
            .collect();
        let shutdown = CancellationToken::new();

        Self {
            inner: Arc::new(Inner {
                config,
                table,
                oracle,
                reclaimer,
                launcher,
                launch_gates,
                generation: Mutex::new(shutdown.child_token()),
                tracker: TaskTracker::new(),
                shutdown,
                mode,
                started_at: Utc::now(),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn table(&self) -> &ProcessTable {
        &self.inner.table
    }

    pub fn oracle(&self) -> &PortOracle {
        &self.inner.oracle
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.inner.reclaimer
    }

    pub fn mode(&self) -> RunMode {
        self.inner.mode
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    /// Cancelled when the supervisor is about to exit.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Run a flow on a background worker. The HTTP handlers use this so they
    /// can acknowledge immediately.
    pub fn spawn_background<F>(&self, flow: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.tracker.spawn(flow)
    }

    fn generation(&self) -> CancellationToken {
        lock(&self.inner.generation).clone()
    }

    /// Cancel every flow started so far and open a new generation.
    fn supersede_generation(&self) {
        let fresh = self.inner.shutdown.child_token();
        let previous = std::mem::replace(&mut *lock(&self.inner.generation), fresh);
        previous.cancel();
    }

    fn waiter(&self, role: Role) -> ReadinessWaiter {
        ReadinessWaiter::new(
            role,
            self.inner.config.preferred_port(role),
            Arc::clone(&self.inner.table),
            self.inner.oracle.clone(),
            &self.inner.config.timings,
        )
    }

    /// Preferred port in use anywhere on the host, or our handle alive.
    pub async fn is_reachable(&self, role: Role) -> bool {
        self.inner
            .oracle
            .is_port_in_use(self.inner.config.preferred_port(role))
            .await
            || self.inner.table.is_alive(role)
    }

    /// Check and spawn `role` under its launch gate, so concurrent flows
    /// spawn it at most once and never after a stop-all superseded them.
    async fn admit(
        &self,
        role: Role,
        generation: &CancellationToken,
        reach: Reach,
    ) -> Result<Admission, LaunchError> {
        let _gate = self.inner.launch_gates[&role].lock().await;
        if generation.is_cancelled() {
            debug!(role = %role, "launch superseded by stop");
            return Ok(Admission::Superseded);
        }
        let running = match reach {
            Reach::Host => self.is_reachable(role).await,
            Reach::Owned => self.inner.table.is_alive(role),
        };
        if running {
            debug!(role = %role, "already running");
            return Ok(Admission::AlreadyRunning);
        }
        self.inner.launcher.launch(role).await.map(Admission::Launched)
    }

    /// Wait for a freshly spawned `role` within its timeout.
    async fn await_ready(&self, role: Role, pid: u32, generation: &CancellationToken) -> RoleOutcome {
        let timeout = self.inner.config.role(role).ready_timeout;
        let verdict = self.waiter(role).run(timeout, generation).await;
        match verdict {
            Verdict::Ready(port) => info!(role = %role, port, "{} ready", role.label()),
            Verdict::SoftReady => warn!(
                role = %role,
                "{} did not expose a port within {:?}, still running",
                role.label(),
                timeout
            ),
            Verdict::Failed => warn!(
                role = %role,
                "{} exited before exposing a port",
                role.label()
            ),
        }
        RoleOutcome::Started { pid, verdict }
    }

    /// Launch `role` and, if spawned, wait for it.
    async fn start_and_wait(
        &self,
        role: Role,
        generation: &CancellationToken,
        reach: Reach,
    ) -> Result<RoleOutcome, LaunchError> {
        Ok(match self.admit(role, generation, reach).await? {
            Admission::Superseded => RoleOutcome::Superseded,
            Admission::AlreadyRunning => RoleOutcome::AlreadyRunning,
            Admission::Launched(LaunchOutcome::Skipped(reason)) => RoleOutcome::Skipped(reason),
            Admission::Launched(LaunchOutcome::Started { pid }) => {
                self.await_ready(role, pid, generation).await
            }
        })
    }

    /// Launch the primary, chain the companion behind its readiness, and run
    /// the independent role on its own track.
    pub async fn start_all(&self) -> StartAll {
        let generation = self.generation();

        let independent = {
            let this = self.clone();
            let generation = generation.clone();
            self.inner.tracker.spawn(async move {
                let result = this
                    .start_and_wait(INDEPENDENT, &generation, Reach::Owned)
                    .await;
                if let Err(e) = &result {
                    error!(role = %INDEPENDENT, "{}", e);
                }
                result
            })
        };

        let primary = self.admit(PRIMARY, &generation, Reach::Owned).await;
        let companion = match &primary {
            Ok(Admission::Launched(LaunchOutcome::Started { .. })) => {
                let this = self.clone();
                Some(
                    self.inner
                        .tracker
                        .spawn(async move { this.run_companion(generation).await }),
                )
            }
            Ok(Admission::Launched(LaunchOutcome::Skipped(reason))) => {
                warn!(
                    role = %PRIMARY,
                    "{} skipped ({}), {} will not be started",
                    PRIMARY.label(),
                    reason,
                    COMPANION.label()
                );
                None
            }
            Ok(Admission::AlreadyRunning) => {
                info!(role = %PRIMARY, "{} already running", PRIMARY.label());
                None
            }
            Ok(Admission::Superseded) => None,
            Err(e) => {
                error!(role = %PRIMARY, "{}", e);
                None
            }
        };

        StartAll {
            primary,
            companion,
            independent,
        }
    }

    async fn run_companion(&self, generation: CancellationToken) -> CompanionOutcome {
        let config = &self.inner.config;
        let timeout = config.role(PRIMARY).ready_timeout;
        info!(
            role = %PRIMARY,
            "waiting for {} to expose a port (up to {:?})",
            PRIMARY.label(),
            timeout
        );

        let verdict = self.waiter(PRIMARY).run(timeout, &generation).await;
        if generation.is_cancelled() {
            info!("start-all superseded, {} not started", COMPANION.label());
            return CompanionOutcome::Cancelled;
        }
        let fallback = match verdict {
            Verdict::Ready(port) => {
                info!(port, "{} ready, starting {}", PRIMARY.label(), COMPANION.label());
                false
            }
            Verdict::SoftReady => {
                warn!(
                    "{} probe inconclusive, starting {} in {:?}",
                    PRIMARY.label(),
                    COMPANION.label(),
                    config.fallback_delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(config.fallback_delay) => {}
                    _ = generation.cancelled() => return CompanionOutcome::Cancelled,
                }
                true
            }
            Verdict::Failed => {
                warn!(
                    "skipping {}: {} stopped during the wait",
                    COMPANION.label(),
                    PRIMARY.label()
                );
                return CompanionOutcome::PrimaryDied;
            }
        };

        match self.start_and_wait(COMPANION, &generation, Reach::Owned).await {
            Ok(RoleOutcome::Superseded) => CompanionOutcome::Cancelled,
            Ok(outcome) => CompanionOutcome::Launched { fallback, outcome },
            Err(e) => {
                error!(role = %COMPANION, "{}", e);
                CompanionOutcome::LaunchFailed(e)
            }
        }
    }

    /// Stop one role if we are running it. Callers hold its launch gate.
    async fn stop_role(&self, role: Role) {
        info!(role = %role, "stopping {} (if running)", role.label());
        let Some(pid) = self.inner.table.clear(role) else {
            return;
        };
        match self.inner.reclaimer.terminate(pid).await {
            Ok(()) => debug!(role = %role, pid, "stopped"),
            Err(e) => warn!(role = %role, pid, error = %e, "stop incomplete"),
        }
    }

    /// Supersede in-flight start flows, stop every role in dependency order,
    /// then reclaim all three ports so leftovers from an earlier run are gone
    /// too. Idempotent.
    pub async fn stop_all(&self) {
        self.supersede_generation();
        for role in Role::STOP_ORDER {
            let _gate = self.inner.launch_gates[&role].lock().await;
            self.stop_role(role).await;
        }
        for role in Role::STOP_ORDER {
            self.inner
                .reclaimer
                .free_port(self.inner.config.preferred_port(role), role.label())
                .await;
        }
    }

    /// stop-all, a settle pause, then start-all.
    pub async fn restart(&self) -> StartAll {
        self.stop_all().await;
        tokio::time::sleep(self.inner.config.timings.restart_pause).await;
        self.start_all().await
    }

    /// Start `role` unless it is already reachable and wait for it. The
    /// companion first ensures its prerequisite.
    pub async fn ensure(&self, role: Role) -> Result<RoleOutcome, LaunchError> {
        let generation = self.generation();
        if let Some(prerequisite) = role.prerequisite() {
            if !self.is_reachable(prerequisite).await {
                info!(
                    role = %role,
                    "{} needs {}, starting it first",
                    role.label(),
                    prerequisite.label()
                );
                if let Err(e) = self
                    .start_and_wait(prerequisite, &generation, Reach::Host)
                    .await
                {
                    warn!(role = %prerequisite, "{}", e);
                }
            }
        }
        self.start_and_wait(role, &generation, Reach::Host).await
    }

    /// Spawn phase of [`Self::ensure`]. A spawn error comes back to the
    /// caller; the readiness wait continues on the tracker. When the
    /// prerequisite has to be spawned first, the role itself is launched in
    /// the background once the prerequisite is ready.
    pub async fn ensure_detached(&self, role: Role) -> Result<EnsureAck, LaunchError> {
        let generation = self.generation();

        if let Some(prerequisite) = role.prerequisite() {
            if !self.is_reachable(prerequisite).await {
                match self.admit(prerequisite, &generation, Reach::Host).await {
                    Ok(Admission::Launched(LaunchOutcome::Started { pid })) => {
                        let this = self.clone();
                        self.spawn_background(async move {
                            this.await_ready(prerequisite, pid, &generation).await;
                            let result = this.start_and_wait(role, &generation, Reach::Host).await;
                            report_ensure(role, &result);
                        });
                        return Ok(EnsureAck::AfterPrerequisite { prerequisite, pid });
                    }
                    Ok(_) => {}
                    Err(e) => warn!(role = %prerequisite, "{}", e),
                }
            }
        }

        Ok(match self.admit(role, &generation, Reach::Host).await? {
            Admission::Superseded => EnsureAck::Superseded,
            Admission::AlreadyRunning => EnsureAck::AlreadyRunning,
            Admission::Launched(LaunchOutcome::Skipped(reason)) => EnsureAck::Skipped(reason),
            Admission::Launched(LaunchOutcome::Started { pid }) => {
                let this = self.clone();
                self.spawn_background(async move {
                    let outcome = this.await_ready(role, pid, &generation).await;
                    report_ensure(role, &Ok(outcome));
                });
                EnsureAck::Started { pid }
            }
        })
    }

    /// Liveness for `/status`, refreshing the detected port on the way.
    pub async fn refresh_status(&self, role: Role) -> bool {
        let preferred = self.inner.config.preferred_port(role);
        let table = &self.inner.table;
        let mut alive = table.is_alive(role);
        if !alive && self.inner.oracle.is_port_in_use(preferred).await {
            alive = true;
            table.set_detected_port(role, preferred);
        }
        if let Some(pid) = table.pid(role) {
            if let Some(port) = self.inner.oracle.detect_port(pid, preferred).await {
                table.set_detected_port(role, port);
            }
        }
        alive
    }

    /// Best-known port and liveness for `/netinfo`.
    pub async fn port_info(&self, role: Role) -> PortInfo {
        let preferred = self.inner.config.preferred_port(role);
        let in_use = self.inner.oracle.is_port_in_use(preferred).await;
        let port = self
            .inner
            .table
            .detected_port(role)
            .or(in_use.then_some(preferred));
        PortInfo {
            port,
            running: in_use || self.inner.table.is_alive(role),
        }
    }
}
