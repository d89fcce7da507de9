use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::warn;

use crate::platform;

/// Host socket queries the supervisor relies on for ground truth about
/// whether a service is up.
pub trait PortProbe: Send + Sync + 'static {
    /// Listening ports owned by `root` or any of its transitive children.
    /// Empty when the root has exited or cannot be inspected.
    fn listening_ports_of_tree(&self, root: u32) -> BTreeSet<u16>;

    /// Host-wide check, independent of ownership.
    fn is_port_in_use(&self, port: u16) -> bool;

    /// PIDs with a listening socket on `port`.
    fn pids_listening_on(&self, port: u16) -> BTreeSet<u32>;
}

/// [`PortProbe`] backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortProbe for SystemPorts {
    fn listening_ports_of_tree(&self, root: u32) -> BTreeSet<u16> {
        let tree: BTreeSet<u32> = platform::process_tree(root).into_iter().collect();
        if tree.is_empty() {
            return BTreeSet::new();
        }
        platform::listening_sockets()
            .into_iter()
            .filter(|(pid, _)| tree.contains(pid))
            .map(|(_, port)| port)
            .collect()
    }

    fn is_port_in_use(&self, port: u16) -> bool {
        platform::listening_sockets()
            .iter()
            .any(|&(_, p)| p == port)
    }

    fn pids_listening_on(&self, port: u16) -> BTreeSet<u32> {
        platform::listening_sockets()
            .into_iter()
            .filter(|&(pid, p)| p == port && pid != 0)
            .map(|(pid, _)| pid)
            .collect()
    }
}

/// Pick the service port out of everything a process tree listens on:
/// the preferred port when present, otherwise the numerically smallest.
pub fn select_port(ports: &BTreeSet<u16>, preferred: u16) -> Option<u16> {
    if ports.contains(&preferred) {
        Some(preferred)
    } else {
        ports.iter().next().copied()
    }
}

/// Async front for a [`PortProbe`]. Scans run on the blocking pool.
#[derive(Clone)]
pub struct PortOracle {
    probe: Arc<dyn PortProbe>,
}

impl PortOracle {
    pub fn new(probe: Arc<dyn PortProbe>) -> Self {
        Self { probe }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemPorts))
    }

    async fn run<T, F>(&self, what: &'static str, fallback: T, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&dyn PortProbe) -> T + Send + 'static,
    {
        let probe = Arc::clone(&self.probe);
        match tokio::task::spawn_blocking(move || f(probe.as_ref())).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "{} scan aborted", what);
                fallback
            }
        }
    }

    pub async fn listening_ports(&self, root: u32) -> BTreeSet<u16> {
        self.run("tree port", BTreeSet::new(), move |p| {
            p.listening_ports_of_tree(root)
        })
        .await
    }

    pub async fn is_port_in_use(&self, port: u16) -> bool {
        self.run("port", false, move |p| p.is_port_in_use(port)).await
    }

    pub async fn pids_listening_on(&self, port: u16) -> BTreeSet<u32> {
        self.run("port owner", BTreeSet::new(), move |p| {
            p.pids_listening_on(port)
        })
        .await
    }

    /// The port a process tree is serving on, per [`select_port`].
    pub async fn detect_port(&self, root: u32, preferred: u16) -> Option<u16> {
        select_port(&self.listening_ports(root).await, preferred)
    }
}
