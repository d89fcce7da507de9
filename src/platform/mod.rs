pub mod sockets;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::UdpSocket;
use std::path::Path;

use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;
use tokio::process::Command;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as imp;
#[cfg(windows)]
use windows as imp;

/// Some descendants of a tree could not be terminated.
#[derive(Debug, Error)]
#[error("failed to kill {} of the processes in tree {root}: {}", failed.len(), describe(failed))]
pub struct KillError {
    pub root: u32,
    pub failed: Vec<(u32, String)>,
}

fn describe(failed: &[(u32, String)]) -> String {
    failed
        .iter()
        .map(|(pid, e)| format!("PID {pid} ({e})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Force-terminate `pid` and every transitive descendant.
///
/// A target that is already gone counts as success. A failure on one member
/// does not stop the attempt on the rest of the tree.
pub fn kill_tree(pid: u32) -> Result<(), KillError> {
    imp::kill_tree(pid)
}

/// Check if a process with the given PID is still alive.
pub fn is_process_alive(pid: u32) -> bool {
    imp::is_process_alive(pid)
}

/// Every `(pid, port)` pair for listening TCP sockets on this host.
///
/// Sockets whose owner cannot be resolved (another user's process without
/// sufficient privileges) are reported with PID 0.
pub fn listening_sockets() -> Vec<(u32, u16)> {
    imp::listening_sockets()
}

/// Build the command that runs a launcher file directly.
/// Unix: the file itself, Windows: `cmd.exe /C <file>`.
pub fn launcher_command(path: &Path) -> Command {
    imp::launcher_command(path)
}

/// Whether this host can run the given launcher. Batch files only run on
/// Windows.
pub fn supports_launcher(path: &Path) -> bool {
    let is_batch = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("bat") || e.eq_ignore_ascii_case("cmd"));
    !is_batch || cfg!(windows)
}

/// Configure how a relaunched supervisor is detached from the current one.
/// Hidden: no console and no inherited stdio. Visible: a console of its own
/// where the platform offers one.
pub fn configure_relaunch(cmd: &mut Command, hidden: bool) {
    imp::configure_relaunch(cmd, hidden)
}

/// PIDs of `root` and all of its transitive children, root first.
/// Empty when `root` is not running.
pub fn process_tree(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let pairs = system
        .processes()
        .iter()
        .map(|(pid, p)| (pid.as_u32(), p.parent().map(|pp| pp.as_u32())));
    tree_from_parents(root, pairs)
}

/// Breadth-first walk of a `(pid, parent)` snapshot starting at `root`.
pub fn tree_from_parents<I>(root: u32, pairs: I) -> Vec<u32>
where
    I: IntoIterator<Item = (u32, Option<u32>)>,
{
    let mut known = BTreeSet::new();
    let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for (pid, parent) in pairs {
        known.insert(pid);
        if let Some(parent) = parent {
            if parent != pid {
                children.entry(parent).or_default().push(pid);
            }
        }
    }
    if !known.contains(&root) {
        return Vec::new();
    }

    let mut seen = BTreeSet::from([root]);
    let mut order = vec![root];
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or_default() {
            if seen.insert(child) {
                order.push(child);
                queue.push_back(child);
            }
        }
    }
    order
}

/// Best-effort LAN address of this host, `127.0.0.1` when offline.
pub fn lan_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(std::time::Duration::from_millis(100)))?;
        // No packet is sent; connect only selects the outbound interface.
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Expand leading `~` or `$HOME` in a path string to the actual home directory.
///
/// Returns the original string unchanged when no home directory is available
/// or the string doesn't start with `~` or `$HOME`.
pub fn expand_home(path: &str) -> String {
    if let Some(home) = dirs::home_dir() {
        let home = home.to_string_lossy();
        if path == "~" || path == "$HOME" {
            return home.to_string();
        }
        if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
            return format!("{}{}{}", home, std::path::MAIN_SEPARATOR, rest);
        }
        if path.starts_with("$HOME/") || path.starts_with("$HOME\\") {
            return format!("{}{}", home, &path[5..]);
        }
    }
    path.to_string()
}
