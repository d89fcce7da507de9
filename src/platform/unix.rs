use std::path::Path;
use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, warn};

use super::KillError;

pub fn kill_tree(pid: u32) -> Result<(), KillError> {
    let mut tree = super::process_tree(pid);
    if tree.is_empty() {
        // Not in the snapshot; still try the root in case it raced in.
        tree.push(pid);
    }

    let mut failed = Vec::new();
    // Deepest descendants first so nothing is re-parented mid-sweep.
    for &member in tree.iter().rev() {
        match kill(Pid::from_raw(member as i32), Signal::SIGKILL) {
            Ok(()) => debug!(pid = member, root = pid, "sent SIGKILL"),
            Err(Errno::ESRCH) => debug!(pid = member, "already exited"),
            Err(e) => {
                warn!(pid = member, root = pid, error = %e, "kill failed");
                failed.push((member, e.to_string()));
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(KillError { root: pid, failed })
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

pub fn launcher_command(path: &Path) -> Command {
    Command::new(path)
}

pub fn configure_relaunch(cmd: &mut Command, hidden: bool) {
    // A fresh process group keeps the replacement alive after we exit.
    cmd.process_group(0);
    if hidden {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
    }
}

#[cfg(target_os = "linux")]
pub fn listening_sockets() -> Vec<(u32, u16)> {
    use std::collections::HashMap;

    let mut by_inode: HashMap<u64, u16> = HashMap::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            for (port, inode) in super::sockets::parse_proc_net_tcp(&content) {
                by_inode.insert(inode, port);
            }
        }
    }
    if by_inode.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut owned = std::collections::HashSet::new();
    if let Ok(proc_dir) = std::fs::read_dir("/proc") {
        for entry in proc_dir.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(fds) = std::fs::read_dir(format!("/proc/{pid}/fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                let Ok(link) = std::fs::read_link(fd.path()) else {
                    continue;
                };
                let link = link.to_string_lossy();
                let Some(inode) = link
                    .strip_prefix("socket:[")
                    .and_then(|s| s.strip_suffix(']'))
                    .and_then(|s| s.parse::<u64>().ok())
                else {
                    continue;
                };
                if let Some(&port) = by_inode.get(&inode) {
                    owned.insert(inode);
                    if !out.contains(&(pid, port)) {
                        out.push((pid, port));
                    }
                }
            }
        }
    }

    // Listeners we could not attribute (other users' processes) still count
    // for host-wide port checks.
    for (inode, port) in by_inode {
        if inode != 0 && !owned.contains(&inode) && !out.iter().any(|&(_, p)| p == port) {
            out.push((0, port));
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
pub fn listening_sockets() -> Vec<(u32, u16)> {
    match std::process::Command::new("lsof")
        .args(["-nP", "-iTCP", "-sTCP:LISTEN", "-Fpn"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) => super::sockets::parse_lsof(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            debug!(error = %e, "lsof unavailable");
            Vec::new()
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    /// Exited and reaped, or left as a zombie nobody waits on.
    fn is_gone(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return true;
        };
        stat.rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z'))
    }

    #[test]
    fn kill_tree_takes_grandchildren_with_it() {
        let mut shell = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .spawn()
            .unwrap();
        let root = shell.id();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut tree = super::super::process_tree(root);
        while tree.len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
            tree = super::super::process_tree(root);
        }
        assert_eq!(tree.len(), 3, "tree: {tree:?}");
        assert_eq!(tree[0], root);

        kill_tree(root).unwrap();
        shell.wait().unwrap();

        let grandchildren = &tree[1..];
        let deadline = Instant::now() + Duration::from_secs(5);
        while !grandchildren.iter().all(|&pid| is_gone(pid)) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        for &pid in grandchildren {
            assert!(is_gone(pid), "pid {pid} survived");
        }
    }

    #[test]
    fn kill_tree_on_missing_pid_is_ok() {
        let mut done = std::process::Command::new("true").spawn().unwrap();
        let pid = done.id();
        done.wait().unwrap();
        assert!(kill_tree(pid).is_ok());
    }
}
