use std::os::windows::process::CommandExt as _;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use windows_sys::Win32::Foundation::CloseHandle;
use windows_sys::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, CREATE_NEW_CONSOLE, CREATE_NEW_PROCESS_GROUP,
    CREATE_NO_WINDOW, DETACHED_PROCESS, PROCESS_QUERY_LIMITED_INFORMATION,
};

use super::KillError;

const STILL_ACTIVE: u32 = 259;

/// `taskkill` exit code when the PID does not exist.
const TASKKILL_NOT_FOUND: i32 = 128;

pub fn kill_tree(pid: u32) -> Result<(), KillError> {
    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F", "/T"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .creation_flags(CREATE_NO_WINDOW)
        .output();

    match output {
        Ok(out) if out.status.success() => {
            debug!(pid, "taskkill /T succeeded");
            Ok(())
        }
        Ok(out) if out.status.code() == Some(TASKKILL_NOT_FOUND) || !is_process_alive(pid) => {
            debug!(pid, "already exited");
            Ok(())
        }
        Ok(out) => {
            let msg = String::from_utf8_lossy(&out.stderr).trim().to_string();
            warn!(pid, code = ?out.status.code(), "taskkill failed: {}", msg);
            Err(KillError {
                root: pid,
                failed: vec![(pid, msg)],
            })
        }
        Err(e) => {
            warn!(pid, error = %e, "could not run taskkill");
            Err(KillError {
                root: pid,
                failed: vec![(pid, e.to_string())],
            })
        }
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut exit_code: u32 = 0;
        let result = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle);
        result != 0 && exit_code == STILL_ACTIVE
    }
}

pub fn launcher_command(path: &Path) -> Command {
    let mut cmd = Command::new("cmd.exe");
    cmd.arg("/C").arg(path);
    cmd
}

pub fn configure_relaunch(cmd: &mut Command, hidden: bool) {
    if hidden {
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
    } else {
        cmd.creation_flags(CREATE_NEW_CONSOLE | CREATE_NEW_PROCESS_GROUP);
    }
}

pub fn listening_sockets() -> Vec<(u32, u16)> {
    match std::process::Command::new("netstat")
        .args(["-ano", "-p", "TCP"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW)
        .output()
    {
        Ok(output) => {
            let mut pairs =
                super::sockets::parse_netstat(&String::from_utf8_lossy(&output.stdout));
            if let Ok(v6) = std::process::Command::new("netstat")
                .args(["-ano", "-p", "TCPv6"])
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .creation_flags(CREATE_NO_WINDOW)
                .output()
            {
                for pair in super::sockets::parse_netstat(&String::from_utf8_lossy(&v6.stdout)) {
                    if !pairs.contains(&pair) {
                        pairs.push(pair);
                    }
                }
            }
            pairs
        }
        Err(e) => {
            warn!(error = %e, "could not run netstat");
            Vec::new()
        }
    }
}
