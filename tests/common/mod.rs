#![allow(dead_code)]
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

/// A scratch directory holding an env file and launcher scripts.
pub struct TestSetup {
    pub dir: TempDir,
    pub env_path: PathBuf,
}

impl TestSetup {
    pub fn new(env: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("pocketrig.env");
        std::fs::write(&env_path, env).unwrap();
        Self { dir, env_path }
    }

    /// Write an executable `/bin/sh` launcher into the scratch directory.
    #[cfg(unix)]
    pub fn launcher(&self, name: &str, body: &str) -> PathBuf {
        write_launcher(self.dir.path(), name, body)
    }
}

#[cfg(unix)]
pub fn write_launcher(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A launcher body that serves HTTP on `port` until killed.
pub fn http_server(port: u16) -> String {
    format!("exec python3 -m http.server {port} --bind 127.0.0.1")
}

pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn free_ports(count: usize) -> Vec<u16> {
    // Bind all at once to avoid reuse, then drop
    let listeners: Vec<_> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let ports: Vec<_> = listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect();
    drop(listeners);
    ports
}

pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

pub async fn wait_for_port_release(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(("127.0.0.1", port)).is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send SIGINT so the binary takes its Ctrl-C path.
#[cfg(unix)]
pub fn interrupt(pid: u32) {
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGINT,
    )
    .ok();
}

/// Log in to a running control API and return `(cookie, csrf token)`.
pub async fn login(client: &reqwest::Client, base: &str, password: &str) -> (String, String) {
    let resp = client
        .post(format!("{base}/login"))
        .form(&[("password", password)])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SEE_OTHER);
    let cookie = resp.headers()[reqwest::header::SET_COOKIE]
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    let csrf = resp.headers()["x-csrf-token"].to_str().unwrap().to_string();
    (cookie, csrf)
}

pub fn no_redirect_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}
