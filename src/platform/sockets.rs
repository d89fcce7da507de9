//! Parsers for the host tools and kernel tables that list listening sockets.
//! They are plain text transforms so every format is testable on any host.

/// TCP state code for LISTEN in `/proc/net/tcp{,6}`.
const PROC_LISTEN: &str = "0A";

/// Extract `(port, inode)` for every listening socket in a `/proc/net/tcp`
/// or `/proc/net/tcp6` table.
pub fn parse_proc_net_tcp(content: &str) -> Vec<(u16, u64)> {
    let mut out = Vec::new();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || fields[3] != PROC_LISTEN {
            continue;
        }
        let Some(port_hex) = fields[1].rsplit(':').next() else {
            continue;
        };
        let (Ok(port), Ok(inode)) = (u16::from_str_radix(port_hex, 16), fields[9].parse::<u64>())
        else {
            continue;
        };
        if port != 0 {
            out.push((port, inode));
        }
    }
    out
}

/// Parse `netstat -ano -p TCP` output (Windows) into `(pid, port)` pairs for
/// sockets in the LISTENING state.
pub fn parse_netstat(content: &str) -> Vec<(u32, u16)> {
    let mut out = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || !fields[0].eq_ignore_ascii_case("TCP") {
            continue;
        }
        if !fields[3].eq_ignore_ascii_case("LISTENING") {
            continue;
        }
        let port = fields[1].rsplit(':').next().and_then(|p| p.parse::<u16>().ok());
        let pid = fields[4].parse::<u32>().ok();
        if let (Some(port), Some(pid)) = (port, pid) {
            if port != 0 {
                out.push((pid, port));
            }
        }
    }
    out
}

/// Parse `lsof -nP -iTCP -sTCP:LISTEN -Fpn` field output into `(pid, port)`.
pub fn parse_lsof(content: &str) -> Vec<(u32, u16)> {
    let mut out = Vec::new();
    let mut pid: Option<u32> = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix('p') {
            pid = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix('n') {
            let port = rest.rsplit(':').next().and_then(|p| p.trim().parse::<u16>().ok());
            if let (Some(pid), Some(port)) = (pid, port) {
                if !out.contains(&(pid, port)) {
                    out.push((pid, port));
                }
            }
        }
    }
    out
}
