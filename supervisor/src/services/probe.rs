//! Read-only queries against the OS process table.

use std::collections::HashMap;
use std::path::Path;

/// Whether `pid` names a live, non-zombie process.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => !is_zombie(pid),
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    let filter = format!("PID eq {}", pid);
    match std::process::Command::new("tasklist")
        .args(["/FI", filter.as_str(), "/NH", "/FO", "CSV"])
        .output()
    {
        Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&format!("\"{}\"", pid)),
        Err(_) => false,
    }
}

#[cfg(unix)]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| parse_stat(&stat).map(|(state, _)| state == 'Z'))
        .unwrap_or(false)
}

/// `(state, ppid)` from a `/proc/<pid>/stat` line. The command name may
/// contain spaces and parentheses, so fields are read after the last `)`.
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// Full command line of `pid`, arguments joined by spaces.
pub fn cmdline(pid: u32) -> Option<String> {
    if let Ok(raw) = std::fs::read(format!("/proc/{}/cmdline", pid)) {
        let joined = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        if !joined.is_empty() {
            return Some(joined);
        }
    }
    cmdline_fallback(pid)
}

#[cfg(unix)]
fn cmdline_fallback(pid: u32) -> Option<String> {
    let out = std::process::Command::new("ps")
        .args(["-o", "command=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    let line = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!line.is_empty()).then_some(line)
}

#[cfg(windows)]
fn cmdline_fallback(pid: u32) -> Option<String> {
    let filter = format!("ProcessId={}", pid);
    let out = std::process::Command::new("wmic")
        .args(["process", "where", filter.as_str(), "get", "CommandLine", "/value"])
        .output()
        .ok()?;
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .find_map(|l| l.trim().strip_prefix("CommandLine=").map(str::to_string))
        .filter(|l| !l.is_empty())
}

/// Heuristic pid-reuse guard: the live process at `pid` was started with
/// `script` somewhere on its command line.
pub fn runs_script(pid: u32, script: &Path) -> bool {
    let needle = script.to_string_lossy();
    match cmdline(pid) {
        Some(line) => line.contains(needle.as_ref()),
        None => false,
    }
}

/// All transitive children of `root`, nearest first.
pub fn descendants(root: u32) -> Vec<u32> {
    collect_descendants(root, &process_table())
}

fn collect_descendants(root: u32, table: &[(u32, u32)]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, ppid) in table {
        children.entry(*ppid).or_default().push(*pid);
    }

    let mut found = Vec::new();
    let mut queue = vec![root];
    while let Some(parent) = queue.pop() {
        if let Some(kids) = children.get(&parent) {
            for kid in kids {
                if *kid != root && !found.contains(kid) {
                    found.push(*kid);
                    queue.push(*kid);
                }
            }
        }
    }
    found
}

/// `(pid, ppid)` pairs for every visible process.
fn process_table() -> Vec<(u32, u32)> {
    let mut table = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            if let Some((_, ppid)) = std::fs::read_to_string(entry.path().join("stat"))
                .ok()
                .and_then(|s| parse_stat(&s))
            {
                table.push((pid, ppid));
            }
        }
    }
    if table.is_empty() {
        table = ps_table();
    }
    table
}

#[cfg(unix)]
fn ps_table() -> Vec<(u32, u32)> {
    let Ok(out) = std::process::Command::new("ps").args(["-A", "-o", "pid=,ppid="]).output() else {
        return Vec::new();
    };
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            Some((cols.next()?.parse().ok()?, cols.next()?.parse().ok()?))
        })
        .collect()
}

#[cfg(windows)]
fn ps_table() -> Vec<(u32, u32)> {
    Vec::new()
}
