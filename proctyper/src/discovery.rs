use std::{
    collections::{HashMap, HashSet},
    os::unix::fs::MetadataExt,
    path::PathBuf,
};

use anyhow::{Context, Result};
use log::debug;
use procfs::process::{FDTarget, Process};
use proctyper_common::ExecutableIdentity;

use crate::typer::ExecutableInfo;

/// Builds the executable descriptor of a running process.
///
/// The identity comes from `stat` on `/proc/<pid>/exe`, which follows the link
/// into the process's own mount namespace, so containerized binaries get the
/// identity of the file they actually run.
pub fn executable_for_pid(pid: u32) -> Result<ExecutableInfo> {
    let process = Process::new(pid as i32).with_context(|| format!("PID {} not found", pid))?;
    let exe_path = process
        .exe()
        .with_context(|| format!("Failed to read executable of PID {}", pid))?;

    let link = PathBuf::from(format!("/proc/{}/exe", pid));
    let meta = std::fs::metadata(&link)
        .with_context(|| format!("Failed to stat {}", link.display()))?;

    Ok(ExecutableInfo {
        pid,
        exe_path,
        identity: ExecutableIdentity::new(meta.dev(), meta.ino()),
    })
}

/// A process instance: the PID plus its start time, so a recycled PID is a
/// different key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessKey {
    pub pid: u32,
    /// Clock ticks after boot, from `/proc/<pid>/stat`.
    pub start_time: u64,
}

/// Every process on the host, skipping kernel threads and ourselves.
pub fn list_processes() -> Result<HashSet<ProcessKey>> {
    let own_pid = std::process::id();
    let mut keys = HashSet::new();

    for p in procfs::process::all_processes().context("Failed to list /proc")? {
        let process = match p {
            Ok(proc) => proc,
            Err(_) => continue,
        };
        let pid = process.pid as u32;
        if pid == own_pid {
            continue;
        }
        // kernel threads have no executable
        if process.exe().is_err() {
            continue;
        }
        let start_time = match process.stat() {
            Ok(stat) => stat.starttime,
            Err(_) => continue,
        };
        keys.insert(ProcessKey { pid, start_time });
    }

    Ok(keys)
}

/// Change in the process table between two scans.
///
/// A PID that was recycled between scans is listed in both `exited` and
/// `started`; exits must be applied first.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProcessDelta {
    pub started: Vec<u32>,
    pub exited: Vec<u32>,
}

/// Remembers the processes seen on the previous scan and reports what changed.
#[derive(Default)]
pub struct ProcessWatcher {
    known: HashSet<ProcessKey>,
}

impl ProcessWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans /proc and returns the processes started and exited since the last poll.
    pub fn poll(&mut self) -> Result<ProcessDelta> {
        let current = list_processes()?;
        Ok(self.update(current))
    }

    pub fn update(&mut self, current: HashSet<ProcessKey>) -> ProcessDelta {
        let mut started: Vec<u32> = current.difference(&self.known).map(|k| k.pid).collect();
        let mut exited: Vec<u32> = self.known.difference(&current).map(|k| k.pid).collect();
        started.sort_unstable();
        exited.sort_unstable();

        if !started.is_empty() || !exited.is_empty() {
            debug!(
                "Process scan: {} started, {} exited",
                started.len(),
                exited.len()
            );
        }

        self.known = current;
        ProcessDelta { started, exited }
    }

    pub fn known(&self) -> usize {
        self.known.len()
    }
}

/// Remote TCP ports of the connections currently owned by a process.
///
/// Socket inodes from `/proc/<pid>/fd` are matched against the TCP tables of
/// the process's network namespace. Listening sockets are skipped.
pub fn remote_ports_for_pid(pid: u32) -> Result<Vec<u16>> {
    let process = Process::new(pid as i32).with_context(|| format!("PID {} not found", pid))?;

    let mut inodes = HashSet::new();
    for fd in process
        .fd()
        .with_context(|| format!("Failed to read fds of PID {}", pid))?
    {
        if let Ok(fd) = fd
            && let FDTarget::Socket(inode) = fd.target
        {
            inodes.insert(inode);
        }
    }
    if inodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut by_inode: HashMap<u64, u16> = HashMap::new();
    let v4 = process.tcp().unwrap_or_default();
    let v6 = process.tcp6().unwrap_or_default();
    for entry in v4.into_iter().chain(v6) {
        let port = entry.remote_address.port();
        if port != 0 {
            by_inode.insert(entry.inode, port);
        }
    }

    Ok(match_ports(&inodes, &by_inode))
}

fn match_ports(inodes: &HashSet<u64>, by_inode: &HashMap<u64, u16>) -> Vec<u16> {
    let mut ports: Vec<u16> = inodes
        .iter()
        .filter_map(|inode| by_inode.get(inode).copied())
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}
