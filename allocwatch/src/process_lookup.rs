//! Resolve `--process <name>` to the PID to trace.
//!
//! A process is named either by its kernel command name (`comm`) or by the
//! file name of its executable. Exact names win over partial ones, so
//! `--process nginx` still picks `nginx` when `nginx-exporter` is running.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::domain::Pid;

/// A traceable process seen while scanning procfs
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    pid: Pid,
    comm: String,
    exe_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Closeness {
    Partial,
    Exact,
}

impl Candidate {
    fn closeness(&self, wanted: &str) -> Option<Closeness> {
        let base = Path::new(wanted).file_name().and_then(|n| n.to_str()).unwrap_or(wanted);
        let names = [self.comm.as_str(), self.exe_name.as_str()];

        if names.contains(&base) {
            Some(Closeness::Exact)
        } else if names.iter().any(|n| n.contains(wanted)) {
            Some(Closeness::Partial)
        } else {
            None
        }
    }
}

/// The PID of the one process called `name`
///
/// allocwatch never matches itself.
///
/// # Errors
/// Returns an error if procfs cannot be read, or if no process or more than
/// one equally close process carries the name
pub fn find_pid_by_name(name: &str) -> Result<Pid> {
    pick(name, scan_procfs()?)
}

fn pick(name: &str, candidates: Vec<Candidate>) -> Result<Pid> {
    let mut scored: Vec<(Closeness, Candidate)> =
        candidates.into_iter().filter_map(|c| c.closeness(name).map(|s| (s, c))).collect();

    let Some(best) = scored.iter().map(|(s, _)| *s).max() else {
        bail!(
            "No process matching '{name}' found.\n\
             List candidates with: pgrep -a {name}"
        );
    };
    scored.retain(|(s, _)| *s == best);

    if let [(_, only)] = scored.as_slice() {
        return Ok(only.pid);
    }

    let listing: Vec<String> =
        scored.iter().map(|(_, c)| format!("  {} {}", c.pid.0, c.comm)).collect();
    bail!(
        "'{name}' is ambiguous, {} processes match:\n{}\n\n\
         Pick one with: allocwatch --pid <PID>",
        scored.len(),
        listing.join("\n")
    )
}

fn scan_procfs() -> Result<Vec<Candidate>> {
    let own = Pid::current();
    let entries = fs::read_dir("/proc").context("Failed to read /proc")?;

    Ok(entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok().map(Pid))
        .filter(|&pid| pid != own)
        .filter_map(read_candidate)
        .collect())
}

/// `None` for kernel threads, processes that exited mid-scan, and processes
/// we may not inspect
fn read_candidate(pid: Pid) -> Option<Candidate> {
    let exe = fs::read_link(format!("/proc/{}/exe", pid.0)).ok()?;
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid.0)).ok()?;

    Some(Candidate {
        pid,
        comm: comm_from_stat(&stat)?.to_string(),
        exe_name: exe.file_name()?.to_string_lossy().into_owned(),
    })
}

/// `comm` from a `/proc/<pid>/stat` line: `pid (comm) state ...`
///
/// `comm` may itself contain parentheses, so it runs to the last `)`.
fn comm_from_stat(stat: &str) -> Option<&str> {
    let (_, rest) = stat.split_once('(')?;
    let (comm, _) = rest.rsplit_once(')')?;
    Some(comm)
}
