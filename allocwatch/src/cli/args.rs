//! CLI argument definitions

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::Pid;
use crate::lifecycle::SessionConfig;
use crate::process_lookup::find_pid_by_name;

#[derive(Parser, Debug)]
#[command(
    name = "allocwatch",
    about = "Trace allocation sizes with an eBPF uprobe",
    after_help = "\
EXAMPLES:
    sudo allocwatch                              Trace allocwatch's own mallocs
    sudo allocwatch my-app                       Find process by name
    sudo allocwatch --pid 1234 --symbol calloc   Explicit PID, other function"
)]
pub struct Args {
    /// Process name to trace (default: allocwatch itself)
    #[arg(value_name = "PROCESS", conflicts_with = "pid")]
    pub process: Option<String>,

    /// Process ID to trace
    #[arg(short, long)]
    pub pid: Option<u32>,

    /// Function to probe; its first argument is reported as the size
    #[arg(short, long, default_value = "malloc")]
    pub symbol: String,

    /// Only look for the function in this module
    #[arg(short, long, value_name = "PATH")]
    pub binary: Option<PathBuf>,

    /// Compiled eBPF probe object
    #[arg(long, value_name = "PATH", default_value = "target/bpfel-unknown-none/release/allocwatch")]
    pub probe_object: PathBuf,

    /// How long each poll waits for events, in milliseconds
    #[arg(long, default_value = "250", value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_interval_ms: u64,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Allocations made right after subscribing when tracing allocwatch itself
    #[arg(long, default_value = "5")]
    pub warmup: usize,

    /// Don't print individual events
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Resolve the target process and validate the rest
    ///
    /// # Errors
    /// Returns an error if the process cannot be found or a path is invalid
    pub fn into_config(self) -> Result<SessionConfig> {
        let pid = match (&self.process, self.pid) {
            (Some(name), _) => find_pid_by_name(name)?,
            (None, Some(pid)) => Pid(pid),
            (None, None) => Pid::current(),
        };

        let binary = self
            .binary
            .map(|path| {
                std::fs::canonicalize(&path)
                    .with_context(|| format!("Failed to resolve path: {}", path.display()))
            })
            .transpose()?;

        if self.symbol.is_empty() {
            bail!("--symbol must not be empty");
        }

        Ok(SessionConfig {
            pid,
            symbol: self.symbol,
            binary,
            probe_object: self.probe_object,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            duration: (self.duration > 0).then(|| Duration::from_secs(self.duration)),
            warmup: self.warmup,
            quiet: self.quiet,
        })
    }
}
