use std::fmt;

use allocwatch_common::{STATS_MAP, STAT_DROPPED, STAT_FIRED};
use anyhow::{Context, Result};
use aya::maps::Array;
use aya::Ebpf;
use log::{info, warn};

/// Probe-side counters from the `PROBE_STATS` map
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStats {
    /// Times the probe ran
    pub fired: u64,
    /// Events lost because the ring buffer was full
    pub dropped: u64,
}

impl fmt::Display for ProbeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fired {} times, dropped {} events", self.fired, self.dropped)
    }
}

/// Read the probe's counters
///
/// `PROBE_STATS` is an array, so every counter exists from load time and
/// starts at zero.
///
/// # Errors
/// Returns an error if the `PROBE_STATS` map cannot be accessed
pub fn read_probe_stats(bpf: &Ebpf) -> Result<ProbeStats> {
    let map: Array<_, u64> = Array::try_from(
        bpf.map(STATS_MAP).with_context(|| format!("{STATS_MAP} map not found"))?,
    )?;

    Ok(ProbeStats {
        fired: map.get(&STAT_FIRED, 0).context("Failed to read fired counter")?,
        dropped: map.get(&STAT_DROPPED, 0).context("Failed to read dropped counter")?,
    })
}

/// Log probe counters at the end of a session
///
/// Drops are reported here only; the consumer never sees them.
pub fn log_probe_stats(stats: Option<ProbeStats>) {
    match stats {
        Some(stats) if stats.dropped > 0 => {
            warn!("Probe {stats} (ring buffer was full)");
        }
        Some(stats) => info!("Probe {stats}"),
        None => {}
    }
}
