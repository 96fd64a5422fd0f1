//! Event output
//!
//! Decoded events are handed to an [`EventSink`]. The console printer
//! writes one line per event in the form `malloc(pid=1234, size=32)`,
//! labelled with the traced function's name.

use std::io::Write;

use allocwatch_common::AllocEvent;
use log::warn;

use crate::lifecycle::PollSummary;
use crate::probe::ProbeStats;

/// Receives decoded events in arrival order
pub trait EventSink {
    fn deliver(&mut self, event: &AllocEvent);
}

impl EventSink for Vec<AllocEvent> {
    fn deliver(&mut self, event: &AllocEvent) {
        self.push(*event);
    }
}

/// Writes one line per event
pub struct ConsolePrinter<W: Write> {
    out: W,
    label: String,
    write_failed: bool,
}

impl<W: Write> ConsolePrinter<W> {
    pub fn new(out: W, label: impl Into<String>) -> Self {
        Self { out, label: label.into(), write_failed: false }
    }
}

impl<W: Write> EventSink for ConsolePrinter<W> {
    fn deliver(&mut self, event: &AllocEvent) {
        let written = writeln!(self.out, "{}(pid={}, size={})", self.label, event.pid, event.size)
            .and_then(|()| self.out.flush());

        // Keep polling even if stdout went away; say so once
        if let Err(e) = written {
            if !self.write_failed {
                warn!("Failed to write event: {e}");
                self.write_failed = true;
            }
        }
    }
}

/// Swallows events (`--quiet`); the session summary still counts them
#[derive(Debug, Default)]
pub struct Discard;

impl EventSink for Discard {
    fn deliver(&mut self, _event: &AllocEvent) {}
}

/// Display end-of-session totals
pub fn display_summary(summary: &PollSummary, probe: Option<&ProbeStats>) {
    eprintln!("stats: {summary}");
    if let Some(probe) = probe {
        eprintln!("probe: {probe}");
    }
}
