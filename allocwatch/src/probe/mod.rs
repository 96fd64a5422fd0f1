//! # Probe Program and Attachment
//!
//! A probe program is loaded once, attached to exactly one
//! (binary path, file offset, pid) target, and exposes the consumer end of
//! its event ring.
//!
//! ## Release order
//!
//! The binding is released through the program that created it
//! ([`ProbeProgram::detach`]), so a program cannot be destroyed while one of
//! its attachments is still being torn down.
//!
//! ## Implementations
//!
//! - [`AyaProbe`]: the compiled eBPF object, attached as a uprobe

pub mod diagnostics;
pub mod ebpf_setup;

use std::fmt;
use std::path::PathBuf;

use crate::domain::{AttachError, FileOffset, Pid, TransportError};
use crate::transport::EventSource;

pub use diagnostics::{log_probe_stats, ProbeStats};
pub use ebpf_setup::{init_ebpf_logger, load_ebpf_program, AyaProbe};

/// Where a probe is bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachTarget {
    pub binary_path: PathBuf,
    pub offset: FileOffset,
    pub pid: Pid,
}

impl fmt::Display for AttachTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} ({})", self.binary_path.display(), self.offset, self.pid)
    }
}

/// A live binding of a probe to its target
#[derive(Debug)]
pub struct Attachment<L> {
    pub link: L,
    pub target: AttachTarget,
}

/// A loaded probe program
pub trait ProbeProgram {
    /// Handle identifying one attachment of this program
    type Link;
    /// Consumer end of the program's event ring
    type Transport: EventSource;

    /// Bind the probe to `target`
    ///
    /// # Errors
    /// Returns an error if the program is missing, fails to load, or the
    /// kernel rejects the target
    fn attach(&mut self, target: &AttachTarget) -> Result<Self::Link, AttachError>;

    /// Release a binding created by [`ProbeProgram::attach`]
    ///
    /// # Errors
    /// Returns an error if the binding could not be released
    fn detach(&mut self, link: Self::Link) -> Result<(), AttachError>;

    /// Open the program's event ring for reading
    ///
    /// # Errors
    /// Returns an error if the ring is missing or cannot be subscribed to
    fn open_transport(&mut self) -> Result<Self::Transport, TransportError>;

    /// Probe-side counters, if the program keeps any
    fn stats(&self) -> Option<ProbeStats> {
        None
    }
}
