//! Structured error types for allocwatch
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Startup failures (`ResolutionError`, `AttachError`, `TransportError`) are
//! fatal; `ShortRecordError` only ever causes one record to be skipped.

use super::types::{FileOffset, Pid, VirtAddr};
use crate::lifecycle::Phase;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("Symbol {0} not found in any loaded module")]
    SymbolNotFound(String),

    #[error("Symbol name {0:?} contains a NUL byte")]
    InvalidSymbolName(String),

    #[error("Could not determine the module containing {symbol} at {addr}")]
    ModuleUnknown { symbol: String, addr: VirtAddr },

    #[error("Address {addr} lies below module load base {base}")]
    AddressBelowBase { addr: VirtAddr, base: VirtAddr },

    #[error("Failed to read /proc/{0}/maps")]
    MemoryMapsUnreadable(u32, #[source] std::io::Error),

    #[error("Module {binary} is not mapped in process {pid}")]
    ModuleNotMapped { pid: Pid, binary: PathBuf },

    #[error("Failed to read ELF symbols from {path}: {error}")]
    ElfUnreadable { path: PathBuf, error: String },
}

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Probe program {0} not found in eBPF object")]
    ProgramNotFound(String),

    #[error("Failed to load probe program {program}: {error}")]
    LoadFailed { program: String, error: String },

    #[error("Failed to attach {probe} to {binary}{offset} for {pid}: {error}")]
    Rejected { probe: String, binary: PathBuf, offset: FileOffset, pid: Pid, error: String },

    #[error("Failed to detach {probe}: {error}")]
    DetachFailed { probe: String, error: String },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Ring buffer map {0} not found")]
    MapNotFound(String),

    #[error("Ring buffer map {name} is unusable: {error}")]
    InvalidMap { name: String, error: String },

    #[error("Failed to register ring buffer for readiness")]
    Register(#[source] std::io::Error),

    #[error("Ring buffer poll failed")]
    Poll(#[source] std::io::Error),

    #[error("Ring buffer producer is gone")]
    Closed,
}

/// A drained record too short to hold one event
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Short record: {len} bytes, expected at least {expected}")]
pub struct ShortRecordError {
    pub len: usize,
    pub expected: usize,
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Session is {actual:?}, expected {expected:?}")]
    InvalidPhase { expected: Phase, actual: Phase },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_error_display() {
        let err = ResolutionError::SymbolNotFound("malloc".to_string());
        assert_eq!(err.to_string(), "Symbol malloc not found in any loaded module");
    }

    #[test]
    fn test_attach_error_display() {
        let err = AttachError::Rejected {
            probe: "handle_alloc".to_string(),
            binary: PathBuf::from("/usr/lib/libc.so.6"),
            offset: FileOffset(0x9a0),
            pid: Pid(1234),
            error: "No such process".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("handle_alloc"));
        assert!(msg.contains("/usr/lib/libc.so.6+0x9a0"));
        assert!(msg.contains("PID:1234"));
    }

    #[test]
    fn test_lifecycle_error_is_transparent() {
        let err = LifecycleError::from(TransportError::Closed);
        assert_eq!(err.to_string(), "Ring buffer producer is gone");
    }
}
