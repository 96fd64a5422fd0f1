//! # eBPF Program Loading and Attachment
//!
//! Loads the compiled probe object and binds its uprobe to the resolved
//! allocation function.
//!
//! ## Functions
//!
//! - [`load_ebpf_program()`] - Load eBPF bytecode from the build output
//! - [`init_ebpf_logger()`] - Forward probe-side log records to `log`
//! - [`AyaProbe`] - [`ProbeProgram`] over the loaded object
//!
//! ## Attachment Points
//!
//! - **Uprobe**: `handle_alloc` on the traced function's entry, scoped to one
//!   process

use std::path::Path;

use allocwatch_common::PROBE_PROGRAM;
use anyhow::{Context, Result};
use aya::programs::uprobe::UProbeLinkId;
use aya::programs::UProbe;
use aya::Ebpf;
use aya_log::EbpfLogger;
use log::{debug, info, warn};

use super::diagnostics::read_probe_stats;
use super::{AttachTarget, ProbeProgram, ProbeStats};
use crate::domain::{AttachError, TransportError};
use crate::transport::KernelRingBuf;

/// Load the eBPF program binary
///
/// The object is read at runtime rather than embedded, so the userspace
/// crate builds without a prior `cargo xtask build-ebpf`. Only release
/// builds of the probe are usable: debug builds pull in formatting code the
/// verifier rejects.
///
/// # Errors
/// Returns an error if the eBPF program binary cannot be read or loaded
pub fn load_ebpf_program(path: &Path) -> Result<Ebpf> {
    let bpf = Ebpf::load_file(path)
        .with_context(|| format!("Failed to load eBPF object {}", path.display()))?;
    debug!("Loaded eBPF object {}", path.display());
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// The loaded allocation probe
pub struct AyaProbe {
    bpf: Ebpf,
}

impl AyaProbe {
    /// Load the probe object and hook up its logger
    ///
    /// # Errors
    /// Returns an error if the object cannot be loaded
    pub fn load(path: &Path) -> Result<Self> {
        let mut bpf = load_ebpf_program(path)?;
        init_ebpf_logger(&mut bpf);
        Ok(Self { bpf })
    }

    fn uprobe(&mut self) -> Result<&mut UProbe, AttachError> {
        self.bpf
            .program_mut(PROBE_PROGRAM)
            .ok_or_else(|| AttachError::ProgramNotFound(PROBE_PROGRAM.to_string()))?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| AttachError::LoadFailed {
                program: PROBE_PROGRAM.to_string(),
                error: e.to_string(),
            })
    }
}

impl ProbeProgram for AyaProbe {
    type Link = UProbeLinkId;
    type Transport = KernelRingBuf;

    fn attach(&mut self, target: &AttachTarget) -> Result<Self::Link, AttachError> {
        let program = self.uprobe()?;
        program.load().map_err(|e| AttachError::LoadFailed {
            program: PROBE_PROGRAM.to_string(),
            error: e.to_string(),
        })?;

        // Attach by offset: the symbol was already resolved, and the kernel
        // only needs its position in the file
        let link = program
            .attach(None, target.offset.0, &target.binary_path, Some(target.pid.into()))
            .map_err(|e| AttachError::Rejected {
                probe: PROBE_PROGRAM.to_string(),
                binary: target.binary_path.clone(),
                offset: target.offset,
                pid: target.pid,
                error: e.to_string(),
            })?;

        info!("✓ Attached uprobe {PROBE_PROGRAM} at {target}");
        Ok(link)
    }

    fn detach(&mut self, link: Self::Link) -> Result<(), AttachError> {
        self.uprobe()?.detach(link).map_err(|e| AttachError::DetachFailed {
            probe: PROBE_PROGRAM.to_string(),
            error: e.to_string(),
        })?;
        debug!("Detached uprobe {PROBE_PROGRAM}");
        Ok(())
    }

    fn open_transport(&mut self) -> Result<Self::Transport, TransportError> {
        KernelRingBuf::open(&mut self.bpf)
    }

    fn stats(&self) -> Option<ProbeStats> {
        match read_probe_stats(&self.bpf) {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!("Probe counters unavailable: {e:#}");
                None
            }
        }
    }
}
