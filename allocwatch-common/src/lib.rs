//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines the record layout and constants shared between the kernel-side
//! uprobe and userspace. All types use `#[repr(C)]` for consistent memory
//! layout across the kernel/userspace boundary.
//!
//! ## Key Types
//!
//! - [`AllocEvent`] - One record per traced call, passed via ring buffer

#![no_std]

// ============================================================================
// Constants
// ============================================================================

/// Size of the `EVENTS` ring buffer in bytes (256 KiB)
///
/// Must be a power of two and a multiple of the page size, as required by
/// `BPF_MAP_TYPE_RINGBUF`.
pub const RING_BUF_BYTES: u32 = 256 * 1024;

/// Name of the ring buffer map inside the eBPF object
pub const EVENTS_MAP: &str = "EVENTS";

/// Name of the probe statistics map inside the eBPF object
pub const STATS_MAP: &str = "PROBE_STATS";

/// Name of the uprobe program inside the eBPF object
pub const PROBE_PROGRAM: &str = "handle_alloc";

/// `PROBE_STATS` index: number of times the probe fired
pub const STAT_FIRED: u32 = 0;

/// `PROBE_STATS` index: number of events dropped because the ring buffer was full
pub const STAT_DROPPED: u32 = 1;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Event sent from eBPF to userspace via ring buffer
///
/// **Memory Layout**: two native-endian `u64` fields, no padding (16 bytes)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocEvent {
    /// Process ID (TGID in Linux terms) of the caller
    pub pid: u64,

    /// First argument of the traced function (requested allocation size)
    pub size: u64,
}

impl AllocEvent {
    /// Encoded size of one record in bytes
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Encode into the fixed wire layout (`pid` then `size`, native endian)
    #[must_use]
    pub fn to_ne_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&self.pid.to_ne_bytes());
        out[8..].copy_from_slice(&self.size.to_ne_bytes());
        out
    }

    /// Decode from the fixed wire layout
    ///
    /// Returns `None` when `bytes` is shorter than [`AllocEvent::SIZE`].
    /// Only the first [`AllocEvent::SIZE`] bytes are read.
    #[must_use]
    pub fn from_ne_bytes(bytes: &[u8]) -> Option<Self> {
        let pid = bytes.get(..8)?;
        let size = bytes.get(8..Self::SIZE)?;
        let mut pid_buf = [0u8; 8];
        let mut size_buf = [0u8; 8];
        pid_buf.copy_from_slice(pid);
        size_buf.copy_from_slice(size);
        Some(Self { pid: u64::from_ne_bytes(pid_buf), size: u64::from_ne_bytes(size_buf) })
    }
}
