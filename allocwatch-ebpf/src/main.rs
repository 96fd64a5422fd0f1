//! # eBPF Kernel-Side Instrumentation
//!
//! Uprobe that runs inside the kernel every time the traced function is
//! entered in the target process, and publishes one [`AllocEvent`] per call.
//!
//! ## Programs
//!
//! - **Uprobe**: `handle_alloc` - reads the first argument and the caller's TGID
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (256KB) for the event stream
//! - `PROBE_STATS` - Fired/dropped counters for diagnostics
//!
//! ## Build
//!
//! Always compiled in release mode (debug includes incompatible formatting code):
//! ```bash
//! cargo xtask build-ebpf
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use core::sync::atomic::{AtomicU64, Ordering};

use allocwatch_common::{AllocEvent, RING_BUF_BYTES, STAT_DROPPED, STAT_FIRED};
use aya_ebpf::{
    helpers::bpf_get_current_pid_tgid,
    macros::{map, uprobe},
    maps::{Array, RingBuf},
    programs::ProbeContext,
};
use aya_log_ebpf::warn;

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Ring buffer for sending events to userspace (lock-free, single consumer)
///
/// - **Size**: 256KB
/// - **Overflow**: `reserve` fails and the event is dropped
/// - **Usage**: Kernel writes with `EVENTS.reserve()` + `submit()`, userspace reads with `ring_buf.next()`
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_BYTES, 0);

/// Array: stat index → counter, zeroed at load time
///
/// - **Index 0** (`STAT_FIRED`): probe invocations
/// - **Index 1** (`STAT_DROPPED`): events lost because `EVENTS` was full
///
/// Shared by every CPU, so counters are only ever bumped atomically.
#[map]
static PROBE_STATS: Array<u64> = Array::with_max_entries(2, 0);

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// Hook: entry of the traced allocation function (e.g. libc `malloc`)
#[uprobe]
pub fn handle_alloc(ctx: ProbeContext) -> u32 {
    match try_handle_alloc(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_handle_alloc(ctx: &ProbeContext) -> Result<(), i64> {
    bump_stat(STAT_FIRED);

    // First parameter (rdi on x86_64, x0 on aarch64)
    let Some(size) = ctx.arg::<u64>(0) else {
        warn!(ctx, "cannot read the size argument");
        return Err(1);
    };
    let pid = unsafe { bpf_get_current_pid_tgid() } >> 32;

    // Reserve/fill/commit. A failed reservation means the buffer is full:
    // drop this event, count it, and return without error. Userspace reports
    // the total at the end of the session.
    let Some(mut entry) = EVENTS.reserve::<AllocEvent>(0) else {
        bump_stat(STAT_DROPPED);
        return Ok(());
    };

    entry.write(AllocEvent { pid, size });
    entry.submit(0);

    Ok(())
}

/// Atomically increment a `PROBE_STATS` counter
///
/// The add's result must stay unused so it lowers to `BPF_XADD`.
fn bump_stat(index: u32) {
    if let Some(slot) = PROBE_STATS.get_ptr_mut(index) {
        unsafe { AtomicU64::from_ptr(slot) }.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
