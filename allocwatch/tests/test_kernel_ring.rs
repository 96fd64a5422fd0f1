//! End-to-end run against the real kernel
//!
//! Needs root, a kernel with BPF ring buffers, and the probe object built
//! with `cargo xtask build-ebpf`, so it only runs when asked for:
//!
//! ```bash
//! sudo -E cargo test -p allocwatch --test test_kernel_ring -- --ignored
//! ```

use std::hint::black_box;
use std::path::Path;
use std::time::{Duration, Instant};

use allocwatch::domain::Pid;
use allocwatch::lifecycle::{Phase, Session};
use allocwatch::preflight::bump_memlock_rlimit;
use allocwatch::probe::AyaProbe;
use allocwatch::resolver::MapsResolver;
use allocwatch_common::AllocEvent;

const PROBE_OBJECT: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/../target/bpfel-unknown-none/release/allocwatch");

/// Allocation entry point the uprobe is attached to; the first argument is
/// the size, as for `malloc`
#[no_mangle]
#[inline(never)]
pub extern "C" fn allocwatch_traced_alloc(size: u64) -> u64 {
    black_box(size)
}

#[tokio::test]
#[ignore] // Needs root and the built probe object
async fn test_traced_calls_arrive_in_order() {
    assert!(
        Path::new(PROBE_OBJECT).exists(),
        "Probe object missing at {PROBE_OBJECT}, run `cargo xtask build-ebpf` first"
    );
    bump_memlock_rlimit().expect("Failed to raise RLIMIT_MEMLOCK");

    let pid = Pid::current();
    let mut session: Session<AyaProbe> = Session::new();
    session.load(AyaProbe::load(Path::new(PROBE_OBJECT)).expect("Failed to load probe")).unwrap();

    let target = session
        .attach(&MapsResolver::new(pid), "allocwatch_traced_alloc", pid)
        .expect("Failed to attach to the test function");
    assert_eq!(target.pid, pid);
    assert!(target.binary_path.is_absolute());

    session.subscribe().expect("Failed to open the ring buffer");
    assert_eq!(session.phase(), Phase::Subscribed);

    for size in 32..=36u64 {
        black_box(allocwatch_traced_alloc(black_box(size)));
    }

    // Only the test function is instrumented, so every event is one of ours
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut events: Vec<AllocEvent> = Vec::new();
    while events.len() < 5 && Instant::now() < deadline {
        session.poll_once(Duration::from_millis(100), &mut events).await.unwrap();
    }

    assert_eq!(events.iter().map(|e| e.size).collect::<Vec<_>>(), vec![32, 33, 34, 35, 36]);
    assert!(events.iter().all(|e| e.pid == u64::from(pid.0)));
    assert_eq!(session.summary().delivered, 5);

    let stats = session.probe_stats().expect("probe counters should be readable");
    assert_eq!(stats.fired, 5);
    assert_eq!(stats.dropped, 0);

    session.close();
    assert_eq!(session.phase(), Phase::Closed);
    assert!(session.target().is_none());
    session.close();
    assert_eq!(session.phase(), Phase::Closed);
}
