//! Kernel ring buffer consumer
//!
//! Reads the probe's `EVENTS` map through aya's memory-mapped `RingBuf`.
//! The map's file descriptor becomes readable when the kernel producer
//! commits, so readiness is awaited through tokio's `AsyncFd`.

use std::time::Duration;

use allocwatch_common::EVENTS_MAP;
use aya::maps::{MapData, RingBuf};
use aya::Ebpf;
use tokio::io::unix::AsyncFd;
use tokio::time::Instant;

use super::EventSource;
use crate::domain::TransportError;

/// Open consumer end of the probe's ring buffer
pub struct KernelRingBuf {
    fd: AsyncFd<RingBuf<MapData>>,
}

impl KernelRingBuf {
    /// Take the `EVENTS` map out of the loaded object and subscribe to it
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns an error if the map is missing, is not a ring buffer, or cannot
    /// be registered with the reactor
    pub fn open(bpf: &mut Ebpf) -> Result<Self, TransportError> {
        let map = bpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| TransportError::MapNotFound(EVENTS_MAP.to_string()))?;
        let ring = RingBuf::try_from(map).map_err(|e| TransportError::InvalidMap {
            name: EVENTS_MAP.to_string(),
            error: e.to_string(),
        })?;
        let fd = AsyncFd::new(ring).map_err(TransportError::Register)?;
        Ok(Self { fd })
    }
}

fn drain<F: FnMut(&[u8])>(ring: &mut RingBuf<MapData>, on_record: &mut F) -> usize {
    let mut drained = 0;
    while let Some(item) = ring.next() {
        on_record(&*item);
        drained += 1;
    }
    drained
}

impl EventSource for KernelRingBuf {
    async fn poll<F>(&mut self, timeout: Duration, mut on_record: F) -> Result<usize, TransportError>
    where
        F: FnMut(&[u8]),
    {
        let deadline = Instant::now() + timeout;

        // Records committed since the last wakeup are already visible
        let drained = drain(self.fd.get_mut(), &mut on_record);
        if drained > 0 {
            return Ok(drained);
        }

        loop {
            let Ok(ready) = tokio::time::timeout_at(deadline, self.fd.readable_mut()).await else {
                return Ok(0);
            };
            let mut guard = ready.map_err(TransportError::Poll)?;
            // Cleared before draining, so a commit racing the drain raises it again
            guard.clear_ready();
            let drained = drain(guard.get_inner_mut(), &mut on_record);

            // Readiness left over from an earlier drain carries no records
            if drained > 0 {
                return Ok(drained);
            }
        }
    }
}
