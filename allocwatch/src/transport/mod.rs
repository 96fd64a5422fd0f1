//! # Ring Buffer Transport
//!
//! Bounded single-producer/single-consumer byte channel between the probe
//! and userspace.
//!
//! ## Producer protocol
//!
//! 1. `reserve(size)` claims space, or fails when the buffer is full (the
//!    event is dropped, nobody is told)
//! 2. the slot is filled with the encoded event
//! 3. `commit` publishes it atomically; a slot that is never committed is
//!    skipped by the consumer and never exposed
//!
//! ## Consumer protocol
//!
//! [`EventSource::poll`] waits up to a timeout, then drains every committed
//! record in commit order.
//!
//! ## Implementations
//!
//! - [`KernelRingBuf`]: the probe's `BPF_MAP_TYPE_RINGBUF` map
//! - [`local`]: in-process ring with the same record rules

pub mod kernel;
pub mod local;

use std::time::Duration;

use crate::domain::TransportError;

pub use kernel::KernelRingBuf;

/// Consumer end of a ring buffer
#[allow(async_fn_in_trait)]
pub trait EventSource {
    /// Wait up to `timeout` for records, then drain all committed records,
    /// calling `on_record` for each in arrival order
    ///
    /// Returns the number of records drained (0 on timeout).
    ///
    /// # Errors
    /// Returns an error if the transport is no longer valid
    async fn poll<F>(&mut self, timeout: Duration, on_record: F) -> Result<usize, TransportError>
    where
        F: FnMut(&[u8]);
}
