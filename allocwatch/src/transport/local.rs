//! In-process ring buffer
//!
//! A userspace SPSC ring following the same record rules as the kernel's
//! `BPF_MAP_TYPE_RINGBUF`:
//!
//! - every record starts with an 8-byte header holding its length plus a
//!   BUSY bit (reserved, not yet committed) and a DISCARD bit (abandoned)
//! - records are padded to 8 bytes and laid out back to back
//! - producer and consumer positions only ever grow; the buffer index is the
//!   position masked by the (power of two) capacity
//!
//! The consumer stops at the first BUSY record and steps over DISCARD ones,
//! so a record is either fully visible or not visible at all. The buffer is
//! an array of `AtomicU64` words, which keeps both sides free of locks and
//! of `unsafe`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::EventSource;
use crate::domain::TransportError;

const WORD: usize = 8;
const BUSY_BIT: u64 = 1 << 63;
const DISCARD_BIT: u64 = 1 << 62;
const LEN_MASK: u64 = DISCARD_BIT - 1;

/// Smallest capacity: one header word plus one data word
pub const MIN_CAPACITY: usize = 2 * WORD;

/// Bytes a record of `len` payload bytes occupies in the ring
#[must_use]
pub const fn record_footprint(len: usize) -> usize {
    WORD + len.div_ceil(WORD) * WORD
}

fn record_words(len: usize) -> u64 {
    (record_footprint(len) / WORD) as u64
}

struct Shared {
    words: Box<[AtomicU64]>,
    mask: u64,
    producer_pos: AtomicU64,
    consumer_pos: AtomicU64,
    producer_alive: AtomicBool,
    notify: Notify,
}

impl Shared {
    #[allow(clippy::cast_possible_truncation)]
    fn word(&self, pos: u64) -> &AtomicU64 {
        &self.words[(pos & self.mask) as usize]
    }

    fn capacity_words(&self) -> u64 {
        self.words.len() as u64
    }
}

/// Create a ring of at least `capacity` bytes
///
/// The capacity is rounded up to a power of two, and to at least
/// [`MIN_CAPACITY`].
#[must_use]
pub fn channel(capacity: usize) -> (Producer, Consumer) {
    let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
    let words: Box<[AtomicU64]> = (0..capacity / WORD).map(|_| AtomicU64::new(0)).collect();
    let shared = Arc::new(Shared {
        mask: words.len() as u64 - 1,
        words,
        producer_pos: AtomicU64::new(0),
        consumer_pos: AtomicU64::new(0),
        producer_alive: AtomicBool::new(true),
        notify: Notify::new(),
    });

    (
        Producer { shared: Arc::clone(&shared), scratch: Vec::new(), dropped: 0 },
        Consumer { shared, scratch: Vec::new() },
    )
}

/// Writing end of the ring
pub struct Producer {
    shared: Arc<Shared>,
    scratch: Vec<u8>,
    dropped: u64,
}

impl Producer {
    /// Ring capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.words.len() * WORD
    }

    /// Number of reservations refused because the ring was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Claim `len` bytes, or `None` if they do not fit right now
    pub fn reserve(&mut self, len: usize) -> Option<Slot<'_>> {
        // Anything larger than the whole ring can never fit, and sizing it
        // could overflow
        if len >= self.capacity() {
            self.dropped += 1;
            return None;
        }

        let shared = &self.shared;
        let total = record_words(len);
        let prod = shared.producer_pos.load(Ordering::Relaxed);
        let cons = shared.consumer_pos.load(Ordering::Acquire);

        if prod - cons + total > shared.capacity_words() {
            self.dropped += 1;
            return None;
        }

        // Header first, then advance the position so the consumer never sees
        // a record without its BUSY header
        shared.word(prod).store(BUSY_BIT | len as u64, Ordering::Relaxed);
        shared.producer_pos.store(prod + total, Ordering::Release);

        self.scratch.clear();
        self.scratch.resize(len, 0);
        Some(Slot { producer: self, pos: prod, len, published: false })
    }

    /// Reserve, fill and commit in one go; `false` means the record was dropped
    pub fn try_send(&mut self, bytes: &[u8]) -> bool {
        let Some(mut slot) = self.reserve(bytes.len()) else {
            return false;
        };
        slot.bytes_mut().copy_from_slice(bytes);
        slot.commit();
        true
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.shared.producer_alive.store(false, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

/// Reserved space in the ring
///
/// Dropping a slot without calling [`Slot::commit`] discards it.
pub struct Slot<'a> {
    producer: &'a mut Producer,
    pos: u64,
    len: usize,
    published: bool,
}

impl Slot<'_> {
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.producer.scratch[..self.len]
    }

    /// Make the record visible to the consumer
    pub fn commit(mut self) {
        self.publish(false);
    }

    /// Give the space back without exposing the record
    pub fn discard(mut self) {
        self.publish(true);
    }

    fn publish(&mut self, discard: bool) {
        let shared = &self.producer.shared;

        if !discard {
            for (i, chunk) in self.producer.scratch[..self.len].chunks(WORD).enumerate() {
                let mut word = [0u8; WORD];
                word[..chunk.len()].copy_from_slice(chunk);
                shared.word(self.pos + 1 + i as u64).store(u64::from_ne_bytes(word), Ordering::Relaxed);
            }
        }

        let header = if discard { DISCARD_BIT } else { 0 } | self.len as u64;
        shared.word(self.pos).store(header, Ordering::Release);
        self.published = true;
        shared.notify.notify_one();
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.publish(true);
        }
    }
}

/// Reading end of the ring
pub struct Consumer {
    shared: Arc<Shared>,
    scratch: Vec<u8>,
}

impl Consumer {
    fn drain<F: FnMut(&[u8])>(&mut self, on_record: &mut F) -> usize {
        let shared = &self.shared;
        let mut cons = shared.consumer_pos.load(Ordering::Relaxed);
        let mut drained = 0;

        while cons < shared.producer_pos.load(Ordering::Acquire) {
            let header = shared.word(cons).load(Ordering::Acquire);
            if header & BUSY_BIT != 0 {
                break;
            }

            #[allow(clippy::cast_possible_truncation)]
            let len = (header & LEN_MASK) as usize;
            if header & DISCARD_BIT == 0 {
                self.scratch.clear();
                for i in 0..record_words(len) - 1 {
                    let word = shared.word(cons + 1 + i).load(Ordering::Relaxed);
                    self.scratch.extend_from_slice(&word.to_ne_bytes());
                }
                self.scratch.truncate(len);
                on_record(&self.scratch);
                drained += 1;
            }

            // Hand the space back only after the record has been copied out
            cons += record_words(len);
            shared.consumer_pos.store(cons, Ordering::Release);
        }

        drained
    }
}

impl EventSource for Consumer {
    async fn poll<F>(&mut self, timeout: Duration, mut on_record: F) -> Result<usize, TransportError>
    where
        F: FnMut(&[u8]),
    {
        let deadline = Instant::now() + timeout;

        loop {
            // Sampled before draining: once the producer is gone, everything
            // it committed is visible to this drain
            let alive = self.shared.producer_alive.load(Ordering::Acquire);
            let drained = self.drain(&mut on_record);
            if drained > 0 {
                return Ok(drained);
            }
            if !alive {
                return Err(TransportError::Closed);
            }
            if tokio::time::timeout_at(deadline, self.shared.notify.notified()).await.is_err() {
                return Ok(0);
            }
        }
    }
}
