//! # allocwatch - eBPF Allocation Tracer
//!
//! allocwatch attaches a uprobe to an allocation function (`malloc` by
//! default) in a running process and prints the requested size of every
//! call, as seen from inside the kernel.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Traced Process                              │
//! │                   malloc(size) ...                              │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ uprobe on function entry
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  eBPF Probe (Kernel)                            │
//! │  handle_alloc: reserve → write {pid, size} → commit             │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ EVENTS ring buffer
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   allocwatch (This Crate)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  Resolver    │──▶│   Probe      │   │  Transport   │         │
//! │  │ (addr→offset)│   │  (attach)    │   │   (poll)     │         │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘         │
//! │                                               │ codec           │
//! │                                               ▼                 │
//! │                                        ┌──────────────┐         │
//! │                                        │    Sink      │         │
//! │                                        │  (console)   │         │
//! │                                        └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`lifecycle::Session`] owns the loaded program, the attachment and the
//! transport, and drives them in order.
//!
//! ## Module Structure
//!
//! - [`resolver`]: turn a symbol name into a binary path and file offset
//! - [`probe`]: load the eBPF object and attach/detach its uprobe
//! - [`transport`]: consume the ring buffer (kernel or in-process)
//! - [`codec`]: fixed 16-byte event layout
//! - [`lifecycle`]: setup order, poll loop, cancellation and teardown
//! - [`sink`]: event output
//! - [`preflight`]: system requirement checks before loading
//! - [`process_lookup`]: find a target process by name
//! - [`cli`]: command-line arguments
//! - [`domain`]: newtypes and error types
//!
//! ## Key Concepts
//!
//! - **Uprobes** attach by binary path + file offset, so runtime addresses
//!   have to be translated back: `offset = address - load base`
//! - **Ring Buffer**: bounded SPSC queue; a full buffer drops events in the
//!   probe, never blocks the traced process

pub mod cli;
pub mod codec;
pub mod domain;
pub mod lifecycle;
pub mod preflight;
pub mod probe;
pub mod process_lookup;
pub mod resolver;
pub mod sink;
pub mod transport;
