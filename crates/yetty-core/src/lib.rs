//! Card subsystem core for the yetty terminal.
//!
//! Cards are structured inline widgets (plots, images, vector drawings)
//! that a shell child creates by emitting OSC escape sequences and then
//! streams data to through a lock-free shared-memory fabric and an
//! out-of-band RPC channel. This crate is the whole of that subsystem:
//!
//! - [`cards`] / [`resources`] / [`screen`] — the card model, the per-frame
//!   3-loop GPU resource arbitration, and slot + name addressing.
//! - [`osc`] — the escape-sequence control surface (`run`, `ls`, `kill`, ...).
//! - [`rpc`] — the per-terminal Unix-socket msgpack-rpc server, its typed
//!   event/stream channels, and a blocking client.
//! - [`shm`] / [`seqlock`] — the named growable shared-memory region and the
//!   per-allocation seqlock that lets remote writers mutate card buffers
//!   without tearing or blocking the renderer.
//! - [`terminal`] — the per-instance assembly: byte-stream splitting,
//!   RPC pumping and the frame driver, wired with explicit ownership.
//!
//! The GPU upload path (wgpu buffers, atlas texture, shared bind group) is
//! gated behind the `gpu` cargo feature; everything else is plain CPU code
//! and tests without a device.

pub mod cards;
pub mod config;
pub mod error;
pub mod event;
pub mod names;
pub mod osc;
pub mod resources;
pub mod rpc;
pub mod screen;
pub mod seqlock;
pub mod shm;
pub mod terminal;
pub mod workspace;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use error::{Error, Result};
