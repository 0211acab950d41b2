//! Test utilities: loopback backends and frame builders.
//!
//! Public so integration tests (and embedders writing their own) can
//! drive the device layer without real hardware.

pub mod loopback;
pub mod packets;

pub use loopback::{LoopbackBackend, LoopbackQueue, TxLog};
pub use packets::{eth_frame, ipv4_frame};
