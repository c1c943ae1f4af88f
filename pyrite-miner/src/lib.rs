//! Drivers for serial-attached ASIC mining hardware.
//!
//! The crate turns abstract mining work into device wire commands and
//! device events back into share submissions, and owns everything in
//! between: serial connection lifecycle, the polling read loop with
//! desynchronization recovery, a liveness watchdog, and disconnect-tolerant
//! work buffering.
//!
//! The pool protocol lives elsewhere. Whatever owns the pool connection
//! feeds [`work::Work`] into a [`device::DeviceDriver`] and receives
//! solutions through a [`pool::WorkSubmissionSink`].

pub mod asic;
pub mod config;
pub mod device;
pub mod error;
pub mod pool;
pub mod tracing;
pub mod types;
pub mod work;

pub use error::{Error, Result};
