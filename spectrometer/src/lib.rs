//! Control software for the high-z digital spectrometer.
//!
//! The instrument is an RFSoC-based FPGA spectrometer running a KATCP
//! control server. This crate owns the full acquisition loop:
//!
//! 1. [`discovery`] finds a reachable address for the board (hostname,
//!    hardcoded link-local IPv4, then IPv6 neighbor discovery).
//! 2. [`fpga`] programs the bitstream, brings up the RFDC data converters
//!    and sample clocks, and exposes register access.
//! 3. [`acquire`] synchronizes with the on-board accumulation counter and
//!    reassembles per-channel accumulator memory into spectra.
//! 4. [`switch`] drives the three-line GPIO calibration switch through its
//!    eight states.
//! 5. [`sequencer`] walks the calibration/observation state machine and
//!    hands each record to [`session`] for persistence.
//!
//! Everything is single-threaded and blocking; the only pacing comes from
//! the hardware accumulation period itself.

pub mod acquire;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fpga;
pub mod sequencer;
pub mod session;
pub mod sim;
pub mod switch;

pub use config::Config;
pub use error::ControlError;
