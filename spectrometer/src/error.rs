//! Error taxonomy for the acquisition core.
//!
//! Two categories are fatal for an unattended field instrument: discovery
//! exhaustion and bring-up failure. The library only classifies them
//! ([`ControlError::is_fatal`]); the escalation policy (long sleep, then a
//! host power-cycle) belongs to the binary supervisor.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the acquisition and sequencing core.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Every discovery strategy (hostnames, hardcoded address, IPv6
    /// neighbor scan) was exhausted without a responsive device.
    #[error("FPGA discovery exhausted: no responsive device found")]
    DiscoveryExhausted,

    /// Bitstream programming, RFDC init or clock programming failed.
    #[error("FPGA bring-up failed: {0}")]
    Bringup(String),

    /// The accumulation counter stopped advancing for longer than the
    /// configured liveness timeout.
    #[error("accumulation counter stalled at {last_seen} for {waited:?}")]
    StaleAccumulation {
        /// Last counter value observed before the stall.
        last_seen: u32,
        /// How long the poll loop waited.
        waited: Duration,
    },

    /// Register access failed during steady-state acquisition. Not locally
    /// recovered: propagates to the process level.
    #[error("register access failed: {0}")]
    Register(#[from] katcp::KatcpError),

    /// Storage layout problem that waiting cannot fix (missing drive
    /// session directory, unwritable path).
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration rejected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem or process-spawning failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// Whether the supervisor should escalate (sleep, then power-cycle the
    /// host) rather than let a plain restart retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ControlError::DiscoveryExhausted | ControlError::Bringup(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type ControlResult<T> = Result<T, ControlError>;
