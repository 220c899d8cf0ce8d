//! Calibration switch control.
//!
//! The RF front end is routed through a switch network with eight
//! configurations, selected by three GPIO lines. State 0 powers the
//! antenna/main switch (observation); states 1-7 select calibration
//! standards. The line encoding is inverted: the three lines carry
//! `idx = 7 - state` as bits 0..2, so state 0 drives all lines high and
//! state 7 drives them all low.
//!
//! After every change the caller-supplied settle delay lets the analog
//! hardware stabilize before data is trusted.

use std::time::Duration;

use tracing::debug;

use crate::error::{ControlError, ControlResult};

/// Antenna/observation state: main switch powered.
pub const ANTENNA_STATE: u8 = 0;

/// The shorted standard whose extra records feed the filter-bank
/// calibration.
pub const FILTER_BANK_STATE: u8 = 2;

/// Well-known alias for a state, used in record labeling.
pub fn state_alias(state: u8) -> Option<&'static str> {
    match state {
        1 => Some("open-circuit"),
        FILTER_BANK_STATE => Some("filter-bank"),
        _ => None,
    }
}

/// Line levels for a switch state: `idx = 7 - state` as (bit0, bit1, bit2).
pub fn state_bits(state: u8) -> ControlResult<(bool, bool, bool)> {
    if state > 7 {
        return Err(ControlError::Config(format!(
            "switch state {state} out of range 0-7"
        )));
    }
    let idx = 7 - state;
    Ok((idx & 1 != 0, idx & 2 != 0, idx & 4 != 0))
}

/// Drives the calibration switch. Implementations must be idempotent:
/// re-selecting the current state is always safe.
pub trait SwitchDriver {
    fn select(&mut self, state: u8, settle: Duration) -> ControlResult<()>;
}

/// GPIO character-device switch driver.
///
/// Line offsets follow the deployed wiring: BCM 21/20/16 carry bits 0/1/2.
#[cfg(target_os = "linux")]
pub mod gpio {
    use super::*;
    use tracing::info;

    /// Default GPIO controller.
    pub const CHIP: &str = "gpiochip0";

    /// Line offsets for bits 0, 1, 2.
    pub const LINE_OFFSETS: [u32; 3] = [21, 20, 16];

    pub struct GpioSwitch {
        lines: gpiod::Lines<gpiod::Output>,
    }

    impl GpioSwitch {
        /// Claim the three switch lines, driven low until the first select.
        pub fn open() -> ControlResult<Self> {
            let chip = gpiod::Chip::new(CHIP)?;
            let opts = gpiod::Options::output(LINE_OFFSETS)
                .values([false, false, false])
                .consumer("rcal-switch");
            let lines = chip.request_lines(opts)?;
            Ok(GpioSwitch { lines })
        }
    }

    impl SwitchDriver for GpioSwitch {
        fn select(&mut self, state: u8, settle: Duration) -> ControlResult<()> {
            let (b0, b1, b2) = state_bits(state)?;
            info!(state, idx = 7 - state, "switching calibration state");
            self.lines.set_values([b0, b1, b2])?;
            std::thread::sleep(settle);
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
pub use gpio::GpioSwitch;

/// Records selections instead of toggling hardware. Used by `--mock` runs
/// and tests; also the only driver available off-Linux.
#[derive(Debug, Default)]
pub struct MockSwitch {
    /// Every (state, settle) selection in order.
    pub selections: Vec<(u8, Duration)>,
}

impl SwitchDriver for MockSwitch {
    fn select(&mut self, state: u8, settle: Duration) -> ControlResult<()> {
        state_bits(state)?;
        debug!(state, "mock switch select");
        self.selections.push((state, settle));
        Ok(())
    }
}
