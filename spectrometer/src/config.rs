//! Acquisition configuration.
//!
//! Defaults match the deployed instrument; a JSON config file can override
//! any field, and a handful of command-line flags override the file.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Accumulations summed into one averaged record.
pub const AVERAGING_COUNT: usize = 3;

/// Records collected when a single explicit state is requested.
pub const SINGLE_STATE_RECORDS: u32 = 100;

fn default_fpga_ip() -> String {
    "169.254.2.181".into()
}
fn default_hostname_hint() -> Option<String> {
    Some("rfsoc".into())
}
fn default_antenna() -> String {
    "4".into()
}
fn default_acc_length() -> u32 {
    8750 * 2
}
fn default_channels() -> usize {
    4
}
fn default_transform_length() -> usize {
    32768
}
fn default_cal_records() -> u32 {
    10
}
fn default_antenna_records() -> u32 {
    10
}
fn default_filter_bank_extra() -> u32 {
    7
}
fn default_true() -> bool {
    true
}
fn default_mount_path() -> PathBuf {
    "/media/peterson".into()
}
fn default_bitstream() -> PathBuf {
    "fpga_config/03-11-2025/v26.fpg".into()
}
fn default_discovery_timeout_secs() -> u64 {
    5
}
fn default_discovery_attempts() -> u32 {
    5
}
fn default_discovery_retry_delay_secs() -> u64 {
    5
}

/// Full configuration surface consumed by the acquisition core.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Hardcoded fallback address (link-local when direct-attached).
    pub fpga_ip: String,
    /// Primary hostname to try before the fixed fallback list.
    pub hostname_hint: Option<String>,
    /// Antenna identifier embedded in filenames.
    pub antenna: String,
    /// Accumulation length written to the `acc_len` register.
    pub acc_length: u32,
    /// Parallel accumulator channels (`q1`..`qC` BRAMs).
    pub channels: usize,
    /// FFT transform length; the spectrometer keeps half of it.
    pub transform_length: usize,
    /// Records per calibration state per cycle.
    pub cal_records: u32,
    /// Records in the antenna/observation state per cycle.
    pub antenna_records: u32,
    /// Extra records collected in the shorted state for the filter-bank
    /// calibration.
    pub filter_bank_extra: u32,
    /// Save every accumulation individually instead of summing three.
    pub save_each_acc: bool,
    /// Master switch for writing anything to disk.
    pub save_data: bool,
    /// External storage mount point.
    pub mount_path: PathBuf,
    /// Bitstream (.fpg) uploaded at bring-up.
    pub bitstream: PathBuf,
    /// Parent directory name for this observing run (defaults to the UTC
    /// date token of the first filename).
    pub run_dir: Option<String>,
    /// Explicit single switch state; bypasses the calibration sweep.
    pub state: Option<u8>,
    /// Per-attempt connect timeout during discovery, seconds.
    pub discovery_timeout_secs: u64,
    /// Discovery attempts before giving up.
    pub discovery_attempts: u32,
    /// Delay between discovery attempts, seconds.
    pub discovery_retry_delay_secs: u64,
    /// Liveness timeout for the accumulation poll loop, seconds. `None`
    /// reproduces the historical block-forever behavior.
    pub liveness_timeout_secs: Option<u64>,
    /// Whether the supervisor may power-cycle the host on fatal errors.
    /// Disable on a bench.
    pub escalate_on_fatal: bool,
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Config {
            fpga_ip: default_fpga_ip(),
            hostname_hint: default_hostname_hint(),
            antenna: default_antenna(),
            acc_length: default_acc_length(),
            channels: default_channels(),
            transform_length: default_transform_length(),
            cal_records: default_cal_records(),
            antenna_records: default_antenna_records(),
            filter_bank_extra: default_filter_bank_extra(),
            save_each_acc: false,
            save_data: default_true(),
            mount_path: default_mount_path(),
            bitstream: default_bitstream(),
            run_dir: None,
            state: None,
            discovery_timeout_secs: default_discovery_timeout_secs(),
            discovery_attempts: default_discovery_attempts(),
            discovery_retry_delay_secs: default_discovery_retry_delay_secs(),
            liveness_timeout_secs: None,
            escalate_on_fatal: default_true(),
        };
        config.liveness_timeout_secs = Some(config.default_liveness_secs());
        config
    }
}

impl Config {
    /// Load from a JSON file, falling back to defaults for absent fields.
    pub fn from_file(path: &std::path::Path) -> ControlResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| ControlError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameter combinations the hardware cannot satisfy.
    pub fn validate(&self) -> ControlResult<()> {
        if self.channels == 0 {
            return Err(ControlError::Config("channels must be nonzero".into()));
        }
        if self.transform_length % 2 != 0
            || (self.transform_length / 2) % self.channels != 0
        {
            return Err(ControlError::Config(format!(
                "half the transform length ({}) must divide evenly into {} channels",
                self.transform_length / 2,
                self.channels
            )));
        }
        if let Some(state) = self.state {
            if state > 7 {
                return Err(ControlError::Config(format!(
                    "switch state {state} out of range 0-7"
                )));
            }
        }
        if self.acc_length == 0 {
            return Err(ControlError::Config("acc_length must be nonzero".into()));
        }
        Ok(())
    }

    /// One hardware accumulation period.
    pub fn accumulation_period(&self) -> Duration {
        Duration::from_secs_f64(self.acc_length as f64 / 100_000.0)
    }

    /// Settle delay after a switch change: three accumulation periods, so
    /// the accumulation in flight during the transition is discarded.
    pub fn switch_delay(&self) -> Duration {
        self.accumulation_period() * 3
    }

    /// Shipped liveness default: ten accumulation periods, floored at 30 s.
    fn default_liveness_secs(&self) -> u64 {
        (self.accumulation_period().as_secs_f64() * 10.0).ceil().max(30.0) as u64
    }

    /// Liveness timeout for the accumulation poll loop.
    pub fn liveness_timeout(&self) -> Option<Duration> {
        self.liveness_timeout_secs.map(Duration::from_secs)
    }

    /// Per-attempt discovery connect timeout.
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acc_length, 17500);
        assert_eq!(config.channels, 4);
        assert_eq!(config.transform_length, 32768);
    }

    #[test]
    fn switch_delay_tracks_acc_length() {
        let config = Config::default();
        // 17500 * 3 / 100000 = 0.525 s
        assert!((config.switch_delay().as_secs_f64() - 0.525).abs() < 1e-9);
    }

    #[test]
    fn rejects_indivisible_channel_count() {
        let config = Config {
            channels: 3,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_state() {
        let config = Config {
            state: Some(8),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_overrides_merge_over_defaults() {
        let parsed: Config =
            serde_json::from_str(r#"{"cal_records": 2, "save_each_acc": true}"#).unwrap();
        assert_eq!(parsed.cal_records, 2);
        assert!(parsed.save_each_acc);
        assert_eq!(parsed.antenna_records, 10);
    }
}
