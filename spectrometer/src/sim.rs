//! Hardware-free register implementations.
//!
//! [`ScriptedRegisters`] replays canned counter values for unit tests;
//! [`SimulatedFpga`] behaves like a free-running spectrometer and backs the
//! `--mock` dry-run mode, where the whole sequencing and persistence path
//! runs with no board attached.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::acquire::{SpectrumLayout, ACC_COUNT_REGISTER};
use crate::error::ControlResult;
use crate::fpga::FpgaRegisters;

/// Replays a scripted accumulation-counter sequence; other registers and
/// BRAMs are plain maps.
#[derive(Debug, Default)]
pub struct ScriptedRegisters {
    counter_script: Vec<u32>,
    next_read: usize,
    brams: HashMap<String, Vec<u8>>,
    registers: HashMap<String, u32>,
}

impl ScriptedRegisters {
    /// Counter reads return the scripted values in order, then hold the
    /// final value.
    pub fn with_counter(counter_script: Vec<u32>) -> Self {
        ScriptedRegisters {
            counter_script,
            ..Default::default()
        }
    }

    /// Counter reads always return `value`.
    pub fn with_constant_counter(value: u32) -> Self {
        Self::with_counter(vec![value])
    }

    /// Back a named BRAM with raw bytes.
    pub fn set_bram(&mut self, name: &str, bytes: Vec<u8>) {
        self.brams.insert(name.to_string(), bytes);
    }

    /// Value last written to a register, if any.
    pub fn written(&self, name: &str) -> Option<u32> {
        self.registers.get(name).copied()
    }
}

impl FpgaRegisters for ScriptedRegisters {
    fn read_u32(&mut self, name: &str) -> ControlResult<u32> {
        if name == ACC_COUNT_REGISTER {
            if self.counter_script.is_empty() {
                return Ok(0);
            }
            let index = self.next_read.min(self.counter_script.len() - 1);
            self.next_read += 1;
            Ok(self.counter_script[index])
        } else {
            Ok(self.registers.get(name).copied().unwrap_or(0))
        }
    }

    fn write_u32(&mut self, name: &str, value: u32) -> ControlResult<()> {
        self.registers.insert(name.to_string(), value);
        Ok(())
    }

    fn read_bytes(
        &mut self,
        name: &str,
        length: usize,
        offset: usize,
    ) -> ControlResult<Vec<u8>> {
        let bram = self.brams.get(name).cloned().unwrap_or_default();
        let end = (offset + length).min(bram.len());
        let mut out = bram.get(offset..end).unwrap_or_default().to_vec();
        out.resize(length, 0);
        Ok(out)
    }
}

/// A stand-in spectrometer: the counter advances on its own and the
/// channel BRAMs hold a deterministic ramp (channel c, offset i reads
/// `c * 1000 + i`).
pub struct SimulatedFpga {
    layout: SpectrumLayout,
    pacing: Option<(Instant, Duration)>,
    reads: u32,
    registers: HashMap<String, u32>,
}

impl SimulatedFpga {
    /// Counter advances on every read; tests run at full speed.
    pub fn free_running(layout: SpectrumLayout) -> Self {
        SimulatedFpga {
            layout,
            pacing: None,
            reads: 0,
            registers: HashMap::new(),
        }
    }

    /// Counter tracks wall-clock time with the given accumulation period;
    /// used by `--mock` so the dry run has a realistic cadence.
    pub fn paced(layout: SpectrumLayout, period: Duration) -> Self {
        SimulatedFpga {
            layout,
            pacing: Some((Instant::now(), period.max(Duration::from_millis(1)))),
            reads: 0,
            registers: HashMap::new(),
        }
    }

    fn counter(&mut self) -> u32 {
        match self.pacing {
            Some((start, period)) => {
                (start.elapsed().as_nanos() / period.as_nanos()) as u32
            }
            None => {
                self.reads += 1;
                self.reads
            }
        }
    }

    fn channel_index(&self, name: &str) -> Option<usize> {
        let n: usize = name.strip_prefix('q')?.parse().ok()?;
        (1..=self.layout.channels).contains(&n).then(|| n - 1)
    }
}

impl FpgaRegisters for SimulatedFpga {
    fn read_u32(&mut self, name: &str) -> ControlResult<u32> {
        if name == ACC_COUNT_REGISTER {
            Ok(self.counter())
        } else {
            Ok(self.registers.get(name).copied().unwrap_or(0))
        }
    }

    fn write_u32(&mut self, name: &str, value: u32) -> ControlResult<()> {
        self.registers.insert(name.to_string(), value);
        Ok(())
    }

    fn read_bytes(
        &mut self,
        name: &str,
        length: usize,
        offset: usize,
    ) -> ControlResult<Vec<u8>> {
        let channel = match self.channel_index(name) {
            Some(c) => c as u64,
            None => return Ok(vec![0; length]),
        };
        let first_sample = (offset / 8) as u64;
        let words = length / 8;
        let mut out = Vec::with_capacity(length);
        for i in 0..words as u64 {
            out.extend_from_slice(&(channel * 1000 + first_sample + i).to_be_bytes());
        }
        out.resize(length, 0);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire;

    #[test]
    fn scripted_counter_holds_last_value() {
        let mut dev = ScriptedRegisters::with_counter(vec![3, 4]);
        assert_eq!(dev.read_u32(ACC_COUNT_REGISTER).unwrap(), 3);
        assert_eq!(dev.read_u32(ACC_COUNT_REGISTER).unwrap(), 4);
        assert_eq!(dev.read_u32(ACC_COUNT_REGISTER).unwrap(), 4);
    }

    #[test]
    fn simulated_spectrum_matches_ramp() {
        let layout = SpectrumLayout {
            channels: 4,
            transform_length: 64,
        };
        let mut dev = SimulatedFpga::free_running(layout);
        let (spectrum, _) = acquire::read_spectrum(&mut dev, &layout).expect("read");
        assert_eq!(spectrum.len(), 32);
        for (i, &value) in spectrum.iter().enumerate() {
            let expected = (i % 4) as f64 * 1000.0 + (i / 4) as f64;
            assert_eq!(value, expected);
        }
    }

    #[test]
    fn free_running_counter_always_advances() {
        let layout = SpectrumLayout {
            channels: 4,
            transform_length: 64,
        };
        let mut dev = SimulatedFpga::free_running(layout);
        let sync = acquire::await_next(&mut dev, 0, None).expect("sync");
        assert!(sync.count > 0);
        let next = acquire::await_next(&mut dev, sync.count, None).expect("sync");
        assert!(acquire::counter_advanced(sync.count, next.count));
    }
}
