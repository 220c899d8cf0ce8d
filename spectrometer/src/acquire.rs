//! Accumulation synchronization and spectrum readout.
//!
//! The FPGA integrates spectra continuously and bumps the `acc_cnt`
//! register when a fresh accumulation lands in the readout BRAMs. Readout
//! is only consistent between bumps, so the loop is: wait for the counter
//! to advance, then read all channel BRAMs, then read the counter again to
//! label the record.
//!
//! There is no sleep in the poll loop. Acquisition cadence is paced
//! entirely by the cost of a register read and the hardware accumulation
//! period, which is how the instrument has always run.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{ControlError, ControlResult};
use crate::fpga::FpgaRegisters;

/// Register holding the accumulation counter.
pub const ACC_COUNT_REGISTER: &str = "acc_cnt";

/// A synchronized accumulation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPoint {
    /// Counter value of the newly available accumulation.
    pub count: u32,
    /// Register reads performed, including the initial one. Diagnostic
    /// only: high poll counts mean we are outrunning the hardware.
    pub polls: u32,
}

/// Wrap-aware "has the counter advanced" comparison.
///
/// Serial-number arithmetic with the half-range rule: `next` is newer than
/// `prev` when it differs and the forward distance is less than 2^31. A
/// 32-bit counter at one bump per accumulation period wraps after years,
/// but a power-glitched counter restart must still count as progress.
pub fn counter_advanced(prev: u32, next: u32) -> bool {
    next != prev && next.wrapping_sub(prev) < 1 << 31
}

/// Block until the accumulation counter advances past `last_seen`.
///
/// A first read that already exceeds `last_seen` becomes the new baseline;
/// the loop then waits for one more advance so the caller never reads a
/// half-written accumulation. `liveness` bounds the wait: `None` blocks
/// forever (the historical behavior), `Some(d)` fails with
/// [`ControlError::StaleAccumulation`] once `d` elapses without progress.
pub fn await_next(
    dev: &mut dyn FpgaRegisters,
    last_seen: u32,
    liveness: Option<Duration>,
) -> ControlResult<SyncPoint> {
    let started = Instant::now();
    let mut count = dev.read_u32(ACC_COUNT_REGISTER)?;
    let mut baseline = last_seen;
    if counter_advanced(baseline, count) {
        baseline = count;
    }

    let mut polls: u32 = 1;
    while !counter_advanced(baseline, count) {
        if let Some(limit) = liveness {
            let waited = started.elapsed();
            if waited >= limit {
                return Err(ControlError::StaleAccumulation {
                    last_seen: baseline,
                    waited,
                });
            }
        }
        count = dev.read_u32(ACC_COUNT_REGISTER)?;
        polls = polls.saturating_add(1);
    }

    trace!(count, polls, "accumulation boundary");
    Ok(SyncPoint { count, polls })
}

/// Geometry of the channelized accumulator readout.
#[derive(Debug, Clone, Copy)]
pub struct SpectrumLayout {
    /// Parallel accumulator channels (`q1`..`qC`).
    pub channels: usize,
    /// FFT transform length; the design keeps the lower half.
    pub transform_length: usize,
}

impl SpectrumLayout {
    pub fn samples(&self) -> usize {
        self.transform_length / 2
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples() / self.channels
    }

    /// BRAM name for a zero-based channel index.
    pub fn bram_name(&self, channel: usize) -> String {
        format!("q{}", channel + 1)
    }
}

/// Read one full spectrum plus the current accumulation counter.
///
/// Performs exactly `channels` block reads, decodes each block as
/// big-endian u64 words, and interleaves the channels round-robin: sample
/// `i` of the result comes from channel `i % C` at offset `i / C`.
pub fn read_spectrum(
    dev: &mut dyn FpgaRegisters,
    layout: &SpectrumLayout,
) -> ControlResult<(Vec<f64>, u32)> {
    let per_channel = layout.samples_per_channel();
    let mut channel_data: Vec<Vec<u64>> = Vec::with_capacity(layout.channels);

    let started = Instant::now();
    for channel in 0..layout.channels {
        let raw = dev.read_bytes(&layout.bram_name(channel), per_channel * 8, 0)?;
        channel_data.push(decode_be_u64(&raw));
    }
    debug!(elapsed = ?started.elapsed(), channels = layout.channels, "vacc read");

    let spectrum = interleave(&channel_data);
    let count = dev.read_u32(ACC_COUNT_REGISTER)?;
    Ok((spectrum, count))
}

fn decode_be_u64(raw: &[u8]) -> Vec<u64> {
    raw.chunks_exact(8)
        .map(|w| u64::from_be_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]]))
        .collect()
}

/// Round-robin interleave of per-channel sample arrays into one flat
/// spectrum.
pub fn interleave(channel_data: &[Vec<u64>]) -> Vec<f64> {
    let per_channel = channel_data.first().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(per_channel * channel_data.len());
    for sample in 0..per_channel {
        for channel in channel_data {
            out.push(channel[sample] as f64);
        }
    }
    out
}

/// Element-wise sum of spectra, used by averaged save mode.
pub fn sum_spectra(spectra: &[Vec<f64>]) -> Vec<f64> {
    let len = spectra.first().map_or(0, Vec::len);
    let mut out = vec![0.0; len];
    for spectrum in spectra {
        for (acc, value) in out.iter_mut().zip(spectrum) {
            *acc += value;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ScriptedRegisters;

    #[test]
    fn counter_comparison_is_wrap_aware() {
        assert!(counter_advanced(5, 6));
        assert!(!counter_advanced(5, 5));
        assert!(!counter_advanced(6, 5));
        assert!(counter_advanced(u32::MAX, 0));
        assert!(!counter_advanced(0, u32::MAX));
    }

    #[test]
    fn await_next_counts_every_poll() {
        let mut dev = ScriptedRegisters::with_counter(vec![5, 5, 5, 7]);
        let sync = await_next(&mut dev, 5, None).expect("sync");
        assert_eq!(sync.count, 7);
        assert_eq!(sync.polls, 4);
    }

    #[test]
    fn await_next_rebaselines_on_already_advanced_counter() {
        // First read (9) already exceeds last_seen, so it becomes the
        // baseline and the loop waits for the advance past it.
        let mut dev = ScriptedRegisters::with_counter(vec![9, 9, 10]);
        let sync = await_next(&mut dev, 5, None).expect("sync");
        assert_eq!(sync.count, 10);
        assert_eq!(sync.polls, 3);
    }

    #[test]
    fn await_next_times_out_on_stalled_counter() {
        let mut dev = ScriptedRegisters::with_constant_counter(5);
        let err = await_next(&mut dev, 5, Some(Duration::from_millis(5)))
            .expect_err("must time out");
        match err {
            ControlError::StaleAccumulation { last_seen, waited } => {
                assert_eq!(last_seen, 5);
                assert!(waited >= Duration::from_millis(5));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn await_next_accepts_wraparound_advance() {
        let mut dev = ScriptedRegisters::with_counter(vec![u32::MAX, 0]);
        let sync = await_next(&mut dev, u32::MAX, None).expect("sync");
        assert_eq!(sync.count, 0);
    }

    #[test]
    fn interleave_is_round_robin() {
        let channels: Vec<Vec<u64>> = (0..4)
            .map(|c| (0..3).map(|i| c * 1000 + i).collect())
            .collect();
        let flat = interleave(&channels);
        assert_eq!(
            flat,
            vec![
                0.0, 1000.0, 2000.0, 3000.0, //
                1.0, 1001.0, 2001.0, 3001.0, //
                2.0, 1002.0, 2002.0, 3002.0,
            ]
        );
    }

    #[test]
    fn interleave_holds_for_other_channel_counts() {
        for channels in [1usize, 2, 8] {
            let per_channel = 16 / channels;
            let data: Vec<Vec<u64>> = (0..channels as u64)
                .map(|c| (0..per_channel as u64).map(|i| c * 1000 + i).collect())
                .collect();
            let flat = interleave(&data);
            for (i, &value) in flat.iter().enumerate() {
                let expected = (i % channels) as u64 * 1000 + (i / channels) as u64;
                assert_eq!(value, expected as f64);
            }
        }
    }

    #[test]
    fn read_spectrum_decodes_big_endian_words() {
        let layout = SpectrumLayout {
            channels: 2,
            transform_length: 8,
        };
        // Channel BRAMs q1/q2 hold [1, 2] and [3, 4].
        let mut dev = ScriptedRegisters::with_counter(vec![42]);
        dev.set_bram("q1", be_words(&[1, 2]));
        dev.set_bram("q2", be_words(&[3, 4]));
        let (spectrum, count) = read_spectrum(&mut dev, &layout).expect("read");
        assert_eq!(spectrum, vec![1.0, 3.0, 2.0, 4.0]);
        assert_eq!(count, 42);
    }

    #[test]
    fn sum_is_element_wise() {
        let spectra = vec![vec![1.0, 2.0], vec![10.0, 20.0], vec![100.0, 200.0]];
        assert_eq!(sum_spectra(&spectra), vec![111.0, 222.0]);
    }

    fn be_words(words: &[u64]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }
}
