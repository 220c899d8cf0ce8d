//! The calibration/observation state machine.
//!
//! Sweep mode (the default) runs forever: calibration states 1 through 7
//! in order, each collecting a fixed number of records (the shorted
//! standard collects extras for the filter-bank calibration), then the
//! antenna state, then the cycle counter increments and the sweep
//! restarts. The first record of each new cycle signals a cycle boundary
//! to the session store, which starts a fresh subdirectory.
//!
//! Single-state mode (an explicit `--state`) selects once, collects a
//! fixed 100 records, and exits cleanly. It is the only clean exit path.
//!
//! There are no retries here. A register fault or storage error propagates
//! to the process level, matching the fail-fast bring-up policy: the
//! operator (or the supervisor) restarts, which re-runs discovery and
//! bring-up from scratch.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::acquire::{self, SpectrumLayout};
use crate::config::{Config, AVERAGING_COUNT, SINGLE_STATE_RECORDS};
use crate::error::ControlResult;
use crate::fpga::FpgaRegisters;
use crate::session::{AccumulationRecord, SessionStore, AVERAGE_LABEL};
use crate::switch::{state_alias, SwitchDriver, ANTENNA_STATE, FILTER_BANK_STATE};

/// Sequencing knobs, lifted out of [`Config`].
#[derive(Debug, Clone)]
pub struct SequencerParams {
    pub cal_records: u32,
    pub antenna_records: u32,
    pub filter_bank_extra: u32,
    pub save_each_acc: bool,
    /// Explicit single state; bypasses the sweep.
    pub single_state: Option<u8>,
    /// Settle delay after every switch change.
    pub settle: Duration,
    /// Liveness bound for the accumulation poll loop.
    pub liveness: Option<Duration>,
    /// Stop after this many completed sweep cycles. `None` runs forever.
    pub max_cycles: Option<u32>,
}

impl SequencerParams {
    pub fn from_config(config: &Config) -> Self {
        SequencerParams {
            cal_records: config.cal_records,
            antenna_records: config.antenna_records,
            filter_bank_extra: config.filter_bank_extra,
            save_each_acc: config.save_each_acc,
            single_state: config.state,
            settle: config.switch_delay(),
            liveness: config.liveness_timeout(),
            max_cycles: None,
        }
    }
}

/// Owns the control loop: device, switch and store for one process run.
pub struct Sequencer<'a> {
    dev: &'a mut dyn FpgaRegisters,
    switch: &'a mut dyn SwitchDriver,
    store: &'a mut SessionStore,
    layout: SpectrumLayout,
    params: SequencerParams,
    last_acc: u32,
    cycle_count: u32,
    /// Set when a cycle completes; consumed by the next save.
    pending_boundary: bool,
}

impl<'a> Sequencer<'a> {
    pub fn new(
        dev: &'a mut dyn FpgaRegisters,
        switch: &'a mut dyn SwitchDriver,
        store: &'a mut SessionStore,
        layout: SpectrumLayout,
        params: SequencerParams,
    ) -> Self {
        Sequencer {
            dev,
            switch,
            store,
            layout,
            params,
            last_acc: 0,
            cycle_count: 0,
            pending_boundary: false,
        }
    }

    /// Completed sweep cycles so far.
    pub fn cycles(&self) -> u32 {
        self.cycle_count
    }

    /// Run until the single-state count or `max_cycles` is reached; sweep
    /// mode with no cycle limit never returns Ok.
    pub fn run(&mut self) -> ControlResult<()> {
        self.last_acc = self.dev.read_u32(acquire::ACC_COUNT_REGISTER)?;

        if let Some(state) = self.params.single_state {
            self.switch.select(state, self.params.settle)?;
            for _ in 0..SINGLE_STATE_RECORDS {
                self.collect_record(state)?;
            }
            info!(state, "completed single-state collection, exiting");
            return Ok(());
        }

        loop {
            for state in 1..=7u8 {
                self.switch.select(state, self.params.settle)?;
                let mut records = self.params.cal_records;
                if state == FILTER_BANK_STATE {
                    records += self.params.filter_bank_extra;
                }
                for _ in 0..records {
                    self.collect_record(state)?;
                }
            }

            self.switch.select(ANTENNA_STATE, self.params.settle)?;
            for _ in 0..self.params.antenna_records {
                self.collect_record(ANTENNA_STATE)?;
            }

            self.cycle_count += 1;
            self.pending_boundary = true;
            info!(cycle = self.cycle_count, "calibration+observation cycle complete");
            if let Some(limit) = self.params.max_cycles {
                if self.cycle_count >= limit {
                    return Ok(());
                }
            }
        }
    }

    /// Acquire and persist one record in the current state.
    fn collect_record(&mut self, state: u8) -> ControlResult<()> {
        let record = if self.params.save_each_acc {
            let sync = acquire::await_next(self.dev, self.last_acc, self.params.liveness)?;
            self.last_acc = sync.count;
            debug!(state, count = sync.count, polls = sync.polls, "accumulation ready");

            let (spectrum, count) = acquire::read_spectrum(self.dev, &self.layout)?;
            AccumulationRecord {
                state,
                state_alias: state_alias(state),
                label: count.to_string(),
                spectrum,
            }
        } else {
            let spectra = collect_distinct(AVERAGING_COUNT, || {
                let sync =
                    acquire::await_next(self.dev, self.last_acc, self.params.liveness)?;
                self.last_acc = sync.count;
                debug!(state, count = sync.count, polls = sync.polls, "accumulation ready");
                let (spectrum, count) = acquire::read_spectrum(self.dev, &self.layout)?;
                Ok((count, spectrum))
            })?;
            let summed = acquire::sum_spectra(&spectra.values().cloned().collect::<Vec<_>>());
            info!(state, accumulations = spectra.len(), "averaged spectrum collected");
            AccumulationRecord {
                state,
                state_alias: state_alias(state),
                label: AVERAGE_LABEL.to_string(),
                spectrum: summed,
            }
        };

        let boundary = std::mem::take(&mut self.pending_boundary);
        self.store.save(&record, boundary)
    }
}

/// Collect spectra until `count` distinct accumulation ids contribute.
///
/// Keyed by hardware accumulation id: a re-read of an accumulation already
/// held replaces it rather than counting twice, so a sticky counter cannot
/// inflate an average with duplicates.
fn collect_distinct<F>(
    count: usize,
    mut acquire_one: F,
) -> ControlResult<BTreeMap<u32, Vec<f64>>>
where
    F: FnMut() -> ControlResult<(u32, Vec<f64>)>,
{
    let mut spectra = BTreeMap::new();
    while spectra.len() < count {
        let (id, spectrum) = acquire_one()?;
        spectra.insert(id, spectrum);
    }
    Ok(spectra)
}
