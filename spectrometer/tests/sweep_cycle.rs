//! End-to-end sequencing against the simulated device: full sweep cycles,
//! single-state mode, and the persisted directory layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use spectrometer::acquire::SpectrumLayout;
use spectrometer::sequencer::{Sequencer, SequencerParams};
use chrono::TimeZone;
use spectrometer::session::{AlwaysMounted, Clock, SessionStore, SystemClock};
use spectrometer::sim::SimulatedFpga;
use spectrometer::switch::MockSwitch;

const LAYOUT: SpectrumLayout = SpectrumLayout {
    channels: 4,
    transform_length: 64,
};

fn store_in(mount: &Path, save_each_acc: bool) -> SessionStore {
    std::fs::create_dir_all(mount.join("INDURANCE")).unwrap();
    SessionStore::new(mount.to_path_buf(), "2".into(), None, true, save_each_acc)
        .with_environment(Box::new(AlwaysMounted), Box::new(SystemClock))
}

fn params(single_state: Option<u8>, max_cycles: Option<u32>) -> SequencerParams {
    SequencerParams {
        cal_records: 2,
        antenna_records: 2,
        filter_bank_extra: 1,
        save_each_acc: true,
        single_state,
        settle: Duration::ZERO,
        liveness: Some(Duration::from_secs(5)),
        max_cycles,
    }
}

/// Advances one second per query, keeping timestamp-derived names unique
/// at simulator speed.
#[derive(Default)]
struct TickClock(std::cell::Cell<i64>);

impl Clock for TickClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        let t = 1_700_000_000 + self.0.get();
        self.0.set(self.0.get() + 1);
        chrono::Utc.timestamp_opt(t, 0).unwrap()
    }
}

fn record_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(dir).unwrap().flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "json") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

#[test]
fn one_sweep_cycle_produces_seventeen_records() {
    let mount = tempfile::tempdir().unwrap();
    let mut dev = SimulatedFpga::free_running(LAYOUT);
    let mut switch = MockSwitch::default();
    let mut store = store_in(mount.path(), true);

    let mut sequencer =
        Sequencer::new(&mut dev, &mut switch, &mut store, LAYOUT, params(None, Some(1)));
    sequencer.run().expect("one cycle");
    assert_eq!(sequencer.cycles(), 1);

    // Six plain calibration states at 2 each, the shorted state at 2+1,
    // and the antenna at 2: 12 + 3 + 2 = 17.
    assert_eq!(record_files(mount.path()).len(), 17);

    // Sweep order: states 1..7, then antenna.
    let states: Vec<u8> = switch.selections.iter().map(|(s, _)| *s).collect();
    assert_eq!(states, vec![1, 2, 3, 4, 5, 6, 7, 0]);
}

#[test]
fn cycle_counts_scale_with_max_cycles() {
    let mount = tempfile::tempdir().unwrap();
    let mut dev = SimulatedFpga::free_running(LAYOUT);
    let mut switch = MockSwitch::default();
    let mut store = store_in(mount.path(), true);

    let mut sequencer =
        Sequencer::new(&mut dev, &mut switch, &mut store, LAYOUT, params(None, Some(2)));
    sequencer.run().expect("two cycles");
    assert_eq!(sequencer.cycles(), 2);
    assert_eq!(record_files(mount.path()).len(), 34);
}

#[test]
fn single_state_mode_collects_fixed_count_and_exits() {
    let mount = tempfile::tempdir().unwrap();
    let mut dev = SimulatedFpga::free_running(LAYOUT);
    let mut switch = MockSwitch::default();
    let mut store = store_in(mount.path(), true);

    Sequencer::new(&mut dev, &mut switch, &mut store, LAYOUT, params(Some(5), None))
        .run()
        .expect("single state run");

    let files = record_files(mount.path());
    assert_eq!(files.len(), 100);
    assert_eq!(switch.selections, vec![(5, Duration::ZERO)]);
    for file in &files {
        let name = file.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("_antenna2_state5_"), "{name}");
    }
}

#[test]
fn averaged_mode_sums_three_distinct_accumulations() {
    let mount = tempfile::tempdir().unwrap();
    let mut dev = SimulatedFpga::free_running(LAYOUT);
    let mut switch = MockSwitch::default();
    // Tick one second per save so averaged filenames (which carry no
    // accumulation suffix) stay distinct at simulator speed.
    std::fs::create_dir_all(mount.path().join("INDURANCE")).unwrap();
    let mut store = SessionStore::new(
        mount.path().to_path_buf(),
        "2".into(),
        None,
        true,
        false,
    )
    .with_environment(Box::new(AlwaysMounted), Box::new(TickClock::default()));

    let mut p = params(Some(3), None);
    p.save_each_acc = false;
    Sequencer::new(&mut dev, &mut switch, &mut store, LAYOUT, p)
        .run()
        .expect("averaged run");

    let files = record_files(mount.path());
    assert_eq!(files.len(), 100);
    let body: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&files[0]).unwrap()).unwrap();
    assert_eq!(body["label"], "average");
    assert_eq!(body["state"], 3);
    // The simulator's ramp is constant, so each sample is 3x its
    // single-accumulation value: sample 1 is channel 1 offset 0 = 1000.
    assert_eq!(body["spectrum"][1], 3000.0);
    // Averaged filenames carry no accumulation suffix.
    let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.ends_with("_antenna2_state3.json"), "{name}");
}
