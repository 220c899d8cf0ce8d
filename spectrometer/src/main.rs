//! Spectrometer acquisition binary.
//!
//! Owns the process-level policy the library deliberately does not:
//! logging setup, configuration merging, and the fatal-escalation path.
//! The instrument runs unattended in the field, so discovery exhaustion
//! and bring-up failures end in a long sleep followed by a host
//! power-cycle; everything else terminates the process and relies on an
//! external restart to re-run discovery and bring-up.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use spectrometer::acquire::SpectrumLayout;
use spectrometer::sequencer::{Sequencer, SequencerParams};
use spectrometer::session::{AlwaysMounted, SessionStore, SystemClock};
use spectrometer::sim::SimulatedFpga;
use spectrometer::switch::{MockSwitch, SwitchDriver};
use spectrometer::{fpga, Config, ControlError};

/// Sleep before the power-cycle, long enough for an operator on the
/// console to intervene.
const ESCALATION_DELAY: Duration = Duration::from_secs(180);

/// high-z digital spectrometer
#[derive(Parser, Debug)]
#[command(name = "run_spectrometer")]
#[command(about = "high-z digital spectrometer acquisition")]
#[command(version)]
struct Args {
    /// JSON configuration file; defaults apply when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Switch state (0-7); collects 100 records in that state and exits
    #[arg(long)]
    state: Option<u8>,

    /// Parent directory name for this observing run
    #[arg(long)]
    run_dir: Option<String>,

    /// Disable writing records to disk
    #[arg(long)]
    no_save: bool,

    /// Run against a simulated device and switch (no hardware)
    #[arg(long)]
    mock: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    info!(?args, "command line arguments");

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if args.state.is_some() {
        config.state = args.state;
    }
    if args.run_dir.is_some() {
        config.run_dir = args.run_dir.clone();
    }
    if args.no_save {
        config.save_data = false;
    }
    config.validate()?;

    match run(&config, args.mock) {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() && config.escalate_on_fatal && !args.mock => {
            error!(error = %e, "fatal failure, escalating to host power-cycle");
            error!("check: FPGA power and ethernet, network link, KATCP port 7147");
            std::thread::sleep(ESCALATION_DELAY);
            let status = Command::new("sudo").arg("reboot").status()?;
            error!(?status, "reboot command returned");
            Err(e.into())
        }
        Err(e) => Err(e).context("acquisition terminated"),
    }
}

fn run(config: &Config, mock: bool) -> Result<(), ControlError> {
    let layout = SpectrumLayout {
        channels: config.channels,
        transform_length: config.transform_length,
    };
    let params = SequencerParams::from_config(config);

    if mock {
        // Records land under the system temp directory instead of the
        // field drive.
        let mount = std::env::temp_dir().join("spectrometer-mock");
        std::fs::create_dir_all(mount.join("MOCKDRIVE"))?;
        info!(mount = %mount.display(), "mock mode: simulated device and switch");
        let mut dev = SimulatedFpga::paced(layout, config.accumulation_period());
        let mut switch = MockSwitch::default();
        let mut store = SessionStore::new(
            mount,
            config.antenna.clone(),
            config.run_dir.clone(),
            config.save_data,
            config.save_each_acc,
        )
        .with_environment(Box::new(AlwaysMounted), Box::new(SystemClock));
        return Sequencer::new(&mut dev, &mut switch, &mut store, layout, params).run();
    }

    let mut switch = open_switch()?;
    let mut dev = fpga::bring_up(config, switch.as_mut())?;
    let mut store = SessionStore::new(
        config.mount_path.clone(),
        config.antenna.clone(),
        config.run_dir.clone(),
        config.save_data,
        config.save_each_acc,
    );
    Sequencer::new(&mut dev, switch.as_mut(), &mut store, layout, params).run()
}

#[cfg(target_os = "linux")]
fn open_switch() -> Result<Box<dyn SwitchDriver>, ControlError> {
    Ok(Box::new(spectrometer::switch::GpioSwitch::open()?))
}

#[cfg(not(target_os = "linux"))]
fn open_switch() -> Result<Box<dyn SwitchDriver>, ControlError> {
    Ok(Box::new(MockSwitch::default()))
}
