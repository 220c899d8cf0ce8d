//! FPGA device layer: bring-up sequence and register access over KATCP.
//!
//! Device-level requests follow the CASPER tcpborphserver conventions:
//! `?read`/`?write` for named-register byte access, `?progremote` plus a
//! side-channel upload socket for bitstream programming, and the `?rfdc-*`
//! family for data-converter bring-up on RFSoC platforms.
//!
//! [`bring_up`] is the one-shot initialization path. It is deliberately
//! all-or-nothing: any failure maps to a fatal error category and no
//! partial-success state is retained, because the instrument runs
//! unattended and a clean power-cycle beats a half-configured front end.

pub mod rfdc;

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::Locator;
use crate::error::{ControlError, ControlResult};
use crate::switch::SwitchDriver;

/// Port the server opens for side-channel bitstream upload.
const UPLOAD_PORT: u16 = 3000;

/// Timeout for programming requests; FPGA configuration takes tens of
/// seconds.
const PROGRAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Settle for the switch move to the neutral state before bring-up.
const NEUTRAL_SETTLE: Duration = Duration::from_secs(2);

/// Wait after PLL programming for the sample clocks to lock.
const CLOCK_SETTLE: Duration = Duration::from_secs(15);

/// Steady-state register access used by the acquisition loop.
///
/// This is the full capability surface the core needs after bring-up;
/// everything else (programming, RFDC) stays on the concrete handle.
pub trait FpgaRegisters {
    /// Read a 32-bit unsigned register by name.
    fn read_u32(&mut self, name: &str) -> ControlResult<u32>;

    /// Write a 32-bit unsigned register by name.
    fn write_u32(&mut self, name: &str, value: u32) -> ControlResult<()>;

    /// Read `length` bytes from a named memory at `offset`.
    fn read_bytes(&mut self, name: &str, length: usize, offset: usize)
        -> ControlResult<Vec<u8>>;
}

/// A connected, KATCP-speaking FPGA.
pub struct KatcpFpga {
    client: katcp::Client,
    addr: SocketAddr,
}

impl KatcpFpga {
    /// Connect to the control server at `addr`.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> ControlResult<Self> {
        let client = katcp::Client::connect(addr, timeout)?;
        Ok(KatcpFpga { client, addr })
    }

    /// Named devices (registers, BRAMs) advertised by the running design.
    pub fn list_devices(&mut self) -> ControlResult<Vec<String>> {
        let resp = self.client.request("listdev", &[])?;
        Ok(resp.informs.iter().filter_map(|i| i.arg_str(0)).collect())
    }

    /// Upload a bitstream and program the FPGA with it.
    ///
    /// `?progremote` asks the server to listen on an upload port; the file
    /// is streamed there raw, then the server programs the part.
    pub fn program_bitstream(&mut self, path: &Path) -> ControlResult<()> {
        let image = std::fs::read(path)?;
        info!(path = %path.display(), bytes = image.len(), "programming bitstream");

        self.client.set_timeout(PROGRAM_TIMEOUT)?;
        let port_arg = UPLOAD_PORT.to_string();
        self.client.request("progremote", &[port_arg.as_bytes()])?;

        let upload_addr = SocketAddr::new(self.addr.ip(), UPLOAD_PORT);
        let mut upload = TcpStream::connect_timeout(&upload_addr, PROGRAM_TIMEOUT)
            .map_err(|e| {
                ControlError::Bringup(format!("upload connect to {upload_addr}: {e}"))
            })?;
        upload.write_all(&image)?;
        upload.flush()?;
        drop(upload);

        // The server programs asynchronously; wait until it reports a
        // configured FPGA before touching registers.
        std::thread::sleep(Duration::from_secs(5));
        self.client.request("fpgastatus", &[])?;
        self.client.set_timeout(katcp::DEFAULT_TIMEOUT)?;
        info!("bitstream programmed");
        Ok(())
    }

    /// RFDC bring-up handle, available only when the running design
    /// advertises the data converter block.
    ///
    /// Any probe failure is a bring-up failure: a missing capability and a
    /// transport fault at this stage both leave the converters
    /// unconfigured, so both classify as fatal.
    pub fn rfdc(&mut self) -> ControlResult<rfdc::Rfdc<'_>> {
        let resp = self.client.request("help", &[b"rfdc-init"]);
        match resp {
            Ok(_) => Ok(rfdc::Rfdc::new(&mut self.client)),
            Err(katcp::KatcpError::RequestFailed { .. }) => Err(ControlError::Bringup(
                "platform does not advertise rfdc support".into(),
            )),
            Err(e) => Err(ControlError::Bringup(format!("rfdc probe: {e}"))),
        }
    }
}

impl FpgaRegisters for KatcpFpga {
    fn read_u32(&mut self, name: &str) -> ControlResult<u32> {
        let bytes = self.read_bytes(name, 4, 0)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn write_u32(&mut self, name: &str, value: u32) -> ControlResult<()> {
        let payload = value.to_be_bytes();
        self.client
            .request("write", &[name.as_bytes(), b"0", &payload])?;
        Ok(())
    }

    fn read_bytes(
        &mut self,
        name: &str,
        length: usize,
        offset: usize,
    ) -> ControlResult<Vec<u8>> {
        let offset_arg = offset.to_string();
        let length_arg = length.to_string();
        let resp = self.client.request(
            "read",
            &[name.as_bytes(), offset_arg.as_bytes(), length_arg.as_bytes()],
        )?;
        let payload = resp
            .reply
            .arguments
            .get(1)
            .cloned()
            .unwrap_or_default();
        if payload.len() != length {
            return Err(ControlError::Register(katcp::KatcpError::Protocol(
                format!(
                    "?read {name} returned {} bytes, expected {length}",
                    payload.len()
                ),
            )));
        }
        Ok(payload)
    }
}

/// Full device bring-up: neutral switch state, discovery with retries,
/// bitstream programming, RFDC and clock initialization, accumulation
/// length.
///
/// Returns the connected handle, or a fatal-category error for the
/// supervisor to escalate.
pub fn bring_up(
    config: &Config,
    switch: &mut dyn SwitchDriver,
) -> ControlResult<KatcpFpga> {
    switch
        .select(crate::switch::ANTENNA_STATE, NEUTRAL_SETTLE)
        .map_err(|e| ControlError::Bringup(format!("switch to neutral state: {e}")))?;

    let locator = Locator::new(
        config.hostname_hint.clone(),
        config.fpga_ip.clone(),
        config.discovery_timeout(),
    );
    let address = locate_with_retries(&locator, config)?;

    let mut fpga = KatcpFpga::connect(address.addr, config.discovery_timeout())
        .map_err(|e| ControlError::Bringup(format!("connect: {e}")))?;

    let devices = fpga
        .list_devices()
        .map_err(|e| ControlError::Bringup(format!("listdev: {e}")))?;
    debug!(count = devices.len(), "design devices enumerated");

    fpga.program_bitstream(&config.bitstream)
        .map_err(|e| ControlError::Bringup(format!("bitstream: {e}")))?;

    {
        let mut rfdc = fpga.rfdc()?;
        rfdc.init()
            .map_err(|e| ControlError::Bringup(format!("rfdc-init: {e}")))?;
        match rfdc.status() {
            Ok(status) => info!("ADC/DAC status:\n{status}"),
            Err(e) => warn!(error = %e, "could not read RFDC status"),
        }

        let clk_files = rfdc
            .show_clk_files()
            .map_err(|e| ControlError::Bringup(format!("rfdc-show-clk-files: {e}")))?;
        if clk_files.len() < 2 {
            return Err(ControlError::Bringup(format!(
                "expected lmx and lmk clock files, got {clk_files:?}"
            )));
        }
        // Index 1 is the LMK file, index 0 the LMX, per the firmware's
        // advertised ordering.
        rfdc.progpll(rfdc::Pll::Lmk, &clk_files[1])
            .map_err(|e| ControlError::Bringup(format!("progpll lmk: {e}")))?;
        rfdc.progpll(rfdc::Pll::Lmx, &clk_files[0])
            .map_err(|e| ControlError::Bringup(format!("progpll lmx: {e}")))?;
    }

    info!("waiting {CLOCK_SETTLE:?} for sample clocks to lock");
    std::thread::sleep(CLOCK_SETTLE);

    fpga.write_u32("acc_len", config.acc_length)
        .map_err(|e| ControlError::Bringup(format!("acc_len write: {e}")))?;
    info!(acc_len = config.acc_length, "initialization complete, taking data");
    Ok(fpga)
}

fn locate_with_retries(
    locator: &Locator,
    config: &Config,
) -> ControlResult<crate::discovery::DeviceAddress> {
    let attempts = config.discovery_attempts.max(1);
    for attempt in 1..=attempts {
        info!(attempt, total = attempts, "FPGA discovery attempt");
        match locator.locate() {
            Ok(address) => {
                info!(addr = %address.addr, "found FPGA");
                return Ok(address);
            }
            Err(e) if attempt < attempts => {
                warn!(error = %e, delay = config.discovery_retry_delay_secs,
                    "FPGA not found, retrying");
                std::thread::sleep(Duration::from_secs(config.discovery_retry_delay_secs));
            }
            Err(_) => break,
        }
    }
    warn!("FPGA discovery exhausted; check power, cabling and the KATCP port");
    Err(ControlError::DiscoveryExhausted)
}
