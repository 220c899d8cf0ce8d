//! RFDC (RF data converter) bring-up requests.
//!
//! RFSoC firmware exposes the converter tiles through `?rfdc-*` requests.
//! The status informs are parsed leniently: newer firmware reports
//! `Enabled 1, State: 15 PLL: 1` (colons inside values) while the format
//! older tooling expects is `Enabled 1 State 15 PLL 1`. Both are accepted.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::error::ControlResult;

/// Which on-board synthesizer to program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pll {
    /// LMK clock distribution.
    Lmk,
    /// LMX frequency synthesizer.
    Lmx,
}

impl Pll {
    fn request_name(self) -> &'static str {
        match self {
            Pll::Lmk => "lmk",
            Pll::Lmx => "lmx",
        }
    }
}

/// Borrowed RFDC bring-up interface over an established KATCP connection.
pub struct Rfdc<'a> {
    client: &'a mut katcp::Client,
}

impl<'a> Rfdc<'a> {
    pub(super) fn new(client: &'a mut katcp::Client) -> Self {
        Rfdc { client }
    }

    /// Initialize all converter tiles.
    pub fn init(&mut self) -> ControlResult<()> {
        self.client.request("rfdc-init", &[])?;
        Ok(())
    }

    /// Human-readable per-tile status summary.
    pub fn status(&mut self) -> ControlResult<String> {
        let resp = self.client.request("rfdc-status", &[])?;
        let mut out = String::new();
        for inform in &resp.informs {
            if let Some(line) = inform.arg_str(0) {
                if let Some((tile, values)) = parse_status_line(&line) {
                    let rendered: Vec<String> =
                        values.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                    out.push_str(&format!("  {tile}: {}\n", rendered.join(", ")));
                } else {
                    debug!(line, "unrecognized rfdc-status inform");
                }
            }
        }
        Ok(out)
    }

    /// Clock configuration files the firmware advertises, in its order.
    pub fn show_clk_files(&mut self) -> ControlResult<Vec<String>> {
        let resp = self.client.request("rfdc-show-clk-files", &[])?;
        Ok(resp.informs.iter().filter_map(|i| i.arg_str(0)).collect())
    }

    /// Program one PLL from an advertised clock file.
    pub fn progpll(&mut self, pll: Pll, file: &str) -> ControlResult<()> {
        debug!(pll = pll.request_name(), file, "programming PLL");
        self.client
            .request("rfdc-progpll", &[pll.request_name().as_bytes(), file.as_bytes()])?;
        Ok(())
    }
}

/// Parse one status inform like `ADC0: Enabled 1, State: 15 PLL: 1`.
///
/// Returns the tile name and its key/value pairs, accepting both `Key: n`
/// and `Key n` forms.
pub(crate) fn parse_status_line(line: &str) -> Option<(String, BTreeMap<String, u32>)> {
    static STATUS_PAIR: OnceLock<Regex> = OnceLock::new();
    let (tile, rest) = line.split_once(": ")?;
    let pattern = STATUS_PAIR.get_or_init(|| {
        Regex::new(r"(\w+):\s*(\d+)|(\w+)\s+(\d+)").expect("static pattern")
    });
    let mut values = BTreeMap::new();
    for caps in pattern.captures_iter(rest) {
        let (key, value) = match (caps.get(1), caps.get(2), caps.get(3), caps.get(4)) {
            (Some(k), Some(v), _, _) => (k.as_str(), v.as_str()),
            (_, _, Some(k), Some(v)) => (k.as_str(), v.as_str()),
            _ => continue,
        };
        if let Ok(value) = value.parse() {
            values.insert(key.to_string(), value);
        }
    }
    if values.is_empty() {
        None
    } else {
        Some((tile.to_string(), values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_separated_values() {
        let (tile, values) =
            parse_status_line("ADC0: Enabled 1, State: 15 PLL: 1").expect("parse");
        assert_eq!(tile, "ADC0");
        assert_eq!(values["Enabled"], 1);
        assert_eq!(values["State"], 15);
        assert_eq!(values["PLL"], 1);
    }

    #[test]
    fn parses_space_separated_values() {
        let (tile, values) =
            parse_status_line("DAC1: Enabled 0 State 3 PLL 0").expect("parse");
        assert_eq!(tile, "DAC1");
        assert_eq!(values["Enabled"], 0);
        assert_eq!(values["State"], 3);
        assert_eq!(values["PLL"], 0);
    }

    #[test]
    fn rejects_lines_without_values() {
        assert!(parse_status_line("rfdc").is_none());
        assert!(parse_status_line("ADC0: ").is_none());
    }
}
