//! FPGA address discovery with layered fallbacks.
//!
//! The board usually sits on a direct ethernet link with no DHCP, so no
//! single addressing scheme is reliable in the field. Three strategies are
//! tried in strict order, stopping at the first address that accepts a TCP
//! connection on the KATCP control port:
//!
//! 1. Hostname resolution: a caller-supplied hint followed by the
//!    well-known names the board advertises, deduplicated preserving order.
//! 2. The hardcoded link-local IPv4 fallback.
//! 3. IPv6 neighbor discovery: ping the all-nodes multicast group on each
//!    physical interface, then probe any `fe80::` neighbors that show up in
//!    the kernel neighbor table, scoped to that interface.
//!
//! Individual failures (resolution, refused connects, timeouts) are logged
//! and swallowed; only total exhaustion is an error. Nothing here mutates
//! persistent state.

use std::net::{IpAddr, SocketAddr, SocketAddrV6, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};

/// KATCP control port the probe targets.
pub const CONTROL_PORT: u16 = 7147;

/// Hostnames the board is known to answer to, tried after the caller hint.
const FALLBACK_HOSTNAMES: [&str; 3] = ["rfsoc", "localhost.localdomain", "localhost"];

/// A resolved, probe-tested device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAddress {
    pub addr: SocketAddr,
    /// True when a TCP connect to the control port succeeded during
    /// discovery. Always true for addresses returned by [`Locator::locate`].
    pub probed: bool,
}

/// Liveness test for a candidate address. Injectable so ordering tests run
/// without sockets.
pub trait ConnectProbe {
    fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool;
}

/// Real probe: a bounded TCP connect, immediately dropped.
pub struct TcpProbe;

impl ConnectProbe for TcpProbe {
    fn probe(&self, addr: SocketAddr, timeout: Duration) -> bool {
        TcpStream::connect_timeout(&addr, timeout).is_ok()
    }
}

/// Hostname resolution seam, defaulting to the system resolver.
pub trait HostResolver {
    fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// System resolver via `ToSocketAddrs`.
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok((host, CONTROL_PORT)
            .to_socket_addrs()?
            .map(|sa| sa.ip())
            .collect())
    }
}

/// The three-stage discovery chain.
pub struct Locator {
    hint: Option<String>,
    fallback_ip: String,
    timeout: Duration,
    resolver: Box<dyn HostResolver>,
    probe: Box<dyn ConnectProbe>,
}

impl Locator {
    pub fn new(hint: Option<String>, fallback_ip: String, timeout: Duration) -> Self {
        Locator {
            hint,
            fallback_ip,
            timeout,
            resolver: Box::new(SystemResolver),
            probe: Box::new(TcpProbe),
        }
    }

    /// Replace the resolver and probe (tests).
    pub fn with_network(
        mut self,
        resolver: Box<dyn HostResolver>,
        probe: Box<dyn ConnectProbe>,
    ) -> Self {
        self.resolver = resolver;
        self.probe = probe;
        self
    }

    /// Run the fallback chain; returns the first responsive address.
    pub fn locate(&self) -> ControlResult<DeviceAddress> {
        if let Some(found) = self.try_hostnames() {
            return Ok(found);
        }
        if let Some(found) = self.try_hardcoded() {
            return Ok(found);
        }
        if let Some(found) = self.try_ipv6_neighbors() {
            return Ok(found);
        }
        Err(ControlError::DiscoveryExhausted)
    }

    /// Candidate hostnames: hint first, then the fixed list, deduplicated
    /// preserving order.
    fn candidate_hostnames(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        if let Some(hint) = &self.hint {
            names.push(hint.clone());
        }
        for name in FALLBACK_HOSTNAMES {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    fn try_hostnames(&self) -> Option<DeviceAddress> {
        for hostname in self.candidate_hostnames() {
            let ips = match self.resolver.resolve(&hostname) {
                Ok(ips) => ips,
                Err(e) => {
                    debug!(hostname, error = %e, "hostname did not resolve");
                    continue;
                }
            };
            for ip in ips {
                let addr = SocketAddr::new(ip, CONTROL_PORT);
                debug!(hostname, %addr, "probing resolved address");
                if self.probe.probe(addr, self.timeout) {
                    info!(hostname, %addr, "FPGA responsive via hostname");
                    return Some(DeviceAddress { addr, probed: true });
                }
                debug!(%addr, "not responding on KATCP port");
            }
        }
        None
    }

    fn try_hardcoded(&self) -> Option<DeviceAddress> {
        let ip: IpAddr = match self.fallback_ip.parse() {
            Ok(ip) => ip,
            Err(e) => {
                warn!(fallback = %self.fallback_ip, error = %e, "bad hardcoded address");
                return None;
            }
        };
        let addr = SocketAddr::new(ip, CONTROL_PORT);
        debug!(%addr, "probing hardcoded address");
        if self.probe.probe(addr, self.timeout) {
            info!(%addr, "FPGA responsive at hardcoded address");
            return Some(DeviceAddress { addr, probed: true });
        }
        debug!(%addr, "hardcoded address not responding");
        None
    }

    fn try_ipv6_neighbors(&self) -> Option<DeviceAddress> {
        let interfaces = match physical_interfaces() {
            Ok(ifaces) => ifaces,
            Err(e) => {
                warn!(error = %e, "could not enumerate network interfaces");
                return None;
            }
        };
        for iface in interfaces {
            // One all-nodes multicast ping populates the neighbor table.
            let _ = Command::new("ping")
                .args(["-6", "-c", "1", &format!("ff02::1%{iface}")])
                .output();

            let neighbors = match link_local_neighbors(&iface) {
                Ok(neighbors) => neighbors,
                Err(e) => {
                    debug!(iface, error = %e, "neighbor table query failed");
                    continue;
                }
            };
            let scope = match interface_scope_id(&iface) {
                Some(scope) => scope,
                None => continue,
            };
            for neighbor in neighbors {
                let addr =
                    SocketAddr::V6(SocketAddrV6::new(neighbor, CONTROL_PORT, 0, scope));
                debug!(%addr, iface, "probing IPv6 link-local neighbor");
                if self.probe.probe(addr, self.timeout) {
                    info!(%addr, iface, "FPGA responsive at link-local address");
                    return Some(DeviceAddress { addr, probed: true });
                }
            }
        }
        None
    }
}

/// Non-loopback, non-virtual interfaces from sysfs.
fn physical_interfaces() -> std::io::Result<Vec<String>> {
    let mut interfaces = Vec::new();
    for entry in std::fs::read_dir("/sys/class/net")? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name == "lo"
            || name.starts_with("docker")
            || name.starts_with("veth")
            || name.starts_with("virbr")
            || name.starts_with("br-")
        {
            continue;
        }
        interfaces.push(name);
    }
    interfaces.sort();
    Ok(interfaces)
}

/// Kernel interface index, used as the IPv6 scope id for link-local connects.
fn interface_scope_id(iface: &str) -> Option<u32> {
    let path = Path::new("/sys/class/net").join(iface).join("ifindex");
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// `fe80::` neighbors on one interface, parsed from `ip neigh show`.
fn link_local_neighbors(iface: &str) -> std::io::Result<Vec<std::net::Ipv6Addr>> {
    let output = Command::new("ip").args(["neigh", "show"]).output()?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(parse_neighbor_table(&text, iface))
}

fn parse_neighbor_table(table: &str, iface: &str) -> Vec<std::net::Ipv6Addr> {
    // ip-neigh lines look like: "fe80::1234 dev eth0 lladdr aa:bb:... REACHABLE"
    static NEIGHBOR_LINE: OnceLock<Regex> = OnceLock::new();
    let pattern = NEIGHBOR_LINE.get_or_init(|| {
        Regex::new(r"(?m)^(fe80::[0-9a-f:]+)\s+dev\s+(\S+)").expect("static pattern")
    });
    pattern
        .captures_iter(table)
        .filter(|c| &c[2] == iface)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::Ipv4Addr;
    use std::rc::Rc;

    struct FixedResolver(Vec<(&'static str, IpAddr)>);

    impl HostResolver for FixedResolver {
        fn resolve(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
            let hits: Vec<IpAddr> = self
                .0
                .iter()
                .filter(|(name, _)| *name == host)
                .map(|(_, ip)| *ip)
                .collect();
            if hits.is_empty() {
                Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such host",
                ))
            } else {
                Ok(hits)
            }
        }
    }

    /// Records every probed address; answers true only for `accept`.
    struct ScriptedProbe {
        accept: Option<SocketAddr>,
        probed: Rc<RefCell<Vec<SocketAddr>>>,
    }

    impl ConnectProbe for ScriptedProbe {
        fn probe(&self, addr: SocketAddr, _timeout: Duration) -> bool {
            self.probed.borrow_mut().push(addr);
            self.accept == Some(addr)
        }
    }

    fn hardcoded() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(169, 254, 2, 181)), CONTROL_PORT)
    }

    #[test]
    fn hint_deduplicates_preserving_order() {
        let locator = Locator::new(
            Some("rfsoc".into()),
            "169.254.2.181".into(),
            Duration::from_secs(1),
        );
        assert_eq!(
            locator.candidate_hostnames(),
            ["rfsoc", "localhost.localdomain", "localhost"]
        );

        let locator = Locator::new(
            Some("bench-rfsoc".into()),
            "169.254.2.181".into(),
            Duration::from_secs(1),
        );
        assert_eq!(
            locator.candidate_hostnames(),
            ["bench-rfsoc", "rfsoc", "localhost.localdomain", "localhost"]
        );
    }

    #[test]
    fn resolution_success_with_probe_failure_still_reaches_hardcoded() {
        let resolved: IpAddr = "10.0.0.9".parse().unwrap();
        let probed = Rc::new(RefCell::new(Vec::new()));
        let probe = Box::new(ScriptedProbe {
            accept: Some(hardcoded()),
            probed: probed.clone(),
        });
        let locator = Locator::new(
            Some("rfsoc".into()),
            "169.254.2.181".into(),
            Duration::from_secs(1),
        )
        .with_network(Box::new(FixedResolver(vec![("rfsoc", resolved)])), probe);

        let found = locator.locate().expect("hardcoded address should win");
        assert_eq!(found.addr, hardcoded());
        assert!(found.probed);
        // The resolved address was probed first, then the hardcoded one.
        let order = probed.borrow().clone();
        assert_eq!(order[0], SocketAddr::new(resolved, CONTROL_PORT));
        assert!(order.contains(&hardcoded()));
    }

    #[test]
    fn first_responsive_hostname_short_circuits() {
        let resolved: IpAddr = "10.0.0.9".parse().unwrap();
        let target = SocketAddr::new(resolved, CONTROL_PORT);
        let probed = Rc::new(RefCell::new(Vec::new()));
        let probe = Box::new(ScriptedProbe {
            accept: Some(target),
            probed: probed.clone(),
        });
        let locator = Locator::new(
            Some("rfsoc".into()),
            "169.254.2.181".into(),
            Duration::from_secs(1),
        )
        .with_network(Box::new(FixedResolver(vec![("rfsoc", resolved)])), probe);

        let found = locator.locate().expect("hostname should win");
        assert_eq!(found.addr, target);
        assert_eq!(*probed.borrow(), vec![target]);
    }

    #[test]
    fn neighbor_table_parse_filters_interface() {
        let table = "fe80::aa:1 dev eth0 lladdr 02:00:00:00:00:01 REACHABLE\n\
                     fe80::bb:2 dev eth1 lladdr 02:00:00:00:00:02 STALE\n\
                     169.254.2.181 dev eth0 lladdr 02:00:00:00:00:03 REACHABLE\n";
        let neighbors = parse_neighbor_table(table, "eth0");
        assert_eq!(neighbors, vec!["fe80::aa:1".parse::<std::net::Ipv6Addr>().unwrap()]);
    }
}
