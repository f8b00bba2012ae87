//! Finding radios: local USB serial ports and hosts answering on the device TCP port.
//!
//! Network candidates come from the host's own IPv4 interfaces (loopback and container
//! bridges excluded) plus configured CIDR ranges. Each range is ping-swept with
//! `nmap -sn -oG -` when nmap is installed; otherwise ranges of at most 256 addresses are
//! swept with plain TCP connects. Every candidate is confirmed with a connect to the device
//! port before it is registered.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};

use super::{DeviceInfo, DeviceKind, Registry};
use crate::config::DevicesConfig;
use crate::metrics;

/// Largest range the TCP fallback sweep will walk.
pub const FALLBACK_SWEEP_MAX: u64 = 256;

/// An IPv4 network in CIDR form, normalised to its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix > 32 {
            return None;
        }
        let mask = Self::mask(prefix);
        Some(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    pub fn from_netmask(addr: Ipv4Addr, netmask: Ipv4Addr) -> Option<Self> {
        let prefix = u32::from(netmask).count_ones() as u8;
        Self::new(addr, prefix)
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn num_addresses(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    /// Usable host addresses: network and broadcast are skipped for prefixes below /31.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let start = u64::from(u32::from(self.network));
        let count = self.num_addresses();
        let (first, last) = if self.prefix >= 31 {
            (start, start + count - 1)
        } else {
            (start + 1, start + count - 2)
        };
        (first..=last).map(|n| Ipv4Addr::from(n as u32))
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Parse `a.b.c.d/n`; a bare address is a /32.
pub fn parse_cidr(s: &str) -> Option<Ipv4Cidr> {
    let s = s.trim();
    let (addr, prefix) = match s.split_once('/') {
        Some((a, p)) => (a, p.parse::<u8>().ok()?),
        None => (s, 32),
    };
    Ipv4Cidr::new(addr.parse().ok()?, prefix)
}

/// Pull `Up` hosts out of nmap grepable output.
pub fn parse_nmap_hosts(output: &str) -> Vec<Ipv4Addr> {
    output
        .lines()
        .filter(|l| l.starts_with("Host:") && l.contains("Status: Up"))
        .filter_map(|l| l.split_whitespace().nth(1))
        .filter_map(|ip| ip.trim_matches(|c| c == '(' || c == ')').parse().ok())
        .collect()
}

/// Interfaces to skip when auto-detecting networks.
pub fn skip_interface(name: &str) -> bool {
    name.starts_with("lo") || name.starts_with("docker") || name.starts_with("br-")
}

/// IPv4 networks of the host's own interfaces.
pub fn local_networks() -> Vec<Ipv4Cidr> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(i) => i,
        Err(e) => {
            warn!("Failed to list network interfaces: {}", e);
            return Vec::new();
        }
    };
    let mut out = BTreeSet::new();
    for iface in interfaces {
        if iface.is_loopback() || skip_interface(&iface.name) {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = &iface.addr {
            if let Some(net) = Ipv4Cidr::from_netmask(v4.ip, v4.netmask) {
                debug!("Detected local network {} on {}", net, iface.name);
                out.insert(net);
            }
        }
    }
    out.into_iter().collect()
}

/// USB serial ports that look like radios.
#[cfg(feature = "serial")]
pub fn usb_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .filter(|p| {
                matches!(p.port_type, serialport::SerialPortType::UsbPort(_))
                    || p.port_name.contains("ttyUSB")
                    || p.port_name.contains("ttyACM")
            })
            .map(|p| p.port_name)
            .collect(),
        Err(e) => {
            warn!("USB discovery failed: {}", e);
            Vec::new()
        }
    }
}

#[cfg(not(feature = "serial"))]
pub fn usb_ports() -> Vec<String> {
    Vec::new()
}

fn usb_name(port: &str) -> String {
    format!("USB-{}", port.rsplit('/').next().unwrap_or(port))
}

/// True when something accepts a TCP connection on `ip:port` within `wait`.
pub async fn tcp_port_open(ip: Ipv4Addr, port: u16, wait: Duration) -> bool {
    let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
    matches!(time::timeout(wait, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub usb_enabled: bool,
    pub scan_enabled: bool,
    pub auto_detect_networks: bool,
    pub manual_networks: Vec<Ipv4Cidr>,
    pub tcp_port: u16,
    pub connect_check_timeout: Duration,
    pub nmap_timeout: Duration,
}

impl DiscoverySettings {
    pub fn from_config(devices: &DevicesConfig) -> Self {
        Self {
            usb_enabled: devices.usb_enabled,
            scan_enabled: devices.scan_enabled,
            auto_detect_networks: devices.auto_detect_networks,
            manual_networks: devices
                .manual_networks
                .iter()
                .filter_map(|n| parse_cidr(n))
                .collect(),
            tcp_port: devices.tcp_port,
            connect_check_timeout: Duration::from_millis(devices.connect_check_timeout_ms),
            nmap_timeout: Duration::from_secs(devices.nmap_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub usb_added: usize,
    pub tcp_added: usize,
    pub networks_scanned: usize,
}

pub struct Discovery {
    registry: Arc<Registry>,
    settings: DiscoverySettings,
}

impl Discovery {
    pub fn new(registry: Arc<Registry>, settings: DiscoverySettings) -> Self {
        Self { registry, settings }
    }

    fn register(&self, device: DeviceInfo) -> bool {
        let label = format!("{} ({})", device.name, device.address);
        let added = self.registry.insert_if_absent(device);
        if added {
            info!("New device discovered: {}", label);
            metrics::inc_devices_discovered();
        }
        added
    }

    pub fn discover_usb(&self, now: DateTime<Utc>) -> usize {
        usb_ports()
            .into_iter()
            .filter(|port| {
                self.register(DeviceInfo::new(
                    DeviceKind::Serial,
                    port,
                    Some(&usb_name(port)),
                    now,
                ))
            })
            .count()
    }

    /// Networks to sweep this round, deduplicated.
    pub fn networks(&self) -> Vec<Ipv4Cidr> {
        let mut set: BTreeSet<Ipv4Cidr> = self.settings.manual_networks.iter().copied().collect();
        if self.settings.auto_detect_networks {
            set.extend(local_networks());
        }
        set.into_iter().collect()
    }

    /// Register confirmed responders among `hosts`.
    pub async fn register_responders(&self, hosts: Vec<Ipv4Addr>, now: DateTime<Utc>) -> usize {
        let port = self.settings.tcp_port;
        let wait = self.settings.connect_check_timeout;
        let mut checks = JoinSet::new();
        for ip in hosts {
            if self.registry.contains(&format!("{}:{}", ip, port)) {
                continue;
            }
            checks.spawn(async move { (ip, tcp_port_open(ip, port, wait).await) });
        }
        let mut added = 0;
        while let Some(joined) = checks.join_next().await {
            let Ok((ip, true)) = joined else {
                continue;
            };
            let address = format!("{}:{}", ip, port);
            let name = format!("WiFi-{}", ip);
            if self.register(DeviceInfo::new(DeviceKind::Tcp, &address, Some(&name), now)) {
                added += 1;
            }
        }
        added
    }

    /// Candidate hosts of one network: nmap when available, else every host of a small range.
    async fn sweep(&self, net: Ipv4Cidr) -> Vec<Ipv4Addr> {
        let target = net.to_string();
        let mut cmd = tokio::process::Command::new("nmap");
        cmd.args(["-sn", "-oG", "-", target.as_str()])
            .kill_on_drop(true);
        match time::timeout(self.settings.nmap_timeout, cmd.output()).await {
            Ok(Ok(output)) => parse_nmap_hosts(&String::from_utf8_lossy(&output.stdout)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                if net.num_addresses() > FALLBACK_SWEEP_MAX {
                    warn!(
                        "nmap not found and {} is too large for a connect sweep (>{} hosts)",
                        net, FALLBACK_SWEEP_MAX
                    );
                    return Vec::new();
                }
                debug!("nmap not found, sweeping {} with TCP connects", net);
                net.hosts().collect()
            }
            Ok(Err(e)) => {
                warn!("Network scan of {} failed: {}", net, e);
                Vec::new()
            }
            Err(_) => {
                warn!("Network scan timeout for {}", net);
                Vec::new()
            }
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        if self.settings.usb_enabled {
            report.usb_added = self.discover_usb(now);
        }
        if self.settings.scan_enabled {
            let networks = self.networks();
            if networks.is_empty() {
                debug!("No networks to scan");
            }
            for net in networks {
                let hosts = self.sweep(net).await;
                report.tcp_added += self.register_responders(hosts, now).await;
                report.networks_scanned += 1;
            }
        }
        info!(
            "Discovery complete: {} registered devices ({} new)",
            self.registry.len(),
            report.usb_added + report.tcp_added
        );
        report
    }

    /// Run a discovery round every `cadence` until shutdown flips to true.
    pub async fn run(self, cadence: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("discovery task stopped");
    }
}
