//! The two-host path layout used by the experiments.
//!
//! ```text
//!                    turn
//!                     |
//!  h1 -- s2 -- nat1 -- s3 -- nat2 -- s4 -- h2     internet path
//!  h1 ------------- nat3 ------------------ h2     local network path
//!  h1 ------------- s1 -------------------- h2     wifi-direct path
//! ```
//!
//! [`TopologyPlan::new`] turns a [`NetworkConfiguration`] into nodes, links
//! and setup commands; [`build_network`] executes the plan on namespaces.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::command::{Cidr, HostCommand};
use crate::emulator::Emulator;
use crate::error::{Result, SimError};
use crate::topology::{NetnsEmulator, TopologyBuilder};

/// Which paths exist and how slow they are. Delays are per link end, in ms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfiguration {
    pub enable_wifi_direct_path: bool,
    pub enable_local_network_path: bool,
    pub enable_internet_path: bool,
    pub enable_turn_host: bool,
    /// Drop UDP towards the wifi subnet so STUN cannot succeed on that path.
    pub block_stun_on_first_path: bool,
    /// Static SNAT/DNAT on the internet NATs instead of MASQUERADE.
    pub snat: bool,

    pub wifi_direct_path_delay: u32,
    pub local_network_path_delay: u32,
    pub local_network_path_ext_delay: u32,
    pub internet_path_local_delay: u32,
    pub internet_path_local_2_delay: u32,
    pub internet_path_ext_delay: u32,
    pub internet_path_ext_2_delay: u32,
    pub internet_path_turn_delay: u32,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            enable_wifi_direct_path: true,
            enable_local_network_path: true,
            enable_internet_path: true,
            enable_turn_host: true,
            block_stun_on_first_path: false,
            snat: false,
            wifi_direct_path_delay: 3,
            local_network_path_delay: 5,
            local_network_path_ext_delay: 5,
            internet_path_local_delay: 1,
            internet_path_local_2_delay: 1,
            internet_path_ext_delay: 100,
            internet_path_ext_2_delay: 100,
            internet_path_turn_delay: 1,
        }
    }
}

/// Named subsets of the path layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TopologyScenario {
    Single,
    SingleWithLocal,
    SingleWithInternet,
    Full,
}

impl TopologyScenario {
    pub fn as_str(self) -> &'static str {
        match self {
            TopologyScenario::Single => "single",
            TopologyScenario::SingleWithLocal => "single+local",
            TopologyScenario::SingleWithInternet => "single+internet",
            TopologyScenario::Full => "full",
        }
    }

    /// Set the path toggles of `cfg` for this scenario, keeping its delays.
    pub fn configure(self, cfg: NetworkConfiguration) -> NetworkConfiguration {
        let (local, internet) = match self {
            TopologyScenario::Single => (false, false),
            TopologyScenario::SingleWithLocal => (true, false),
            TopologyScenario::SingleWithInternet => (false, true),
            TopologyScenario::Full => (true, true),
        };
        NetworkConfiguration {
            enable_wifi_direct_path: true,
            enable_local_network_path: local,
            enable_internet_path: internet,
            enable_turn_host: internet,
            block_stun_on_first_path: false,
            ..cfg
        }
    }
}

impl FromStr for TopologyScenario {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(TopologyScenario::Single),
            "single+local" => Ok(TopologyScenario::SingleWithLocal),
            "single+internet" => Ok(TopologyScenario::SingleWithInternet),
            "full" | "default" => Ok(TopologyScenario::Full),
            other => Err(SimError::InvalidName(other.to_string())),
        }
    }
}

impl fmt::Display for TopologyScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPlan {
    pub a: (&'static str, &'static str),
    pub b: (&'static str, &'static str),
    pub delay_ms: u32,
}

/// Everything needed to bring up a topology, in creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyPlan {
    pub hosts: Vec<&'static str>,
    pub switches: Vec<&'static str>,
    pub links: Vec<LinkPlan>,
    pub setup: Vec<(&'static str, HostCommand)>,
}

fn link(a: (&'static str, &'static str), b: (&'static str, &'static str), delay_ms: u32) -> LinkPlan {
    LinkPlan { a, b, delay_ms }
}

fn addr(iface: &str, cidr: Cidr) -> HostCommand {
    HostCommand::AddrAdd {
        iface: iface.to_string(),
        cidr,
    }
}

fn cidr(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> Cidr {
    Cidr::new(Ipv4Addr::new(a, b, c, d), prefix)
}

fn iptables(args: &[&str]) -> HostCommand {
    HostCommand::exec("iptables", args)
}

fn forwarding_on() -> HostCommand {
    HostCommand::SysctlWrite {
        key: "net.ipv4.ip_forward".into(),
        value: "1".into(),
    }
}

/// Masquerade towards `ext` and only forward inbound traffic that belongs
/// to a flow opened from `local`.
fn stateful_nat(local: &str, ext: &str) -> Vec<HostCommand> {
    vec![
        iptables(&["-t", "nat", "-A", "POSTROUTING", "-o", ext, "-j", "MASQUERADE"]),
        iptables(&[
            "-A", "FORWARD", "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j", "ACCEPT",
        ]),
        iptables(&["-A", "FORWARD", "-i", local, "-j", "ACCEPT"]),
        iptables(&["-A", "FORWARD", "-j", "REJECT"]),
    ]
}

/// One-to-one source and destination translation between a host and its
/// NAT's external address.
fn static_nat(ext: &str, inner: &str, outer: &str) -> Vec<HostCommand> {
    vec![
        iptables(&[
            "-t", "nat", "-A", "POSTROUTING", "-o", ext, "-s", inner, "-d", "1.20.50.0/24", "-j",
            "SNAT", "--to-source", outer,
        ]),
        iptables(&[
            "-t", "nat", "-A", "PREROUTING", "-i", ext, "-d", outer, "-s", "1.20.50.0/24", "-j",
            "DNAT", "--to-destination", inner,
        ]),
    ]
}

impl TopologyPlan {
    pub fn new(cfg: &NetworkConfiguration) -> Self {
        let mut plan = TopologyPlan {
            hosts: vec!["h1", "h2"],
            switches: vec!["s1"],
            links: Vec::new(),
            setup: Vec::new(),
        };
        if cfg.enable_wifi_direct_path {
            plan.add_wifi_direct(cfg);
        }
        if cfg.enable_local_network_path {
            plan.add_local_network(cfg);
        }
        if cfg.enable_internet_path {
            plan.add_internet(cfg);
        }
        plan
    }

    fn run(&mut self, host: &'static str, commands: impl IntoIterator<Item = HostCommand>) {
        self.setup.extend(commands.into_iter().map(|c| (host, c)));
    }

    fn add_wifi_direct(&mut self, cfg: &NetworkConfiguration) {
        let delay = cfg.wifi_direct_path_delay;
        self.links.push(link(("h1", "h1-wifi"), ("s1", "s1-wifi1"), delay));
        self.links.push(link(("h2", "h2-wifi"), ("s1", "s1-wifi2"), delay));
        self.run("h1", [addr("h1-wifi", cidr(192, 168, 1, 2, 24))]);
        self.run("h2", [addr("h2-wifi", cidr(192, 168, 1, 3, 24))]);
        if cfg.block_stun_on_first_path {
            for (host, iface) in [("h1", "h1-wifi"), ("h2", "h2-wifi")] {
                self.run(
                    host,
                    [iptables(&[
                        "-A", "OUTPUT", "-o", iface, "-p", "udp", "-d", "192.168.1.0/24", "-j",
                        "DROP",
                    ])],
                );
            }
        }
    }

    fn add_local_network(&mut self, cfg: &NetworkConfiguration) {
        self.hosts.push("nat3");
        self.links.push(link(
            ("h1", "h1-eth"),
            ("nat3", "nat3-local"),
            cfg.local_network_path_delay,
        ));
        self.links.push(link(
            ("h2", "h2-eth"),
            ("nat3", "nat3-ext"),
            cfg.local_network_path_ext_delay,
        ));
        self.run("h1", [addr("h1-eth", cidr(172, 16, 1, 10, 24))]);
        self.run("h2", [addr("h2-eth", cidr(172, 16, 2, 20, 24))]);
        self.run(
            "nat3",
            [
                addr("nat3-local", cidr(172, 16, 1, 1, 24)),
                addr("nat3-ext", cidr(172, 16, 2, 1, 24)),
            ],
        );
        self.run(
            "h1",
            [HostCommand::RouteReplace {
                iface: "h1-eth".into(),
                route: vec!["172.16.2.0/24".into(), "via".into(), "172.16.1.1".into()],
            }],
        );
        self.run(
            "h2",
            [HostCommand::RouteReplace {
                iface: "h2-eth".into(),
                route: vec!["172.16.1.0/24".into(), "via".into(), "172.16.2.1".into()],
            }],
        );
        self.run(
            "nat3",
            [forwarding_on(), iptables(&["-F"]), iptables(&["-t", "nat", "-F"])],
        );
        self.run("nat3", stateful_nat("nat3-local", "nat3-ext"));
    }

    fn add_internet(&mut self, cfg: &NetworkConfiguration) {
        self.hosts.extend(["nat1", "nat2"]);
        self.switches.extend(["s2", "s3", "s4"]);
        if cfg.enable_turn_host {
            self.hosts.push("turn");
        }

        self.links.extend([
            link(("h1", "h1-cellular"), ("s2", "s2-eth1"), cfg.internet_path_local_delay),
            link(("h2", "h2-cellular"), ("s4", "s4-eth1"), cfg.internet_path_local_2_delay),
            link(("s2", "s2-eth2"), ("nat1", "nat1-local"), cfg.internet_path_local_delay),
            link(("s4", "s4-eth2"), ("nat2", "nat2-local"), cfg.internet_path_local_2_delay),
            link(("nat1", "nat1-ext"), ("s3", "s3-eth1"), cfg.internet_path_ext_delay),
            link(("nat2", "nat2-ext"), ("s3", "s3-eth2"), cfg.internet_path_ext_2_delay),
        ]);
        if cfg.enable_turn_host {
            self.links.push(link(
                ("turn", "turn-eth0"),
                ("s3", "s3-eth3"),
                cfg.internet_path_turn_delay,
            ));
        }

        self.run("h1", [addr("h1-cellular", cidr(1, 20, 30, 2, 28))]);
        self.run("h2", [addr("h2-cellular", cidr(2, 40, 60, 3, 28))]);
        self.run(
            "nat1",
            [
                addr("nat1-local", cidr(1, 20, 30, 1, 28)),
                addr("nat1-ext", cidr(1, 20, 50, 10, 24)),
            ],
        );
        self.run(
            "nat2",
            [
                addr("nat2-local", cidr(2, 40, 60, 1, 28)),
                addr("nat2-ext", cidr(1, 20, 50, 20, 24)),
            ],
        );
        if cfg.enable_turn_host {
            self.run("turn", [addr("turn-eth0", cidr(1, 20, 50, 100, 24))]);
        }

        self.run(
            "h1",
            [HostCommand::DefaultRoute {
                iface: "h1-cellular".into(),
                gateway: Ipv4Addr::new(1, 20, 30, 1),
            }],
        );
        self.run(
            "h2",
            [HostCommand::DefaultRoute {
                iface: "h2-cellular".into(),
                gateway: Ipv4Addr::new(2, 40, 60, 1),
            }],
        );

        for (nat, local, ext, inner, outer) in [
            ("nat1", "nat1-local", "nat1-ext", "1.20.30.2", "1.20.50.10"),
            ("nat2", "nat2-local", "nat2-ext", "2.40.60.3", "1.20.50.20"),
        ] {
            self.run(
                nat,
                [forwarding_on(), iptables(&["-F"]), iptables(&["-t", "nat", "-F"])],
            );
            if cfg.snat {
                self.run(nat, static_nat(ext, inner, outer));
            } else {
                self.run(nat, stateful_nat(local, ext));
            }
        }
    }
}

/// Create the namespaces, links and NAT rules described by `cfg`.
pub fn build_network(prefix: &str, cfg: &NetworkConfiguration) -> Result<NetnsEmulator> {
    let plan = TopologyPlan::new(cfg);
    let mut builder = TopologyBuilder::new(prefix);
    for host in &plan.hosts {
        builder.add_host(host)?;
    }
    for switch in &plan.switches {
        builder.add_switch(switch)?;
    }
    for l in &plan.links {
        builder.add_link(l.a, l.b, Some(l.delay_ms))?;
    }
    let emulator = builder.build();

    for (host, command) in &plan.setup {
        let host_ref = emulator.host(host)?;
        emulator.run(&host_ref, command)?.checked(host, command)?;
    }
    tracing::info!(
        hosts = plan.hosts.len(),
        switches = plan.switches.len(),
        links = plan.links.len(),
        "network ready"
    );
    Ok(emulator)
}
