//! Typed host commands.
//!
//! Everything the engine does to a topology goes through a [`HostCommand`],
//! rendered to an argv and executed without a shell. Names are validated up
//! front so a malformed interface fails at call time instead of inside `ip`.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::Serialize;

use crate::conntrack::ConntrackFilter;
use crate::error::{Result, SimError};
use crate::impairment::{NetemRule, NetemVerb};

/// Linux interface name limit (IFNAMSIZ - 1).
pub const MAX_NAME_LEN: usize = 15;

/// Reject names that would not survive as a single `ip` argument.
pub fn validate_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if name.is_empty() || name.len() > MAX_NAME_LEN || !valid_chars {
        return Err(SimError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// `(host, interface)` key used by the interface state store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InterfaceId {
    pub host: String,
    pub iface: String,
}

impl InterfaceId {
    pub fn new(host: &str, iface: &str) -> Result<Self> {
        validate_name(host)?;
        validate_name(iface)?;
        Ok(Self {
            host: host.to_string(),
            iface: iface.to_string(),
        })
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.iface)
    }
}

/// An IPv4 address with its prefix length, e.g. `172.16.1.10/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        Self {
            addr,
            prefix: prefix.min(32),
        }
    }
}

impl FromStr for Cidr {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| SimError::InvalidName(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| SimError::InvalidName(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| SimError::InvalidName(s.to_string()))?;
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Extract every `inet A.B.C.D/N` token from `ip addr show` output, in order.
pub fn parse_inet_addrs(output: &str) -> Vec<Cidr> {
    let mut addrs = Vec::new();
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(tok) = tokens.next() {
            if tok != "inet" {
                continue;
            }
            if let Some(cidr) = tokens.next().and_then(|t| t.parse::<Cidr>().ok()) {
                addrs.push(cidr);
            }
        }
    }
    addrs
}

/// Split `ip route show dev X` output into per-route token lists that can be
/// fed back to `ip route replace`.
///
/// Status flags that `ip` prints but does not accept as input are dropped.
pub fn parse_routes(output: &str) -> Vec<Vec<String>> {
    output
        .lines()
        .map(|line| {
            line.split_whitespace()
                .filter(|tok| !matches!(*tok, "linkdown" | "dead"))
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|tokens| !tokens.is_empty())
        .collect()
}

/// Administrative state of a link or interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Up,
    Down,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkStatus::Up => "up",
            LinkStatus::Down => "down",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output layout requested from `conntrack -L`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConntrackFormat {
    Plain,
    Extended,
}

/// One operation executed inside an emulated host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    AddrShow { iface: String },
    AddrAdd { iface: String, cidr: Cidr },
    AddrFlush { iface: String },
    LinkSet { iface: String, status: LinkStatus },
    RouteShow { iface: Option<String> },
    RouteReplace { iface: String, route: Vec<String> },
    DefaultRoute { iface: String, gateway: Ipv4Addr },
    Netem {
        verb: NetemVerb,
        iface: String,
        rule: NetemRule,
    },
    ConntrackList { format: ConntrackFormat },
    ConntrackDelete { filter: ConntrackFilter },
    SysctlRead { key: String },
    SysctlWrite { key: String, value: String },
    /// Escape hatch used while bootstrapping a topology (iptables, forwarding).
    Exec { program: String, args: Vec<String> },
}

impl HostCommand {
    pub fn exec(program: &str, args: &[&str]) -> Self {
        HostCommand::Exec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn argv(&self) -> Vec<String> {
        fn v(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }
        match self {
            HostCommand::AddrShow { iface } => {
                v(&["ip", "-4", "addr", "show", "dev", iface.as_str()])
            }
            HostCommand::AddrAdd { iface, cidr } => {
                let cidr = cidr.to_string();
                v(&["ip", "addr", "add", cidr.as_str(), "dev", iface.as_str()])
            }
            HostCommand::AddrFlush { iface } => v(&["ip", "addr", "flush", "dev", iface.as_str()]),
            HostCommand::LinkSet { iface, status } => {
                v(&["ip", "link", "set", "dev", iface.as_str(), status.as_str()])
            }
            HostCommand::RouteShow { iface: None } => v(&["ip", "route", "show"]),
            HostCommand::RouteShow { iface: Some(iface) } => {
                v(&["ip", "route", "show", "dev", iface.as_str()])
            }
            HostCommand::RouteReplace { iface, route } => {
                let mut argv = v(&["ip", "route", "replace"]);
                argv.extend(route.iter().cloned());
                argv.extend(v(&["dev", iface.as_str()]));
                argv
            }
            HostCommand::DefaultRoute { iface, gateway } => {
                let gateway = gateway.to_string();
                v(&[
                    "ip",
                    "route",
                    "replace",
                    "default",
                    "via",
                    gateway.as_str(),
                    "dev",
                    iface.as_str(),
                ])
            }
            HostCommand::Netem { verb, iface, rule } => {
                let mut argv = v(&[
                    "tc",
                    "qdisc",
                    verb.as_str(),
                    "dev",
                    iface.as_str(),
                    "root",
                    "netem",
                ]);
                argv.extend(rule.args());
                argv
            }
            HostCommand::ConntrackList {
                format: ConntrackFormat::Plain,
            } => v(&["conntrack", "-L"]),
            HostCommand::ConntrackList {
                format: ConntrackFormat::Extended,
            } => v(&["conntrack", "-L", "-o", "extended"]),
            HostCommand::ConntrackDelete { filter } => {
                let mut argv = v(&["conntrack", "-D"]);
                argv.extend(filter.args());
                argv
            }
            HostCommand::SysctlRead { key } => v(&["sysctl", "-n", key.as_str()]),
            HostCommand::SysctlWrite { key, value } => {
                let assignment = format!("{key}={value}");
                v(&["sysctl", "-w", assignment.as_str()])
            }
            HostCommand::Exec { program, args } => {
                let mut argv = vec![program.clone()];
                argv.extend(args.iter().cloned());
                argv
            }
        }
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

/// Captured result of a synchronous host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into [`SimError::CommandFailed`].
    pub fn checked(self, host: &str, command: &HostCommand) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(SimError::CommandFailed {
            host: host.to_string(),
            command: command.to_string(),
            status: self.status,
            stderr: self.stderr.trim().to_string(),
        })
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR_SHOW: &str = "\
4: h1-eth@if5: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc netem state UP group default qlen 1000 link-netns nat3
    inet 172.16.1.10/24 brd 172.16.1.255 scope global h1-eth
       valid_lft forever preferred_lft forever
    inet 172.16.1.11/24 scope global secondary h1-eth
       valid_lft forever preferred_lft forever
";

    #[test]
    fn inet_tokens_are_extracted_in_order() {
        let addrs = parse_inet_addrs(ADDR_SHOW);
        assert_eq!(
            addrs,
            vec![
                "172.16.1.10/24".parse::<Cidr>().unwrap(),
                "172.16.1.11/24".parse::<Cidr>().unwrap(),
            ]
        );
        assert!(parse_inet_addrs("").is_empty());
        assert!(parse_inet_addrs("    inet6 fe80::1/64 scope link").is_empty());
    }

    #[test]
    fn cidr_rejects_garbage() {
        assert!("10.0.0.1".parse::<Cidr>().is_err());
        assert!("10.0.0.1/33".parse::<Cidr>().is_err());
        assert!("nope/24".parse::<Cidr>().is_err());
        assert_eq!(
            "1.20.30.2/28".parse::<Cidr>().unwrap().to_string(),
            "1.20.30.2/28"
        );
    }

    #[test]
    fn names_are_validated() {
        assert!(InterfaceId::new("h1", "h1-cellular").is_ok());
        assert!(InterfaceId::new("h1", "").is_err());
        assert!(InterfaceId::new("h1", "eth0; rm -rf /").is_err());
        assert!(InterfaceId::new("h1", "an-interface-name-too-long").is_err());
    }

    #[test]
    fn routes_drop_status_flags() {
        let out = "default via 1.20.30.1 linkdown\n1.20.30.0/28 proto kernel scope link src 1.20.30.2\n\n";
        let routes = parse_routes(out);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0], vec!["default", "via", "1.20.30.1"]);

        let cmd = HostCommand::RouteReplace {
            iface: "h1-cellular".into(),
            route: routes[0].clone(),
        };
        assert_eq!(
            cmd.to_string(),
            "ip route replace default via 1.20.30.1 dev h1-cellular"
        );
    }

    #[test]
    fn checked_reports_stderr() {
        let out = CommandOutput {
            status: Some(2),
            stdout: String::new(),
            stderr: "RTNETLINK answers: File exists\n".into(),
        };
        let cmd = HostCommand::AddrFlush {
            iface: "h1-eth".into(),
        };
        match out.checked("h1", &cmd) {
            Err(SimError::CommandFailed { stderr, status, .. }) => {
                assert_eq!(status, Some(2));
                assert_eq!(stderr, "RTNETLINK answers: File exists");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
