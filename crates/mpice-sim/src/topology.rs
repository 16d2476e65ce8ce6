//! Namespace-backed emulator.
//!
//! Hosts are network namespaces, switches are namespaces holding one Linux
//! bridge, links are veth pairs created directly inside the two namespaces
//! and shaped with a root `netem` qdisc. Everything is torn down when the
//! [`NetnsEmulator`] is dropped.

use std::process::Command;
use std::sync::Mutex;

use crate::command::{validate_name, CommandOutput, HostCommand, LinkStatus};
use crate::emulator::{Emulator, Endpoint, HostRef, LinkInfo, NodeInfo, NodeKind};
use crate::error::{Result, SimError};
use crate::impairment::{NetemRule, NetemVerb};
use crate::process::{NamespaceProcess, ProcessHandle, ProcessSpec};

/// Bridge device created inside every switch namespace.
pub const SWITCH_BRIDGE: &str = "br0";

/// Whether host commands need to go through `sudo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Sudo,
    Direct,
}

impl Privilege {
    /// `Direct` when already running as root.
    pub fn detect() -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail.
        if unsafe { libc::geteuid() } == 0 {
            Privilege::Direct
        } else {
            Privilege::Sudo
        }
    }

    pub fn command(self, program: &str) -> Command {
        match self {
            Privilege::Sudo => {
                let mut cmd = Command::new("sudo");
                cmd.arg(program);
                cmd
            }
            Privilege::Direct => Command::new(program),
        }
    }
}

fn output_of(cmd: &mut Command) -> Result<CommandOutput> {
    Ok(cmd.output()?.into())
}

/// A Linux network namespace managed via `ip netns`.
///
/// Creates the namespace on construction, brings up loopback, and deletes
/// the namespace on drop.
pub struct Namespace {
    name: String,
    privilege: Privilege,
}

impl Namespace {
    pub fn new(name: &str, privilege: Privilege) -> Result<Self> {
        // leftovers from an interrupted run
        let _ = privilege.command("ip").args(["netns", "del", name]).output();

        let add = HostCommand::exec("ip", &["netns", "add", name]);
        output_of(privilege.command("ip").args(["netns", "add", name]))?.checked("root", &add)?;

        let ns = Self {
            name: name.to_string(),
            privilege,
        };
        ns.exec(&HostCommand::LinkSet {
            iface: "lo".into(),
            status: LinkStatus::Up,
        })?
        .checked(name, &HostCommand::exec("ip", &["link", "set", "lo", "up"]))?;
        Ok(ns)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `[sudo] ip netns exec <ns> <program>`, ready for more arguments.
    pub fn command(&self, program: &str) -> Command {
        let mut cmd = self.privilege.command("ip");
        cmd.args(["netns", "exec", self.name.as_str(), program]);
        cmd
    }

    pub fn exec(&self, command: &HostCommand) -> Result<CommandOutput> {
        let argv = command.argv();
        let Some((program, args)) = argv.split_first() else {
            return Ok(CommandOutput::default());
        };
        output_of(self.command(program).args(args))
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        let _ = self
            .privilege
            .command("ip")
            .args(["netns", "del", self.name.as_str()])
            .status();
    }
}

struct Node {
    name: String,
    kind: NodeKind,
    namespace: Namespace,
    interfaces: Vec<String>,
}

/// Incrementally creates namespaces, bridges and veth links.
///
/// Every resource is owned by a [`Namespace`] as soon as it exists, so a
/// failed build cleans up after itself when the builder is dropped.
pub struct TopologyBuilder {
    prefix: String,
    privilege: Privilege,
    nodes: Vec<Node>,
    links: Vec<LinkInfo>,
}

impl TopologyBuilder {
    /// `prefix` keeps concurrent topologies apart in the netns namespace list.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            privilege: Privilege::detect(),
            nodes: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    fn add_node(&mut self, name: &str, kind: NodeKind) -> Result<&Node> {
        validate_name(name)?;
        if self.nodes.iter().any(|n| n.name == name) {
            return Err(SimError::InvalidName(name.to_string()));
        }
        let namespace = Namespace::new(&format!("{}-{}", self.prefix, name), self.privilege)?;
        tracing::debug!(node = name, ns = namespace.name(), ?kind, "created node");
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
            namespace,
            interfaces: Vec::new(),
        });
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    pub fn add_host(&mut self, name: &str) -> Result<()> {
        self.add_node(name, NodeKind::Host).map(|_| ())
    }

    pub fn add_switch(&mut self, name: &str) -> Result<()> {
        let ns = &self.add_node(name, NodeKind::Switch)?.namespace;
        let add = HostCommand::exec("ip", &["link", "add", SWITCH_BRIDGE, "type", "bridge"]);
        ns.exec(&add)?.checked(name, &add)?;
        let up = HostCommand::LinkSet {
            iface: SWITCH_BRIDGE.into(),
            status: LinkStatus::Up,
        };
        ns.exec(&up)?.checked(name, &up)?;
        Ok(())
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut Node> {
        self.nodes
            .iter_mut()
            .find(|n| n.name == name)
            .ok_or_else(|| SimError::HostNotFound(name.to_string()))
    }

    /// Connect `a:a_iface` to `b:b_iface`. A delay installs a root netem
    /// qdisc on both ends, which later loss changes modify in place.
    pub fn add_link(
        &mut self,
        (a, a_iface): (&str, &str),
        (b, b_iface): (&str, &str),
        delay_ms: Option<u32>,
    ) -> Result<()> {
        validate_name(a_iface)?;
        validate_name(b_iface)?;
        let a_ns = self.node_mut(a)?.namespace.name().to_string();
        let b_ns = self.node_mut(b)?.namespace.name().to_string();

        let create = HostCommand::exec(
            "ip",
            &[
                "link",
                "add",
                a_iface,
                "netns",
                a_ns.as_str(),
                "type",
                "veth",
                "peer",
                "name",
                b_iface,
                "netns",
                b_ns.as_str(),
            ],
        );
        let argv = create.argv();
        output_of(self.privilege.command("ip").args(&argv[1..]))?.checked("root", &create)?;

        let rule = delay_ms.map(NetemRule::delay);
        for (node, iface) in [(a, a_iface), (b, b_iface)] {
            let node = self.node_mut(node)?;
            node.interfaces.push(iface.to_string());
            let ns = &node.namespace;
            if node.kind == NodeKind::Switch {
                let attach = HostCommand::exec("ip", &["link", "set", iface, "master", SWITCH_BRIDGE]);
                ns.exec(&attach)?.checked(&node.name, &attach)?;
            }
            let up = HostCommand::LinkSet {
                iface: iface.to_string(),
                status: LinkStatus::Up,
            };
            ns.exec(&up)?.checked(&node.name, &up)?;
            if let Some(rule) = rule {
                let shape = HostCommand::Netem {
                    verb: NetemVerb::Add,
                    iface: iface.to_string(),
                    rule,
                };
                ns.exec(&shape)?.checked(&node.name, &shape)?;
            }
        }

        tracing::debug!(a, a_iface, b, b_iface, ?delay_ms, "created link");
        self.links.push(LinkInfo {
            a: Endpoint {
                node: a.to_string(),
                iface: a_iface.to_string(),
                rule,
            },
            b: Endpoint {
                node: b.to_string(),
                iface: b_iface.to_string(),
                rule,
            },
        });
        Ok(())
    }

    pub fn build(self) -> NetnsEmulator {
        NetnsEmulator {
            privilege: self.privilege,
            nodes: self.nodes,
            links: Mutex::new(self.links),
        }
    }
}

/// [`Emulator`] over Linux network namespaces.
pub struct NetnsEmulator {
    privilege: Privilege,
    nodes: Vec<Node>,
    links: Mutex<Vec<LinkInfo>>,
}

impl NetnsEmulator {
    fn node(&self, name: &str) -> Result<&Node> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| SimError::HostNotFound(name.to_string()))
    }

    fn lock_links(&self) -> std::sync::MutexGuard<'_, Vec<LinkInfo>> {
        self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Emulator for NetnsEmulator {
    fn host(&self, name: &str) -> Result<HostRef> {
        let node = self.node(name)?;
        Ok(HostRef::new(&node.name, node.namespace.name()))
    }

    fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes
            .iter()
            .map(|n| NodeInfo {
                name: n.name.clone(),
                kind: n.kind,
                interfaces: n.interfaces.clone(),
            })
            .collect()
    }

    fn run(&self, host: &HostRef, command: &HostCommand) -> Result<CommandOutput> {
        let node = self.node(host.name())?;
        tracing::trace!(host = host.name(), %command, "run");
        node.namespace.exec(command)
    }

    fn spawn(&self, host: &HostRef, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>> {
        let node = self.node(host.name())?;
        let mut cmd = node.namespace.command("env");
        for (key, value) in spec.env.vars() {
            cmd.arg(format!("{key}={value}"));
        }
        cmd.arg(&spec.program).args(&spec.args);
        tracing::info!(host = host.name(), command = %spec.command_line(), "starting process");
        let process = NamespaceProcess::spawn(
            cmd,
            host.name(),
            &spec.stdio,
            self.privilege == Privilege::Sudo,
        )?;
        Ok(Box::new(process))
    }

    fn set_link_status(&self, node: &str, peer: &str, status: LinkStatus) -> Result<()> {
        self.node(node)?;
        self.node(peer)?;
        let link = self
            .lock_links()
            .iter()
            .find(|l| l.connects(node, peer))
            .cloned()
            .ok_or_else(|| SimError::LinkNotFound {
                host: node.to_string(),
                iface: peer.to_string(),
            })?;
        for ep in [&link.a, &link.b] {
            let cmd = HostCommand::LinkSet {
                iface: ep.iface.clone(),
                status,
            };
            self.node(&ep.node)?.namespace.exec(&cmd)?.checked(&ep.node, &cmd)?;
        }
        tracing::info!(node, peer, %status, "link status changed");
        Ok(())
    }

    fn links(&self) -> Vec<LinkInfo> {
        self.lock_links().clone()
    }

    fn configure_endpoint(
        &self,
        node: &str,
        iface: &str,
        verb: NetemVerb,
        rule: NetemRule,
    ) -> Result<()> {
        let host = self.node(node)?;
        let mut links = self.lock_links();
        let endpoint = links
            .iter_mut()
            .flat_map(|l| [&mut l.a, &mut l.b])
            .find(|ep| ep.node == node && ep.iface == iface)
            .ok_or_else(|| SimError::LinkNotFound {
                host: node.to_string(),
                iface: iface.to_string(),
            })?;
        let cmd = HostCommand::Netem {
            verb,
            iface: iface.to_string(),
            rule,
        };
        host.namespace.exec(&cmd)?.checked(node, &cmd)?;
        endpoint.rule = Some(rule);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{check_privileges, unique_ns_name};

    #[test]
    fn privilege_prefixes_sudo() {
        let cmd = Privilege::Sudo.command("ip");
        assert_eq!(cmd.get_program(), "sudo");
        assert_eq!(cmd.get_args().collect::<Vec<_>>(), vec!["ip"]);

        let cmd = Privilege::Direct.command("ip");
        assert_eq!(cmd.get_program(), "ip");
        assert_eq!(cmd.get_args().count(), 0);
    }

    #[test]
    fn empty_topology_reports_missing_hosts() {
        let emu = TopologyBuilder::new("unused").build();
        assert!(matches!(emu.host("h1"), Err(SimError::HostNotFound(h)) if h == "h1"));
        assert!(emu.nodes().is_empty());
        assert!(emu.links().is_empty());
        assert!(matches!(
            emu.set_link_status("h1", "s1", LinkStatus::Down),
            Err(SimError::HostNotFound(_))
        ));
    }

    #[test]
    fn test_host_switch_host_ping() {
        if !check_privileges() {
            eprintln!("Skipping test, insufficient privileges or missing tools");
            return;
        }

        let mut builder = TopologyBuilder::new(&unique_ns_name("mpt"));
        builder.add_host("h1").unwrap();
        builder.add_host("h2").unwrap();
        builder.add_switch("s1").unwrap();
        builder.add_link(("h1", "h1-wifi"), ("s1", "s1-eth1"), Some(1)).unwrap();
        builder.add_link(("h2", "h2-wifi"), ("s1", "s1-eth2"), None).unwrap();
        let emu = builder.build();

        for (host, iface, cidr) in [("h1", "h1-wifi", "10.201.1.2/24"), ("h2", "h2-wifi", "10.201.1.3/24")] {
            let h = emu.host(host).unwrap();
            let cmd = HostCommand::AddrAdd {
                iface: iface.into(),
                cidr: cidr.parse().unwrap(),
            };
            emu.run(&h, &cmd).unwrap().checked(host, &cmd).unwrap();
        }

        let h1 = emu.host("h1").unwrap();
        let ping = HostCommand::exec("ping", &["-c", "1", "-W", "1", "10.201.1.3"]);
        let out = emu.run(&h1, &ping).unwrap();
        assert!(out.success(), "ping failed: {}{}", out.stdout, out.stderr);

        emu.set_link_status("h1", "s1", LinkStatus::Down).unwrap();
        assert!(!emu.run(&h1, &ping).unwrap().success());
        emu.set_link_status("h1", "s1", LinkStatus::Up).unwrap();
    }
}
