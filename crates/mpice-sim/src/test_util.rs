//! Helpers for tests: privilege detection, unique namespace names, an
//! in-memory [`Emulator`] and a manual clock.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::command::{parse_routes, Cidr, CommandOutput, HostCommand, LinkStatus};
use crate::emulator::{Emulator, Endpoint, HostRef, LinkInfo, NodeInfo, NodeKind};
use crate::error::{Result, SimError};
use crate::impairment::{NetemRule, NetemVerb};
use crate::paths::TopologyPlan;
use crate::process::{ProcessEnv, ProcessHandle, ProcessOutput, ProcessSpec};
use crate::scenario::Clock;
use crate::topology::Privilege;

/// Monotonically increasing counter for generating unique test resource names.
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Check whether namespaces can be created: `ip netns` works and we are root
/// or have passwordless sudo.
pub fn check_privileges() -> bool {
    let ip_ok = matches!(Command::new("ip").arg("netns").output(), Ok(o) if o.status.success());
    if !ip_ok {
        return false;
    }
    Privilege::detect() == Privilege::Direct
        || matches!(Command::new("sudo").args(["-n", "true"]).output(), Ok(o) if o.status.success())
}

/// Generates a unique namespace prefix from `prefix`, the pid and a counter,
/// truncated to 15 characters.
pub fn unique_ns_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let name = format!("{}_{:x}_{}", prefix, pid % 0xFFFF, seq);
    if name.len() > 15 {
        name[..15].to_string()
    } else {
        name
    }
}

// ── Manual clock ───────────────────────────────────────────────────────────

/// Clock that only advances virtual time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    slept: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed(&self) -> Duration {
        *self.slept.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Clock for ManualClock {
    fn sleep(&self, duration: Duration) -> Result<()> {
        *self.slept.lock().unwrap_or_else(|p| p.into_inner()) += duration;
        Ok(())
    }
}

// ── Recording emulator ─────────────────────────────────────────────────────

/// Simulated state of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceState {
    pub up: bool,
    pub addrs: Vec<Cidr>,
    /// Routes in `ip route show dev X` form, without the `dev` part.
    pub routes: Vec<String>,
}

impl Default for IfaceState {
    fn default() -> Self {
        Self {
            up: true,
            addrs: Vec::new(),
            routes: Vec::new(),
        }
    }
}

/// One process started through [`RecordingEmulator::spawn`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRecord {
    pub host: String,
    pub command: String,
    pub env: ProcessEnv,
    pub terminations: usize,
}

#[derive(Default)]
struct State {
    nodes: Vec<NodeInfo>,
    ifaces: BTreeMap<(String, String), IfaceState>,
    links: Vec<LinkInfo>,
    sysctl: BTreeMap<(String, String), String>,
    responses: Vec<(String, CommandOutput)>,
    failures: Vec<(String, String)>,
    spawn_failures: Vec<String>,
    process_stdout: BTreeMap<String, String>,
    commands: Vec<(String, String)>,
    processes: Vec<ProcessRecord>,
}

impl State {
    fn iface(&mut self, host: &str, iface: &str) -> &mut IfaceState {
        self.ifaces
            .entry((host.to_string(), iface.to_string()))
            .or_default()
    }

    fn add_node(&mut self, name: &str, kind: NodeKind) {
        self.nodes.push(NodeInfo {
            name: name.to_string(),
            kind,
            interfaces: Vec::new(),
        });
    }

    fn has_node(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }

    /// One unreplied UDP flow per address bound on an up interface directly
    /// linked to `host`, as a NAT sees its neighbours probing.
    fn neighbour_flows(&self, host: &str) -> String {
        let mut out = String::new();
        for link in &self.links {
            for (local, peer) in [(&link.a, &link.b), (&link.b, &link.a)] {
                if local.node != host {
                    continue;
                }
                let Some(peer_state) = self.ifaces.get(&(peer.node.clone(), peer.iface.clone())) else {
                    continue;
                };
                if !peer_state.up {
                    continue;
                }
                let dst = self
                    .ifaces
                    .get(&(local.node.clone(), local.iface.clone()))
                    .and_then(|s| s.addrs.first())
                    .map(|c| c.addr)
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                for src in peer_state.addrs.iter().map(|c| c.addr) {
                    out.push_str(&format!(
                        "udp      17 28 src={src} dst={dst} sport=50000 dport=3478 [UNREPLIED] \
                         src={dst} dst={src} sport=3478 dport=50000 mark=0 use=1\n"
                    ));
                }
            }
        }
        out
    }

    fn scripted(&self, rendered: &str) -> Option<CommandOutput> {
        if let Some((_, stderr)) = self.failures.iter().find(|(p, _)| rendered.starts_with(p.as_str())) {
            return Some(CommandOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: stderr.clone(),
            });
        }
        self.responses
            .iter()
            .filter(|(p, _)| rendered.starts_with(p.as_str()))
            .max_by_key(|(p, _)| p.len())
            .map(|(_, out)| out.clone())
    }

    fn simulate(&mut self, host: &str, command: &HostCommand) -> CommandOutput {
        match command {
            HostCommand::AddrShow { iface } => {
                let Some(state) = self.ifaces.get(&(host.to_string(), iface.clone())) else {
                    return failed(&format!("Device \"{iface}\" does not exist."));
                };
                let mut out = String::new();
                for cidr in &state.addrs {
                    out.push_str(&format!("    inet {cidr} scope global {iface}\n"));
                }
                CommandOutput::ok(out)
            }
            HostCommand::AddrAdd { iface, cidr } => {
                let state = self.iface(host, iface);
                if state.addrs.contains(cidr) {
                    return failed("RTNETLINK answers: File exists");
                }
                state.addrs.push(*cidr);
                CommandOutput::ok("")
            }
            HostCommand::AddrFlush { iface } => {
                let state = self.iface(host, iface);
                state.addrs.clear();
                state.routes.clear();
                CommandOutput::ok("")
            }
            HostCommand::LinkSet { iface, status } => {
                let state = self.iface(host, iface);
                state.up = *status == LinkStatus::Up;
                if !state.up {
                    state.routes.clear();
                }
                CommandOutput::ok("")
            }
            HostCommand::RouteShow { iface: Some(iface) } => {
                let Some(state) = self.ifaces.get(&(host.to_string(), iface.clone())) else {
                    return failed(&format!("Cannot find device \"{iface}\""));
                };
                CommandOutput::ok(lines(state.routes.iter().map(String::as_str)))
            }
            HostCommand::RouteShow { iface: None } => {
                let routes: Vec<String> = self
                    .ifaces
                    .iter()
                    .filter(|((h, _), _)| h == host)
                    .flat_map(|((_, i), s)| s.routes.iter().map(move |r| format!("{r} dev {i}")))
                    .collect();
                CommandOutput::ok(lines(routes.iter().map(String::as_str)))
            }
            HostCommand::RouteReplace { iface, route } => {
                replace_route(self.iface(host, iface), route.join(" "));
                CommandOutput::ok("")
            }
            HostCommand::DefaultRoute { iface, gateway } => {
                replace_route(self.iface(host, iface), format!("default via {gateway}"));
                CommandOutput::ok("")
            }
            HostCommand::SysctlRead { key } => {
                match self.sysctl.get(&(host.to_string(), key.clone())) {
                    Some(value) => CommandOutput::ok(format!("{value}\n")),
                    None => failed(&format!("sysctl: cannot stat {key}")),
                }
            }
            HostCommand::SysctlWrite { key, value } => {
                self.sysctl
                    .insert((host.to_string(), key.clone()), value.clone());
                CommandOutput::ok(format!("{key} = {value}\n"))
            }
            HostCommand::ConntrackList { .. } => CommandOutput::ok(self.neighbour_flows(host)),
            HostCommand::Netem { .. }
            | HostCommand::ConntrackDelete { .. }
            | HostCommand::Exec { .. } => CommandOutput::ok(""),
        }
    }
}

fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn lines<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.map(|l| format!("{l}\n")).collect()
}

fn replace_route(state: &mut IfaceState, route: String) {
    let dest = parse_routes(&route).first().and_then(|t| t.first().cloned());
    match state
        .routes
        .iter_mut()
        .find(|r| r.split_whitespace().next() == dest.as_deref())
    {
        Some(existing) => *existing = route,
        None => state.routes.push(route),
    }
}

/// In-memory [`Emulator`] that records every command and simulates the
/// address, route and link state the condition controller relies on.
#[derive(Clone, Default)]
pub struct RecordingEmulator {
    state: Arc<Mutex<State>>,
}

impl RecordingEmulator {
    pub fn new(hosts: &[&str]) -> Self {
        let emu = Self::default();
        {
            let mut state = emu.state();
            for host in hosts {
                state.add_node(host, NodeKind::Host);
            }
        }
        emu
    }

    /// Nodes, links and setup commands of `plan`, applied to the simulated
    /// state without recording them.
    pub fn from_plan(plan: &TopologyPlan) -> Self {
        let mut emu = Self::new(&plan.hosts);
        for switch in &plan.switches {
            emu = emu.with_switch(switch);
        }
        for link in &plan.links {
            emu = emu.with_link(link.a, link.b, Some(NetemRule::delay(link.delay_ms)));
        }
        {
            let mut state = emu.state();
            for (host, command) in &plan.setup {
                state.simulate(host, command);
            }
        }
        emu
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn with_switch(self, name: &str) -> Self {
        self.state().add_node(name, NodeKind::Switch);
        self
    }

    pub fn with_iface(self, host: &str, iface: &str, addrs: &[&str], routes: &[&str]) -> Self {
        {
            let mut state = self.state();
            let iface_state = state.iface(host, iface);
            iface_state.addrs = addrs.iter().filter_map(|a| a.parse().ok()).collect();
            iface_state.routes = routes.iter().map(|r| r.to_string()).collect();
            if let Some(node) = state.nodes.iter_mut().find(|n| n.name == host) {
                if !node.interfaces.iter().any(|i| i == iface) {
                    node.interfaces.push(iface.to_string());
                }
            }
        }
        self
    }

    pub fn with_link(
        self,
        (a, a_iface): (&str, &str),
        (b, b_iface): (&str, &str),
        rule: Option<NetemRule>,
    ) -> Self {
        {
            let mut state = self.state();
            for (node, iface) in [(a, a_iface), (b, b_iface)] {
                state.iface(node, iface);
                if let Some(n) = state.nodes.iter_mut().find(|n| n.name == node) {
                    if !n.interfaces.iter().any(|i| i == iface) {
                        n.interfaces.push(iface.to_string());
                    }
                }
            }
            let endpoint = |node: &str, iface: &str| Endpoint {
                node: node.to_string(),
                iface: iface.to_string(),
                rule,
            };
            state.links.push(LinkInfo {
                a: endpoint(a, a_iface),
                b: endpoint(b, b_iface),
            });
        }
        self
    }

    /// Answer any command whose rendering starts with `prefix`. The longest
    /// matching prefix wins.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.state()
            .responses
            .push((prefix.to_string(), CommandOutput::ok(stdout)));
    }

    /// Make commands starting with `prefix` exit with status 1.
    pub fn fail_on(&self, prefix: &str, stderr: &str) {
        self.state()
            .failures
            .push((prefix.to_string(), stderr.to_string()));
    }

    pub fn fail_spawn_on(&self, host: &str) {
        self.state().spawn_failures.push(host.to_string());
    }

    /// Stdout returned when processes on `host` are terminated.
    pub fn script_process(&self, host: &str, stdout: &str) {
        self.state()
            .process_stdout
            .insert(host.to_string(), stdout.to_string());
    }

    pub fn set_sysctl(&self, host: &str, key: &str, value: &str) {
        self.state()
            .sysctl
            .insert((host.to_string(), key.to_string()), value.to_string());
    }

    pub fn sysctl(&self, host: &str, key: &str) -> Option<String> {
        self.state()
            .sysctl
            .get(&(host.to_string(), key.to_string()))
            .cloned()
    }

    pub fn clear_addrs(&self, host: &str, iface: &str) {
        self.state().iface(host, iface).addrs.clear();
    }

    pub fn iface_state(&self, host: &str, iface: &str) -> Option<IfaceState> {
        self.state()
            .ifaces
            .get(&(host.to_string(), iface.to_string()))
            .cloned()
    }

    pub fn endpoint(&self, host: &str, iface: &str) -> Option<Endpoint> {
        self.state()
            .links
            .iter()
            .find_map(|l| l.endpoint(host, iface).cloned())
    }

    /// `(host, command)` pairs in execution order.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.state().commands.clone()
    }

    pub fn processes(&self) -> Vec<ProcessRecord> {
        self.state().processes.clone()
    }
}

impl Emulator for RecordingEmulator {
    fn host(&self, name: &str) -> Result<HostRef> {
        if self.state().has_node(name) {
            Ok(HostRef::new(name, &format!("rec-{name}")))
        } else {
            Err(SimError::HostNotFound(name.to_string()))
        }
    }

    fn nodes(&self) -> Vec<NodeInfo> {
        self.state().nodes.clone()
    }

    fn run(&self, host: &HostRef, command: &HostCommand) -> Result<CommandOutput> {
        let rendered = command.to_string();
        let mut state = self.state();
        state
            .commands
            .push((host.name().to_string(), rendered.clone()));
        let scripted = state.scripted(&rendered);
        Ok(scripted.unwrap_or_else(|| state.simulate(host.name(), command)))
    }

    fn spawn(&self, host: &HostRef, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>> {
        let mut state = self.state();
        if state.spawn_failures.iter().any(|h| h == host.name()) {
            return Err(SimError::Io(std::io::Error::other(format!(
                "cannot start {}",
                spec.program
            ))));
        }
        state.processes.push(ProcessRecord {
            host: host.name().to_string(),
            command: spec.command_line(),
            env: spec.env.clone(),
            terminations: 0,
        });
        let stdout = state
            .process_stdout
            .get(host.name())
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(FakeProcess {
            state: Arc::clone(&self.state),
            index: state.processes.len() - 1,
            running: true,
            stdout,
        }))
    }

    fn set_link_status(&self, node: &str, peer: &str, status: LinkStatus) -> Result<()> {
        let mut state = self.state();
        for name in [node, peer] {
            if !state.has_node(name) {
                return Err(SimError::HostNotFound(name.to_string()));
            }
        }
        let link = state
            .links
            .iter()
            .find(|l| l.connects(node, peer))
            .cloned()
            .ok_or_else(|| SimError::LinkNotFound {
                host: node.to_string(),
                iface: peer.to_string(),
            })?;
        state
            .commands
            .push((node.to_string(), format!("link {node} {peer} {status}")));
        for ep in [&link.a, &link.b] {
            state.simulate(
                &ep.node,
                &HostCommand::LinkSet {
                    iface: ep.iface.clone(),
                    status,
                },
            );
        }
        Ok(())
    }

    fn links(&self) -> Vec<LinkInfo> {
        self.state().links.clone()
    }

    fn configure_endpoint(
        &self,
        node: &str,
        iface: &str,
        verb: NetemVerb,
        rule: NetemRule,
    ) -> Result<()> {
        let mut state = self.state();
        let cmd = HostCommand::Netem {
            verb,
            iface: iface.to_string(),
            rule,
        };
        let rendered = cmd.to_string();
        state.commands.push((node.to_string(), rendered.clone()));
        if let Some(out) = state.scripted(&rendered) {
            out.checked(node, &cmd)?;
        }
        let endpoint = state
            .links
            .iter_mut()
            .flat_map(|l| [&mut l.a, &mut l.b])
            .find(|ep| ep.node == node && ep.iface == iface)
            .ok_or_else(|| SimError::LinkNotFound {
                host: node.to_string(),
                iface: iface.to_string(),
            })?;
        endpoint.rule = Some(rule);
        Ok(())
    }
}

struct FakeProcess {
    state: Arc<Mutex<State>>,
    index: usize,
    running: bool,
    stdout: String,
}

impl ProcessHandle for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn is_running(&mut self) -> bool {
        self.running
    }

    fn terminate(&mut self) -> Result<ProcessOutput> {
        self.running = false;
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.processes[self.index].terminations += 1;
        Ok(ProcessOutput {
            status: Some(0),
            stdout: self.stdout.clone().into_bytes(),
            stderr: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names_fit_netns_limit() {
        let a = unique_ns_name("mpc");
        let b = unique_ns_name("mpc");
        assert!(a.len() <= 15);
        assert_ne!(a, b);
    }

    #[test]
    fn route_replace_overwrites_same_destination() {
        let mut state = IfaceState::default();
        replace_route(&mut state, "default via 1.20.30.1".into());
        replace_route(&mut state, "default via 1.20.30.14".into());
        replace_route(&mut state, "1.20.30.0/28 proto kernel scope link".into());
        assert_eq!(
            state.routes,
            vec!["default via 1.20.30.14", "1.20.30.0/28 proto kernel scope link"]
        );
    }

    #[test]
    fn listings_of_missing_devices_fail() {
        let emu = RecordingEmulator::new(&["h1"]).with_iface("h1", "h1-wifi", &[], &["192.168.1.0/24"]);
        let h1 = emu.host("h1").unwrap();
        for iface in ["h1-wifi", "h1-eth"] {
            let routes = emu
                .run(&h1, &HostCommand::RouteShow { iface: Some(iface.into()) })
                .unwrap();
            let addrs = emu
                .run(&h1, &HostCommand::AddrShow { iface: iface.into() })
                .unwrap();
            assert_eq!(routes.success(), iface == "h1-wifi");
            assert_eq!(addrs.success(), iface == "h1-wifi");
        }
        let missing = emu
            .run(&h1, &HostCommand::RouteShow { iface: Some("h1-eth".into()) })
            .unwrap();
        assert!(missing.stderr.contains("Cannot find device"));
    }

    #[test]
    fn plan_layout_is_replayed() {
        use crate::paths::{NetworkConfiguration, TopologyScenario};

        let cfg = TopologyScenario::SingleWithInternet.configure(NetworkConfiguration::default());
        let emu = RecordingEmulator::from_plan(&TopologyPlan::new(&cfg));
        assert!(emu.commands().is_empty());
        assert!(emu.host("nat1").is_ok());
        assert!(emu.host("nat3").is_err());

        let cellular = emu.iface_state("h1", "h1-cellular").unwrap();
        assert_eq!(cellular.addrs, vec!["1.20.30.2/28".parse::<Cidr>().unwrap()]);
        assert_eq!(cellular.routes, vec!["default via 1.20.30.1"]);
        assert_eq!(
            emu.endpoint("nat1", "nat1-ext").unwrap().rule,
            Some(NetemRule::delay(cfg.internet_path_ext_delay))
        );
    }
}
