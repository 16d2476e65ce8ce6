//! The capability boundary towards the network emulator.
//!
//! The scenario engine never touches namespaces, bridges or qdiscs directly.
//! It asks an [`Emulator`] for hosts, runs typed commands on them, spawns
//! processes and toggles links. [`crate::topology::NetnsEmulator`] is the
//! namespace-backed implementation; tests use
//! [`crate::test_util::RecordingEmulator`].

use serde::Serialize;

use crate::command::{CommandOutput, HostCommand, LinkStatus};
use crate::error::Result;
use crate::impairment::{NetemRule, NetemVerb};
use crate::process::{ProcessHandle, ProcessSpec};

/// Borrowed handle to one emulated node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRef {
    name: String,
    namespace: String,
}

impl HostRef {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Emulator-specific execution context (the netns name for namespaces).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Host,
    Switch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub kind: NodeKind,
    pub interfaces: Vec<String>,
}

/// One side of an emulated link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    pub node: String,
    pub iface: String,
    /// Root netem rule currently installed, `None` when the interface is unshaped.
    pub rule: Option<NetemRule>,
}

impl Endpoint {
    pub fn loss_percent(&self) -> f32 {
        self.rule.and_then(|r| r.loss_percent).unwrap_or(0.0)
    }

    pub fn is_shaped(&self) -> bool {
        self.rule.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkInfo {
    pub a: Endpoint,
    pub b: Endpoint,
}

impl LinkInfo {
    pub fn endpoint(&self, node: &str, iface: &str) -> Option<&Endpoint> {
        [&self.a, &self.b]
            .into_iter()
            .find(|ep| ep.node == node && ep.iface == iface)
    }

    pub fn connects(&self, node: &str, peer: &str) -> bool {
        (self.a.node == node && self.b.node == peer) || (self.a.node == peer && self.b.node == node)
    }
}

/// Capabilities the scenario engine consumes from a running topology.
pub trait Emulator {
    /// Resolve a node by name, failing with [`crate::SimError::HostNotFound`].
    fn host(&self, name: &str) -> Result<HostRef>;

    fn nodes(&self) -> Vec<NodeInfo>;

    /// Run a command to completion inside `host`, capturing its output.
    fn run(&self, host: &HostRef, command: &HostCommand) -> Result<CommandOutput>;

    /// Start a long-running process inside `host` without waiting for it.
    fn spawn(&self, host: &HostRef, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>>;

    /// Toggle both ends of the link between `node` and `peer`.
    fn set_link_status(&self, node: &str, peer: &str, status: LinkStatus) -> Result<()>;

    fn links(&self) -> Vec<LinkInfo>;

    /// Install or modify the netem rule on one link endpoint and remember it.
    fn configure_endpoint(
        &self,
        node: &str,
        iface: &str,
        verb: NetemVerb,
        rule: NetemRule,
    ) -> Result<()>;
}
