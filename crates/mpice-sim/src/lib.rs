//! Path-disruption scenario engine for multipath QUIC/ICE experiments.
//!
//! Builds two-host topologies out of Linux network namespaces and drives
//! time-sequenced network conditions (link and interface toggles, packet
//! loss, conntrack manipulation) against them while processes under test
//! run inside the hosts.

pub mod command;
pub mod conditions;
pub mod conntrack;
pub mod emulator;
pub mod error;
pub mod host;
pub mod iface_store;
pub mod impairment;
pub mod paths;
pub mod process;
pub mod scenario;
pub mod test_util;
pub mod topology;

pub use command::{Cidr, CommandOutput, HostCommand, InterfaceId, LinkStatus};
pub use conditions::{InterfaceToken, NetworkConditions};
pub use conntrack::{ConntrackFilter, ConntrackProbe};
pub use emulator::{Emulator, HostRef};
pub use error::{Result, SimError};
pub use host::HostControl;
pub use iface_store::{InterfaceStateStore, IpSnapshot};
pub use process::{LogDestination, ProcessCapture, ProcessEnv, ProcessSpec, StdioPolicy};
pub use scenario::{Condition, Scenario, ScenarioReport, Sequencer, SystemClock};
pub use topology::NetnsEmulator;
