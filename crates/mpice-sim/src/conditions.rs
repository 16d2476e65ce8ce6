//! Link, interface and loss conditions applied to a running topology.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::command::{parse_routes, HostCommand, InterfaceId, LinkStatus};
use crate::emulator::Emulator;
use crate::error::{Result, SimError};
use crate::host::HostControl;
use crate::iface_store::InterfaceStateStore;
use crate::impairment::{NetemRule, NetemVerb};

/// Proof that an interface was taken down by [`NetworkConditions::iface_down`].
///
/// Handing it back to [`NetworkConditions::iface_up`] is the only way to
/// bring the interface up with its addresses and routes.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an interface taken down stays down until its token is passed to iface_up"]
pub struct InterfaceToken {
    id: InterfaceId,
    route_file: PathBuf,
}

impl InterfaceToken {
    pub fn id(&self) -> &InterfaceId {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.id.host
    }

    pub fn iface(&self) -> &str {
        &self.id.iface
    }

    pub fn route_file(&self) -> &Path {
        &self.route_file
    }
}

pub struct NetworkConditions<'a, E: Emulator + ?Sized> {
    control: HostControl<'a, E>,
    store: InterfaceStateStore,
    run_dir: PathBuf,
    /// Interfaces taken down and not yet fully restored, with their route file.
    outstanding: BTreeMap<InterfaceId, PathBuf>,
}

impl<'a, E: Emulator + ?Sized> NetworkConditions<'a, E> {
    /// Route snapshots are written below `run_dir`.
    pub fn new(control: HostControl<'a, E>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            control,
            store: InterfaceStateStore::new(),
            run_dir: run_dir.into(),
            outstanding: BTreeMap::new(),
        }
    }

    pub fn control(&self) -> HostControl<'a, E> {
        self.control
    }

    pub fn store(&self) -> &InterfaceStateStore {
        &self.store
    }

    /// Interfaces currently down, including ones whose token was spent on a
    /// failed [`Self::iface_up`].
    pub fn outstanding(&self) -> impl Iterator<Item = &InterfaceId> {
        self.outstanding.keys()
    }

    pub fn link_set(&self, host: &str, peer: &str, status: LinkStatus) -> Result<()> {
        self.control.host(host)?;
        self.control.emulator().set_link_status(host, peer, status)
    }

    /// Persist routes, save addresses, set the interface down, flush it.
    ///
    /// Returns `None` when `host` has no such interface: the path it belongs
    /// to is not part of this topology. If setting the interface down fails
    /// halfway, it is brought back up before the error is returned.
    pub fn iface_down(&mut self, host: &str, iface: &str) -> Result<Option<InterfaceToken>> {
        let id = InterfaceId::new(host, iface)?;
        if !self.control.has_interface(host, iface)? {
            tracing::warn!(host, iface, "no such interface, not taken down");
            return Ok(None);
        }
        if self.outstanding.contains_key(&id) {
            return Err(SimError::SnapshotOverwrite {
                host: id.host,
                iface: id.iface,
            });
        }

        let routes = self.control.run_checked(
            host,
            &HostCommand::RouteShow {
                iface: Some(iface.to_string()),
            },
        )?;
        std::fs::create_dir_all(&self.run_dir)?;
        let route_file = self.run_dir.join(format!("{host}_{iface}.routes"));
        std::fs::write(&route_file, routes.stdout.as_bytes())?;

        self.store.save(&self.control, host, iface)?;
        self.outstanding.insert(id.clone(), route_file.clone());

        if let Err(err) = self.take_down(host, iface) {
            match self.bring_up(&id, &route_file) {
                Ok(()) => tracing::warn!(host, iface, error = %err, "interface down failed, rolled back"),
                Err(rollback) => tracing::error!(
                    host,
                    iface,
                    error = %err,
                    rollback = %rollback,
                    "interface down failed and could not be rolled back"
                ),
            }
            return Err(err);
        }

        tracing::info!(host, iface, "interface down");
        Ok(Some(InterfaceToken { id, route_file }))
    }

    fn take_down(&self, host: &str, iface: &str) -> Result<()> {
        self.control.run_checked(
            host,
            &HostCommand::LinkSet {
                iface: iface.to_string(),
                status: LinkStatus::Down,
            },
        )?;
        self.control.run_checked(
            host,
            &HostCommand::AddrFlush {
                iface: iface.to_string(),
            },
        )?;
        Ok(())
    }

    /// Set the interface up, re-add its addresses, then its routes.
    ///
    /// On failure the interface stays outstanding and
    /// [`Self::restore_outstanding`] can retry it.
    pub fn iface_up(&mut self, token: InterfaceToken) -> Result<()> {
        if !self.outstanding.contains_key(token.id()) {
            return Err(SimError::MissingSnapshot {
                host: token.id.host,
                iface: token.id.iface,
            });
        }
        self.bring_up(&token.id, &token.route_file)
    }

    /// Bring every outstanding interface back up. Tokens still held for
    /// them are spent.
    pub fn restore_outstanding(&mut self) -> Vec<(InterfaceId, Result<()>)> {
        let pending: Vec<(InterfaceId, PathBuf)> = self
            .outstanding
            .iter()
            .map(|(id, file)| (id.clone(), file.clone()))
            .collect();
        pending
            .into_iter()
            .map(|(id, route_file)| {
                let result = self.bring_up(&id, &route_file);
                (id, result)
            })
            .collect()
    }

    fn bring_up(&mut self, id: &InterfaceId, route_file: &Path) -> Result<()> {
        let host = id.host.as_str();
        let iface = id.iface.as_str();

        self.control.run_checked(
            host,
            &HostCommand::LinkSet {
                iface: iface.to_string(),
                status: LinkStatus::Up,
            },
        )?;
        self.store.restore(&self.control, host, iface)?;

        let saved = std::fs::read_to_string(route_file)?;
        for route in parse_routes(&saved) {
            self.control.run_checked(
                host,
                &HostCommand::RouteReplace {
                    iface: iface.to_string(),
                    route,
                },
            )?;
        }
        std::fs::remove_file(route_file)?;

        tracing::info!(host, iface, "interface up");
        self.outstanding.remove(id);
        Ok(())
    }

    /// Set the loss percentage on the link endpoint `host:iface`.
    ///
    /// Returns the rule now installed, or `None` when nothing changed: the
    /// interface belongs to no emulated link, or loss 0 was requested on an
    /// endpoint that was never shaped.
    pub fn loss(&self, host: &str, iface: &str, percent: f32) -> Result<Option<NetemRule>> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(SimError::InvalidPercent(percent));
        }
        self.control.host(host)?;

        let links = self.control.emulator().links();
        let Some(endpoint) = links.iter().find_map(|l| l.endpoint(host, iface)) else {
            tracing::warn!(host, iface, "no emulated link for interface, loss not applied");
            return Ok(None);
        };

        let (verb, rule) = match (endpoint.rule, percent == 0.0) {
            (None, true) => {
                tracing::debug!(host, iface, "interface unshaped, nothing to clear");
                return Ok(None);
            }
            (Some(current), _) => (NetemVerb::Change, current.with_loss(percent)),
            (None, false) => (NetemVerb::Add, NetemRule::default().with_loss(percent)),
        };
        self.control
            .emulator()
            .configure_endpoint(host, iface, verb, rule)?;
        tracing::info!(host, iface, percent, %verb, "loss applied");
        Ok(Some(rule))
    }

    pub fn set_default_route(&self, host: &str, gateway: Ipv4Addr, iface: &str) -> Result<()> {
        self.control.run_checked(
            host,
            &HostCommand::DefaultRoute {
                iface: iface.to_string(),
                gateway,
            },
        )?;
        tracing::info!(host, %gateway, iface, "default route set");
        Ok(())
    }
}
