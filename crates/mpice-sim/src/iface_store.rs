use std::collections::BTreeMap;

use serde::Serialize;

use crate::command::{parse_inet_addrs, Cidr, HostCommand, InterfaceId};
use crate::emulator::Emulator;
use crate::error::Result;
use crate::host::HostControl;

/// Ordered IPv4 addresses bound to an interface at save time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IpSnapshot(Vec<Cidr>);

impl IpSnapshot {
    pub fn new(addrs: Vec<Cidr>) -> Self {
        Self(addrs)
    }

    pub fn addrs(&self) -> &[Cidr] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Addresses of interfaces that are currently taken down.
///
/// Restored entries are emptied rather than removed, so restoring a key
/// twice is harmless.
#[derive(Debug, Default)]
pub struct InterfaceStateStore {
    entries: BTreeMap<InterfaceId, IpSnapshot>,
}

impl InterfaceStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the addresses of `host:iface`, replacing any earlier entry.
    pub fn save<E: Emulator + ?Sized>(
        &mut self,
        control: &HostControl<'_, E>,
        host: &str,
        iface: &str,
    ) -> Result<IpSnapshot> {
        let key = InterfaceId::new(host, iface)?;
        let cmd = HostCommand::AddrShow {
            iface: iface.to_string(),
        };
        let listing = control.run_checked(host, &cmd)?;
        let snapshot = IpSnapshot::new(parse_inet_addrs(&listing.stdout));

        if self.has(host, iface) {
            tracing::warn!(%key, "overwriting unconsumed address snapshot");
        }
        tracing::debug!(%key, addrs = ?snapshot.addrs(), "saved interface addresses");
        self.entries.insert(key, snapshot.clone());
        Ok(snapshot)
    }

    /// Re-add every saved address, then empty the entry.
    pub fn restore<E: Emulator + ?Sized>(
        &mut self,
        control: &HostControl<'_, E>,
        host: &str,
        iface: &str,
    ) -> Result<IpSnapshot> {
        let key = InterfaceId::new(host, iface)?;
        let Some(snapshot) = self.entries.get(&key).cloned() else {
            return Ok(IpSnapshot::default());
        };
        for cidr in snapshot.addrs() {
            let cmd = HostCommand::AddrAdd {
                iface: iface.to_string(),
                cidr: *cidr,
            };
            let out = control.run(host, &cmd)?;
            // left over from an interrupted earlier restore
            if !out.success() && out.stderr.contains("File exists") {
                tracing::debug!(%key, %cidr, "address already bound");
                continue;
            }
            out.checked(host, &cmd)?;
        }
        self.entries.insert(key.clone(), IpSnapshot::default());
        tracing::debug!(%key, count = snapshot.addrs().len(), "restored interface addresses");
        Ok(snapshot)
    }

    /// True while a non-empty snapshot is held for the key.
    pub fn has(&self, host: &str, iface: &str) -> bool {
        self.snapshot(host, iface).is_some_and(|s| !s.is_empty())
    }

    pub fn snapshot(&self, host: &str, iface: &str) -> Option<&IpSnapshot> {
        self.entries.get(&InterfaceId {
            host: host.to_string(),
            iface: iface.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingEmulator;

    fn cidrs(list: &[&str]) -> Vec<Cidr> {
        list.iter().map(|c| c.parse().unwrap()).collect()
    }

    #[test]
    fn save_then_restore_yields_saved_addresses() {
        let emu = RecordingEmulator::new(&["h1"]).with_iface(
            "h1",
            "h1-eth",
            &["172.16.1.10/24", "172.16.1.11/24"],
            &[],
        );
        let control = HostControl::new(&emu);
        let mut store = InterfaceStateStore::new();

        let saved = store.save(&control, "h1", "h1-eth").unwrap();
        assert_eq!(saved.addrs(), cidrs(&["172.16.1.10/24", "172.16.1.11/24"]).as_slice());
        assert!(store.has("h1", "h1-eth"));

        emu.clear_addrs("h1", "h1-eth");
        let restored = store.restore(&control, "h1", "h1-eth").unwrap();
        assert_eq!(restored, saved);
        assert_eq!(emu.iface_state("h1", "h1-eth").unwrap().addrs, saved.addrs());
        assert!(!store.has("h1", "h1-eth"));
        assert_eq!(store.snapshot("h1", "h1-eth"), Some(&IpSnapshot::default()));

        // second restore is a no-op
        let before = emu.commands().len();
        assert!(store.restore(&control, "h1", "h1-eth").unwrap().is_empty());
        assert_eq!(emu.commands().len(), before);
    }

    #[test]
    fn restore_of_unknown_key_is_noop() {
        let emu = RecordingEmulator::new(&["h1"]);
        let control = HostControl::new(&emu);
        let mut store = InterfaceStateStore::new();
        assert!(store.restore(&control, "h1", "h1-wifi").unwrap().is_empty());
        assert!(emu.commands().is_empty());
    }

    #[test]
    fn second_save_overwrites() {
        let emu = RecordingEmulator::new(&["h1"]).with_iface("h1", "h1-eth", &["172.16.1.10/24"], &[]);
        let control = HostControl::new(&emu);
        let mut store = InterfaceStateStore::new();
        store.save(&control, "h1", "h1-eth").unwrap();
        emu.clear_addrs("h1", "h1-eth");
        let second = store.save(&control, "h1", "h1-eth").unwrap();
        assert!(second.is_empty());
        assert!(!store.has("h1", "h1-eth"));
    }

    #[test]
    fn invalid_interface_is_rejected() {
        let emu = RecordingEmulator::new(&["h1"]);
        let control = HostControl::new(&emu);
        let mut store = InterfaceStateStore::new();
        assert!(store.save(&control, "h1", "bad iface").is_err());
        assert!(emu.commands().is_empty());
    }

    #[test]
    fn restore_skips_addresses_still_bound() {
        let emu = RecordingEmulator::new(&["h1"]).with_iface(
            "h1",
            "h1-eth",
            &["172.16.1.10/24", "172.16.1.11/24"],
            &[],
        );
        let control = HostControl::new(&emu);
        let mut store = InterfaceStateStore::new();
        let saved = store.save(&control, "h1", "h1-eth").unwrap();

        // only the second address went away
        emu.clear_addrs("h1", "h1-eth");
        control
            .run_checked(
                "h1",
                &HostCommand::AddrAdd {
                    iface: "h1-eth".into(),
                    cidr: saved.addrs()[0],
                },
            )
            .unwrap();

        store.restore(&control, "h1", "h1-eth").unwrap();
        let mut addrs = emu.iface_state("h1", "h1-eth").unwrap().addrs;
        addrs.sort_by_key(|c| c.to_string());
        assert_eq!(addrs, saved.addrs());
        assert!(!store.has("h1", "h1-eth"));
    }

    #[test]
    fn restore_propagates_other_failures() {
        let emu = RecordingEmulator::new(&["h1"]).with_iface("h1", "h1-eth", &["172.16.1.10/24"], &[]);
        let control = HostControl::new(&emu);
        let mut store = InterfaceStateStore::new();
        store.save(&control, "h1", "h1-eth").unwrap();
        emu.clear_addrs("h1", "h1-eth");
        emu.fail_on("ip addr add", "RTNETLINK answers: Permission denied");
        assert!(store.restore(&control, "h1", "h1-eth").is_err());
        assert!(store.has("h1", "h1-eth"));
    }
}
