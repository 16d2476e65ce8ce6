//! Connection-tracking probe for NAT hosts.
//!
//! All operations are best effort: a failing `conntrack` invocation is
//! logged and reported in the return value, never raised, because an empty
//! table and a missing conntrack module look the same from userspace.

use std::fs::File;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Serialize;

use crate::command::{ConntrackFormat, HostCommand};
use crate::emulator::Emulator;
use crate::error::Result;
use crate::host::HostControl;

/// Kernel knob for the expiry of established UDP flows.
pub const UDP_STREAM_TIMEOUT: &str = "net.netfilter.nf_conntrack_udp_timeout_stream";

// ── Filters ────────────────────────────────────────────────────────────────

/// Status bits accepted by `conntrack --status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConntrackStatus {
    Assured,
    SeenReply,
    Unset,
}

impl ConntrackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConntrackStatus::Assured => "ASSURED",
            ConntrackStatus::SeenReply => "SEEN_REPLY",
            ConntrackStatus::Unset => "UNSET",
        }
    }
}

/// Selects the entries a `conntrack -D` removes. An empty filter matches all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConntrackFilter {
    pub proto: Option<String>,
    pub src: Option<Ipv4Addr>,
    pub dst: Option<Ipv4Addr>,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
    pub status: Option<ConntrackStatus>,
}

impl ConntrackFilter {
    pub fn proto(mut self, proto: &str) -> Self {
        self.proto = Some(proto.to_string());
        self
    }

    pub fn src(mut self, addr: Ipv4Addr) -> Self {
        self.src = Some(addr);
        self
    }

    pub fn dst(mut self, addr: Ipv4Addr) -> Self {
        self.dst = Some(addr);
        self
    }

    pub fn status(mut self, status: ConntrackStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Exactly the original direction of `entry`.
    pub fn for_entry(entry: &ConntrackEntry) -> Self {
        Self {
            proto: Some(entry.proto.clone()),
            src: Some(entry.original.src),
            dst: Some(entry.original.dst),
            sport: entry.original.sport,
            dport: entry.original.dport,
            status: None,
        }
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        // port selectors are only valid after -p
        if let Some(proto) = &self.proto {
            args.extend(["-p".to_string(), proto.clone()]);
        }
        if let Some(src) = self.src {
            args.extend(["-s".to_string(), src.to_string()]);
        }
        if let Some(dst) = self.dst {
            args.extend(["-d".to_string(), dst.to_string()]);
        }
        if self.proto.is_some() {
            if let Some(port) = self.sport {
                args.extend(["--sport".to_string(), port.to_string()]);
            }
            if let Some(port) = self.dport {
                args.extend(["--dport".to_string(), port.to_string()]);
            }
        }
        if let Some(status) = self.status {
            args.extend(["--status".to_string(), status.as_str().to_string()]);
        }
        args
    }
}

// ── Entries ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowTuple {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
}

/// One line of `conntrack -L`, plain or extended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConntrackEntry {
    pub proto: String,
    pub timeout: u32,
    /// TCP state such as `ESTABLISHED`; absent for UDP.
    pub state: Option<String>,
    pub original: FlowTuple,
    pub reply: Option<FlowTuple>,
    pub unreplied: bool,
    pub assured: bool,
}

#[derive(Default)]
struct TupleParts {
    src: Option<Ipv4Addr>,
    dst: Option<Ipv4Addr>,
    sport: Option<u16>,
    dport: Option<u16>,
}

impl TupleParts {
    fn finish(self) -> Option<FlowTuple> {
        Some(FlowTuple {
            src: self.src?,
            dst: self.dst?,
            sport: self.sport,
            dport: self.dport,
        })
    }
}

impl ConntrackEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace().peekable();
        // extended listings start with the layer-3 protocol
        if tokens.peek() == Some(&"ipv4") {
            tokens.next();
            tokens.next();
        }
        let proto = tokens.next()?.to_string();
        let _proto_num: u8 = tokens.next()?.parse().ok()?;
        let timeout: u32 = tokens.next()?.parse().ok()?;

        let mut entry = ConntrackEntry {
            proto,
            timeout,
            state: None,
            original: FlowTuple {
                src: Ipv4Addr::UNSPECIFIED,
                dst: Ipv4Addr::UNSPECIFIED,
                sport: None,
                dport: None,
            },
            reply: None,
            unreplied: false,
            assured: false,
        };
        let mut tuples: Vec<TupleParts> = Vec::new();

        for tok in tokens {
            match tok {
                "[UNREPLIED]" => entry.unreplied = true,
                "[ASSURED]" => entry.assured = true,
                _ => match tok.split_once('=') {
                    Some(("src", v)) => {
                        tuples.push(TupleParts::default());
                        tuples.last_mut()?.src = v.parse().ok();
                    }
                    Some(("dst", v)) => tuples.last_mut()?.dst = v.parse().ok(),
                    Some(("sport", v)) => tuples.last_mut()?.sport = v.parse().ok(),
                    Some(("dport", v)) => tuples.last_mut()?.dport = v.parse().ok(),
                    Some(_) => {}
                    None if tuples.is_empty() && !tok.starts_with('[') => {
                        entry.state = Some(tok.to_string());
                    }
                    None => {}
                },
            }
        }

        let mut tuples = tuples.into_iter();
        entry.original = tuples.next()?.finish()?;
        entry.reply = tuples.next().and_then(TupleParts::finish);
        Some(entry)
    }

    /// True when `addr` appears in either direction.
    pub fn mentions(&self, addr: Ipv4Addr) -> bool {
        std::iter::once(&self.original)
            .chain(self.reply.as_ref())
            .any(|t| t.src == addr || t.dst == addr)
    }
}

pub fn parse_entries(listing: &str) -> Vec<ConntrackEntry> {
    listing.lines().filter_map(ConntrackEntry::parse).collect()
}

/// Result of a `conntrack -D` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub succeeded: bool,
    /// Parsed from "N flow entries have been deleted" when conntrack prints it.
    pub deleted: Option<u32>,
}

fn parse_deleted_count(text: &str) -> Option<u32> {
    let idx = text.find(" flow entries have been deleted")?;
    text[..idx].split_whitespace().last()?.parse().ok()
}

// ── Probe ──────────────────────────────────────────────────────────────────

pub struct ConntrackProbe<'a, E: Emulator + ?Sized> {
    control: HostControl<'a, E>,
}

impl<'a, E: Emulator + ?Sized> ConntrackProbe<'a, E> {
    pub fn new(control: HostControl<'a, E>) -> Self {
        Self { control }
    }

    /// Write the plain listing followed by the extended one into `outfile`.
    pub fn print_table(&self, host: &str, outfile: &Path) -> Result<()> {
        let mut file = File::create(outfile)?;
        for format in [ConntrackFormat::Plain, ConntrackFormat::Extended] {
            let cmd = HostCommand::ConntrackList { format };
            let out = self.control.run(host, &cmd)?;
            if !out.success() {
                tracing::warn!(host, %cmd, stderr = %out.stderr.trim(), "conntrack listing failed");
            }
            file.write_all(out.stdout.as_bytes())?;
        }
        tracing::debug!(host, path = %outfile.display(), "wrote conntrack table");
        Ok(())
    }

    pub fn entries(&self, host: &str) -> Result<Vec<ConntrackEntry>> {
        let cmd = HostCommand::ConntrackList {
            format: ConntrackFormat::Plain,
        };
        let out = self.control.run(host, &cmd)?;
        if !out.success() {
            tracing::warn!(host, stderr = %out.stderr.trim(), "conntrack listing failed");
        }
        Ok(parse_entries(&out.stdout))
    }

    pub fn delete_entries(&self, host: &str, filter: &ConntrackFilter) -> Result<DeleteOutcome> {
        let cmd = HostCommand::ConntrackDelete {
            filter: filter.clone(),
        };
        let out = self.control.run(host, &cmd)?;
        let deleted = parse_deleted_count(&out.stderr).or_else(|| parse_deleted_count(&out.stdout));
        // conntrack exits non-zero when nothing matched
        let succeeded = out.success() || deleted == Some(0);
        if succeeded {
            tracing::info!(host, ?deleted, "deleted conntrack entries");
        } else {
            tracing::warn!(host, %cmd, stderr = %out.stderr.trim(), "conntrack delete failed");
        }
        Ok(DeleteOutcome { succeeded, deleted })
    }

    /// Remove every entry that never saw a reply, one original tuple at a time.
    pub fn delete_unreplied(&self, host: &str) -> Result<u32> {
        let mut removed = 0;
        for entry in self.entries(host)?.iter().filter(|e| e.unreplied) {
            let outcome = self.delete_entries(host, &ConntrackFilter::for_entry(entry))?;
            removed += outcome.deleted.unwrap_or(u32::from(outcome.succeeded));
        }
        Ok(removed)
    }

    pub fn timeout(&self, host: &str) -> Result<Option<u32>> {
        let out = self.control.run(
            host,
            &HostCommand::SysctlRead {
                key: UDP_STREAM_TIMEOUT.to_string(),
            },
        )?;
        Ok(out
            .success()
            .then(|| out.stdout.trim().parse().ok())
            .flatten())
    }

    /// Change the UDP stream timeout. Returns the previous value when the
    /// write went through and the old value could be read.
    pub fn set_timeout(&self, host: &str, seconds: u32) -> Result<Option<u32>> {
        let previous = self.timeout(host)?;
        let cmd = HostCommand::SysctlWrite {
            key: UDP_STREAM_TIMEOUT.to_string(),
            value: seconds.to_string(),
        };
        let out = self.control.run(host, &cmd)?;
        if !out.success() {
            tracing::warn!(host, seconds, stderr = %out.stderr.trim(), "failed to set conntrack timeout");
            return Ok(None);
        }
        tracing::info!(host, seconds, ?previous, "conntrack udp timeout changed");
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingEmulator;

    const LISTING: &str = "\
udp      17 28 src=1.20.30.2 dst=1.20.50.100 sport=20000 dport=3478 [UNREPLIED] src=1.20.50.100 dst=1.20.50.10 sport=3478 dport=20000 mark=0 use=1
tcp      6 431999 ESTABLISHED src=1.20.30.2 dst=1.20.50.20 sport=41000 dport=443 src=1.20.50.20 dst=1.20.50.10 sport=443 dport=41000 [ASSURED] mark=0 use=1
conntrack v1.4.6 (conntrack-tools): 2 flow entries have been shown.
";

    #[test]
    fn listing_is_parsed() {
        let entries = parse_entries(LISTING);
        assert_eq!(entries.len(), 2);

        let udp = &entries[0];
        assert_eq!(udp.proto, "udp");
        assert_eq!(udp.timeout, 28);
        assert!(udp.unreplied && !udp.assured);
        assert_eq!(udp.state, None);
        assert_eq!(udp.original.sport, Some(20000));
        assert_eq!(udp.reply.as_ref().unwrap().dst, Ipv4Addr::new(1, 20, 50, 10));
        assert!(udp.mentions(Ipv4Addr::new(1, 20, 50, 10)));
        assert!(!udp.mentions(Ipv4Addr::new(2, 40, 60, 3)));

        let tcp = &entries[1];
        assert_eq!(tcp.state.as_deref(), Some("ESTABLISHED"));
        assert!(tcp.assured);

        let extended = "ipv4     2 udp      17 5 src=10.0.0.1 dst=10.0.0.2 sport=1 dport=2 [UNREPLIED] src=10.0.0.2 dst=10.0.0.1 sport=2 dport=1 mark=0 use=1";
        assert_eq!(ConntrackEntry::parse(extended).unwrap().timeout, 5);
    }

    #[test]
    fn filter_renders_ports_only_with_proto() {
        let filter = ConntrackFilter::default()
            .src(Ipv4Addr::new(1, 20, 30, 2))
            .status(ConntrackStatus::Assured);
        assert_eq!(filter.args(), vec!["-s", "1.20.30.2", "--status", "ASSURED"]);

        let entry = &parse_entries(LISTING)[0];
        assert_eq!(
            ConntrackFilter::for_entry(entry).args(),
            vec![
                "-p", "udp", "-s", "1.20.30.2", "-d", "1.20.50.100", "--sport", "20000", "--dport",
                "3478"
            ]
        );
    }

    #[test]
    fn deleted_count_is_parsed() {
        assert_eq!(
            parse_deleted_count("conntrack v1.4.6 (conntrack-tools): 3 flow entries have been deleted.\n"),
            Some(3)
        );
        assert_eq!(parse_deleted_count("something else"), None);
    }

    #[test]
    fn print_table_concatenates_both_listings() {
        let emu = RecordingEmulator::new(&["nat1"]);
        emu.respond("conntrack -L -o extended", "EXTENDED\n");
        emu.respond("conntrack -L", "PLAIN\n");
        let probe = ConntrackProbe::new(HostControl::new(&emu));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nat1_conntrack.txt");
        probe.print_table("nat1", &path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "PLAIN\nEXTENDED\n");
    }

    #[test]
    fn delete_failures_are_reported_not_raised() {
        let emu = RecordingEmulator::new(&["nat1"]);
        emu.fail_on("conntrack -D", "Operation failed: invalid parameters");
        let probe = ConntrackProbe::new(HostControl::new(&emu));
        let outcome = probe
            .delete_entries("nat1", &ConntrackFilter::default().proto("udp"))
            .unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.deleted, None);
    }

    #[test]
    fn unreplied_entries_are_deleted_by_tuple() {
        let emu = RecordingEmulator::new(&["nat1"]);
        emu.respond("conntrack -L", LISTING);
        let probe = ConntrackProbe::new(HostControl::new(&emu));
        assert_eq!(probe.delete_unreplied("nat1").unwrap(), 1);
        let deletes: Vec<_> = emu
            .commands()
            .into_iter()
            .filter(|(_, cmd)| cmd.starts_with("conntrack -D"))
            .collect();
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].1.contains("--sport 20000"));
    }

    #[test]
    fn timeout_change_returns_previous_value() {
        let emu = RecordingEmulator::new(&["nat1"]);
        emu.set_sysctl("nat1", UDP_STREAM_TIMEOUT, "120");
        let probe = ConntrackProbe::new(HostControl::new(&emu));
        assert_eq!(probe.set_timeout("nat1", 5).unwrap(), Some(120));
        assert_eq!(probe.timeout("nat1").unwrap(), Some(5));
    }
}
