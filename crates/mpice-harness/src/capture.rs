//! Packet captures inside the namespaces and pcap post-processing on the
//! host.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use mpice_sim::emulator::NodeKind;
use mpice_sim::{Emulator, HostControl, LogDestination, ProcessCapture, ProcessSpec};

use crate::config::ToolPaths;
use crate::output;

pub const COMBINED_PCAP: &str = "combined.pcapng";
pub const COMBINED_WITH_SECRETS: &str = "combined_secrets.pcapng";

/// One running `tshark` and the file it writes.
#[derive(Debug)]
pub struct PcapCapture {
    pub host: String,
    pub outfile: PathBuf,
    capture: ProcessCapture,
}

/// `tshark -i <iface> … -i lo -w <outfile> -n`: every interface of the node
/// into one file, so the analysis can tell paths apart by interface id.
pub fn tshark_spec(tools: &ToolPaths, ifaces: &[String], outfile: &Path) -> ProcessSpec {
    let mut args = Vec::new();
    for iface in ifaces.iter().map(String::as_str).chain(["lo"]) {
        args.push("-i".to_string());
        args.push(iface.to_string());
    }
    args.push("-w".to_string());
    args.push(outfile.display().to_string());
    args.push("-n".to_string());
    ProcessSpec::new(&tools.tshark, args)
}

/// Start a capture on every non-switch node. A node whose capture fails to
/// start is logged and skipped.
pub fn start_pcap_captures<E: Emulator + ?Sized>(
    control: HostControl<'_, E>,
    tools: &ToolPaths,
    run_dir: &Path,
) -> Vec<PcapCapture> {
    let mut captures = Vec::new();
    for node in control.emulator().nodes() {
        if node.kind == NodeKind::Switch {
            continue;
        }
        let outfile = run_dir.join(format!("{}.pcap", node.name));
        let spec = tshark_spec(tools, &node.interfaces, &outfile);
        tracing::debug!(host = %node.name, command = %spec.command_line(), "starting capture");
        match control.spawn(&node.name, &spec) {
            Ok(handle) => captures.push(PcapCapture {
                capture: ProcessCapture::new(&node.name, handle, LogDestination::Discard),
                host: node.name,
                outfile,
            }),
            Err(e) => tracing::warn!(host = %node.name, error = %e, "capture not started"),
        }
    }
    tracing::info!(captures = captures.len(), "packet captures running");
    captures
}

/// Terminate every capture. With `world_writable` the pcap files are made
/// 0o666. Returns the pcaps that exist afterwards.
pub fn stop_pcap_captures(captures: Vec<PcapCapture>, world_writable: bool) -> Vec<PathBuf> {
    let mut written = Vec::new();
    for mut c in captures {
        if let Err(e) = c.capture.finish() {
            tracing::warn!(host = %c.host, error = %e, "capture did not stop cleanly");
        }
        if !c.outfile.exists() {
            tracing::warn!(host = %c.host, path = %c.outfile.display(), "no pcap written");
            continue;
        }
        if world_writable {
            if let Err(e) = output::make_world_writable(&c.outfile) {
                tracing::warn!(path = %c.outfile.display(), error = %e, "chmod failed");
            }
        }
        tracing::info!(path = %c.outfile.display(), "wrote pcap");
        written.push(c.outfile);
    }
    written
}

fn run_tool(program: &str, args: &[String]) -> anyhow::Result<()> {
    tracing::debug!(program, args = %args.join(" "), "running");
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("starting {program}"))?;
    if !output.status.success() {
        bail!(
            "{program} failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// `mergecap -w <dir>/combined.pcapng <pcaps…>`
pub fn merge_pcaps(tools: &ToolPaths, run_dir: &Path, pcaps: &[PathBuf]) -> anyhow::Result<PathBuf> {
    if pcaps.is_empty() {
        bail!("no pcaps to merge in {}", run_dir.display());
    }
    let combined = run_dir.join(COMBINED_PCAP);
    let mut args = vec!["-w".to_string(), combined.display().to_string()];
    args.extend(pcaps.iter().map(|p| p.display().to_string()));
    run_tool(&tools.mergecap, &args)?;
    tracing::info!(path = %combined.display(), inputs = pcaps.len(), "merged pcaps");
    Ok(combined)
}

/// `editcap --inject-secrets tls,<keylog> <pcap> <pcap-with-secrets>`, so the
/// QUIC payload can be decrypted without the key log at hand.
pub fn inject_secrets(tools: &ToolPaths, pcap: &Path, keylog: &Path) -> anyhow::Result<PathBuf> {
    if !keylog.exists() {
        bail!("key log {} not found", keylog.display());
    }
    let out = pcap.with_file_name(COMBINED_WITH_SECRETS);
    let args = vec![
        "--inject-secrets".to_string(),
        format!("tls,{}", keylog.display()),
        pcap.display().to_string(),
        out.display().to_string(),
    ];
    run_tool(&tools.editcap, &args)?;
    tracing::info!(path = %out.display(), "injected TLS secrets");
    Ok(out)
}
