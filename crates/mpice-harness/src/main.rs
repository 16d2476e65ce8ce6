//! mpice-harness: multipath QUIC/ICE path-disruption experiments.
//!
//! Builds the two-host path layout out of network namespaces, runs one
//! workload against it while capturing traffic, and leaves pcaps, logs,
//! NAT tables and a JSON report in a timestamped run folder.

mod capture;
mod config;
mod experiment;
mod output;
mod workloads;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use mpice_sim::paths::build_network;
use mpice_sim::SystemClock;
use tracing_subscriber::EnvFilter;

use config::{HarnessConfig, LogLevel, Preset, TestConfiguration, TestKind};
use experiment::Experiment;

#[derive(Parser, Debug)]
#[command(
    name = "mpice-harness",
    about = "Multipath QUIC/ICE experiments over emulated paths"
)]
struct Cli {
    /// Path layout: single, single+local, single+internet, full (alias: default).
    #[arg(short = 's', long, default_value = "default")]
    setup: String,

    /// Workload to run.
    #[arg(short = 't', long, value_enum, default_value_t = TestKind::Quicheperf)]
    test: TestKind,

    /// Transfer duration in seconds (also the ping-pong run time).
    #[arg(short = 'l', long, default_value_t = 100)]
    duration: u64,

    /// Target throughput handed to quicheperf.
    #[arg(long, default_value = "1MB")]
    throughput: String,

    /// Verbosity of the processes under test and of the harness:
    /// 1 error, 2 warn, 3 info, 4 debug, 5 trace.
    #[arg(long, default_value_t = 3)]
    logging: u8,

    #[arg(long)]
    disable_pcap: bool,

    #[arg(long)]
    disable_turn: bool,

    /// Pause after the workload with the network still up.
    #[arg(short = 'c', long)]
    cli: bool,

    /// Leave the run folder with root-only permissions.
    #[arg(long)]
    no_permissions: bool,

    /// Static SNAT/DNAT on the internet NATs instead of MASQUERADE.
    #[arg(short = 'n', long)]
    snat: bool,

    /// Export TLS secrets through SSLKEYLOGFILE.
    #[arg(short = 'k', long)]
    log_sslkeys: bool,

    /// Merge all pcaps (and inject TLS secrets with --log-sslkeys).
    #[arg(long)]
    combine_pcaps: bool,

    /// Cargo profile directory quicheperf was built into.
    #[arg(long, default_value = "debug")]
    build_target: String,

    /// Named preset: nat_fail, default, delay_wifi.
    #[arg(long)]
    scenario: Option<String>,

    /// TOML file with tool paths and the output folder.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root folder for run output (overrides the config file).
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

fn test_configuration(cli: &Cli) -> anyhow::Result<TestConfiguration> {
    let mut conf = TestConfiguration {
        setup: TestConfiguration::parse_setup(&cli.setup)?,
        test: cli.test,
        duration_secs: cli.duration,
        throughput: cli.throughput.clone(),
        log_level: LogLevel::from_number(cli.logging)?,
        enable_pcap: !cli.disable_pcap,
        enable_turn_server: !cli.disable_turn,
        enable_cli_after_test: cli.cli,
        change_file_permissions: !cli.no_permissions,
        log_sslkeys: cli.log_sslkeys,
        combine_pcaps: cli.combine_pcaps,
        build_target: cli.build_target.clone(),
        snat: cli.snat,
        ..TestConfiguration::default()
    };
    if let Some(name) = &cli.scenario {
        let preset: Preset = name.parse()?;
        preset.apply(&mut conf);
        tracing::info!(preset = preset.as_str(), "applied scenario preset");
    }
    Ok(conf)
}

/// Block until the operator presses Enter.
fn operator_pause(run_dir: &Path) {
    println!(
        "Network is up, run output in {}. Inspect with `ip netns exec <ns> …`, press Enter to tear down.",
        run_dir.display()
    );
    let mut line = String::new();
    if let Err(e) = std::io::stdin().lock().read_line(&mut line) {
        tracing::warn!(error = %e, "could not read from stdin");
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = LogLevel::from_number(cli.logging).unwrap_or(LogLevel::Info);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter())),
        )
        .init();

    let conf = test_configuration(&cli)?;
    let mut harness = match &cli.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };
    if let Some(output) = &cli.output {
        harness.output_root = output.clone();
    }

    tracing::info!(
        setup = %conf.setup,
        test = conf.test.as_str(),
        duration_secs = conf.duration_secs,
        log_level = conf.log_level.as_filter(),
        "mpice-harness starting"
    );

    let abort = Arc::new(AtomicBool::new(false));
    {
        let abort = abort.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("interrupt received, finishing the run");
            abort.store(true, Ordering::SeqCst);
        })
        .context("installing Ctrl-C handler")?;
    }

    let run_dir = output::create_run_dir(&harness.output_root, &chrono::Local::now())
        .with_context(|| format!("creating run folder under {}", harness.output_root.display()))?;

    let emulator = build_network(&harness.namespace_prefix, &conf.network())
        .context("building the emulated network")?;

    let report = Experiment::new(&emulator, &conf, &harness, &run_dir)
        .run(SystemClock::new(abort.clone()), &mut operator_pause)?;

    // namespaces go away here
    drop(emulator);

    if !report.succeeded() {
        bail!(
            "run in {} did not complete: {}",
            run_dir.display(),
            report
                .scenario
                .aborted
                .as_ref()
                .map(|a| a.error.as_str())
                .unwrap_or("unknown failure")
        );
    }
    tracing::info!(run_dir = %run_dir.display(), "all tests completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpice_sim::paths::TopologyScenario;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("mpice-harness").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_the_usual_run() {
        let conf = test_configuration(&parse(&[])).unwrap();
        assert_eq!(conf, TestConfiguration::default());
    }

    #[test]
    fn flags_map_onto_configuration() {
        let cli = parse(&[
            "-s",
            "single+local",
            "-t",
            "quicheperf-loss",
            "-l",
            "30",
            "--logging",
            "5",
            "--disable-pcap",
            "--disable-turn",
            "--no-permissions",
            "-n",
            "-k",
            "--build-target",
            "release",
        ]);
        let conf = test_configuration(&cli).unwrap();
        assert_eq!(conf.setup, TopologyScenario::SingleWithLocal);
        assert_eq!(conf.test, TestKind::QuicheperfLoss);
        assert_eq!(conf.duration_secs, 30);
        assert_eq!(conf.log_level, LogLevel::Trace);
        assert!(!conf.enable_pcap);
        assert!(!conf.enable_turn_server);
        assert!(!conf.change_file_permissions);
        assert!(conf.snat);
        assert!(conf.log_sslkeys);
        assert_eq!(conf.build_target, "release");
    }

    #[test]
    fn preset_overrides_flags() {
        let cli = parse(&["--scenario", "delay_wifi", "--logging", "5", "--disable-pcap"]);
        let conf = test_configuration(&cli).unwrap();
        assert_eq!(conf.setup, TopologyScenario::SingleWithInternet);
        assert_eq!(conf.log_level, LogLevel::Info);
        assert!(conf.enable_pcap);
        assert_eq!(conf.delays.wifi_direct_path_delay, 20);
    }

    #[test]
    fn bad_inputs_are_errors() {
        let err = test_configuration(&parse(&["--scenario", "fastest"])).unwrap_err();
        assert!(err.to_string().contains("fastest"));
        assert!(test_configuration(&parse(&["--logging", "9"])).is_err());
        assert!(test_configuration(&parse(&["-s", "ring"])).is_err());
        assert!(Cli::try_parse_from(["mpice-harness", "-t", "iperf"]).is_err());
    }
}
