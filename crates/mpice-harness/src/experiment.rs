//! One measurement run around a workload scenario.
//!
//! Order of a run:
//! 1. TURN server on `turn`, packet capture on every non-switch node
//! 2. one second of capture warm-up, then the workload scenario
//! 3. optional operator pause with the network still up
//! 4. captures and TURN stopped, NAT tables and routes dumped
//! 5. pcap merge, secret injection, log filtering, success check
//! 6. `report.json`, then the folder is opened up to everyone

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local};
use mpice_sim::emulator::NodeKind;
use mpice_sim::scenario::{Action, Clock, Step};
use mpice_sim::{
    ConntrackProbe, Emulator, HostCommand, HostControl, LogDestination, ProcessCapture, ProcessEnv,
    ProcessSpec, ScenarioReport, Sequencer,
};
use serde::Serialize;

use crate::capture;
use crate::config::{HarnessConfig, LogLevel, TestConfiguration};
use crate::output::{self, FilterMode, NOMINATION_THRESHOLD};
use crate::workloads::{self, WorkloadContext};

/// Lets tshark see the first packets of the workload.
const CAPTURE_WARMUP: Duration = Duration::from_secs(1);

pub const TURN_HOST: &str = "turn";
pub const SSL_KEY_LOG: &str = "sslkey.log";
pub const ROUTES_FILE: &str = "routes.txt";
pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Serialize)]
pub struct ExperimentReport {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub run_dir: PathBuf,
    pub configuration: TestConfiguration,
    pub scenario: ScenarioReport,
    pub turn_started: bool,
    pub pcaps: Vec<PathBuf>,
    pub combined_pcap: Option<PathBuf>,
    pub nat_tables: Vec<PathBuf>,
    /// `NominatedPair:` lines in `h1.log`, `None` without a client log.
    pub nominations: Option<usize>,
    pub ice_succeeded: Option<bool>,
    pub warnings: Vec<String>,
}

impl ExperimentReport {
    pub fn succeeded(&self) -> bool {
        self.scenario.succeeded()
    }
}

pub struct Experiment<'a, E: Emulator + ?Sized> {
    control: HostControl<'a, E>,
    conf: &'a TestConfiguration,
    harness: &'a HarnessConfig,
    run_dir: PathBuf,
    warnings: Vec<String>,
}

impl<'a, E: Emulator + ?Sized> Experiment<'a, E> {
    pub fn new(
        emulator: &'a E,
        conf: &'a TestConfiguration,
        harness: &'a HarnessConfig,
        run_dir: &Path,
    ) -> Self {
        Self {
            control: HostControl::new(emulator),
            conf,
            harness,
            run_dir: run_dir.to_path_buf(),
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.warnings.push(message);
    }

    fn process_env(&self) -> ProcessEnv {
        ProcessEnv {
            rust_log: Some(self.conf.log_level.as_filter().to_string()),
            ssl_key_log: self
                .conf
                .log_sslkeys
                .then(|| self.run_dir.join(SSL_KEY_LOG)),
            extra: Vec::new(),
        }
    }

    /// Run everything. `pause` is called when an interactive session was
    /// requested and the workload ran to the end.
    pub fn run<C: Clock>(
        mut self,
        clock: C,
        pause: &mut dyn FnMut(&Path),
    ) -> anyhow::Result<ExperimentReport> {
        let started_at = Local::now();
        let conf = self.conf;
        let env = self.process_env();
        tracing::info!(
            run_dir = %self.run_dir.display(),
            setup = %conf.setup,
            test = conf.test.as_str(),
            "experiment starting"
        );

        let turn = if conf.enable_turn_server {
            self.start_turn(&env)
        } else {
            None
        };
        let turn_started = turn.is_some();
        let pcaps = if conf.enable_pcap {
            capture::start_pcap_captures(self.control, &self.harness.tools, &self.run_dir)
        } else {
            Vec::new()
        };

        let ctx = WorkloadContext {
            conf,
            tools: &self.harness.tools,
            run_dir: &self.run_dir,
            env,
        };
        let mut scenario = workloads::scenario(conf.test, &ctx);
        scenario.steps.insert(0, Step::new(Action::Wait(CAPTURE_WARMUP)));

        let scenario_report = {
            let mut sequencer = Sequencer::new(self.control, &self.run_dir, clock);
            sequencer.run(&scenario)
        };
        if let Some(aborted) = &scenario_report.aborted {
            self.warn(format!(
                "scenario aborted at step {} ({}): {}",
                aborted.index, aborted.action, aborted.error
            ));
        }

        if conf.enable_cli_after_test && scenario_report.succeeded() {
            pause(&self.run_dir);
        }

        let pcap_files = capture::stop_pcap_captures(pcaps, conf.change_file_permissions);
        if let Some(mut turn) = turn {
            if let Err(e) = turn.finish() {
                self.warn(format!("TURN server did not stop cleanly: {e}"));
            }
        }

        let nat_tables = self.dump_nat_tables();
        self.dump_routes();

        let combined_pcap = if conf.combine_pcaps {
            self.combine(&pcap_files)
        } else {
            None
        };

        if conf.log_level >= LogLevel::Debug {
            self.filter_logs();
        }

        let nominations = self.count_nominations();
        let ice_succeeded = nominations.map(|n| n > NOMINATION_THRESHOLD);
        match ice_succeeded {
            Some(true) => tracing::info!(nominations = ?nominations, "ICE nominated its pairs"),
            Some(false) => tracing::warn!(nominations = ?nominations, "too few nominated pairs"),
            None => tracing::info!("no client log to check for nominations"),
        }

        let report = ExperimentReport {
            started_at,
            finished_at: Local::now(),
            run_dir: self.run_dir.clone(),
            configuration: conf.clone(),
            scenario: scenario_report,
            turn_started,
            pcaps: pcap_files,
            combined_pcap,
            nat_tables,
            nominations,
            ice_succeeded,
            warnings: std::mem::take(&mut self.warnings),
        };
        let report_path = self.run_dir.join(REPORT_FILE);
        let json = serde_json::to_string_pretty(&report).context("serializing run report")?;
        fs::write(&report_path, json)
            .with_context(|| format!("writing {}", report_path.display()))?;
        tracing::info!(path = %report_path.display(), "wrote run report");

        if conf.change_file_permissions {
            match output::loosen_permissions(&self.run_dir) {
                Ok(n) => tracing::debug!(entries = n, "permissions loosened"),
                Err(e) => tracing::warn!(error = %e, "could not loosen permissions"),
            }
        }
        Ok(report)
    }

    /// `turnserver -z --log-file stdout`: no authentication, log to the
    /// captured stdout instead of /var/log.
    fn start_turn(&mut self, env: &ProcessEnv) -> Option<ProcessCapture> {
        if self.control.host(TURN_HOST).is_err() {
            self.warn(format!("no '{TURN_HOST}' host in this setup, TURN server skipped"));
            return None;
        }
        let spec = ProcessSpec::new(
            &self.harness.tools.turnserver,
            ["-z", "--log-file", "stdout"],
        )
        .with_env(env.clone());
        match self.control.spawn(TURN_HOST, &spec) {
            Ok(handle) => {
                tracing::info!(host = TURN_HOST, "TURN server started");
                Some(ProcessCapture::new(
                    TURN_HOST,
                    handle,
                    LogDestination::File(self.run_dir.join("turn.log")),
                ))
            }
            Err(e) => {
                self.warn(format!("TURN server not started: {e}"));
                None
            }
        }
    }

    fn dump_nat_tables(&mut self) -> Vec<PathBuf> {
        let probe = ConntrackProbe::new(self.control);
        let mut written = Vec::new();
        for node in self.control.emulator().nodes() {
            if node.kind != NodeKind::Host || !node.name.starts_with("nat") {
                continue;
            }
            let path = self.run_dir.join(format!("{}_conntrack.txt", node.name));
            match probe.print_table(&node.name, &path) {
                Ok(()) => written.push(path),
                Err(e) => self.warn(format!("conntrack dump of {} failed: {e}", node.name)),
            }
        }
        written
    }

    fn dump_routes(&mut self) {
        let mut text = String::new();
        for node in self.control.emulator().nodes() {
            if node.kind != NodeKind::Host {
                continue;
            }
            match self.control.run(&node.name, &HostCommand::RouteShow { iface: None }) {
                Ok(out) => {
                    text.push_str(&format!("{}:\n{}\n", node.name, out.stdout));
                }
                Err(e) => self.warn(format!("route dump of {} failed: {e}", node.name)),
            }
        }
        let path = self.run_dir.join(ROUTES_FILE);
        if let Err(e) = fs::write(&path, text) {
            self.warn(format!("writing {} failed: {e}", path.display()));
        }
    }

    fn combine(&mut self, pcaps: &[PathBuf]) -> Option<PathBuf> {
        let harness = self.harness;
        let tools = &harness.tools;
        let combined = match capture::merge_pcaps(tools, &self.run_dir, pcaps) {
            Ok(p) => p,
            Err(e) => {
                self.warn(format!("pcap merge failed: {e:#}"));
                return None;
            }
        };
        if !self.conf.log_sslkeys {
            return Some(combined);
        }
        let keylog = self.run_dir.join(SSL_KEY_LOG);
        match capture::inject_secrets(tools, &combined, &keylog) {
            Ok(with_secrets) => Some(with_secrets),
            Err(e) => {
                self.warn(format!("secret injection failed: {e:#}"));
                Some(combined)
            }
        }
    }

    fn filter_logs(&mut self) {
        let harness = self.harness;
        let filter = &harness.log_filter;
        let mut failures = Vec::new();
        for host in ["h1", "h2"] {
            let log = self.run_dir.join(format!("{host}.log"));
            if !log.exists() {
                continue;
            }
            for (needles, mode) in [
                (&filter.keep, FilterMode::Positive),
                (&filter.drop, FilterMode::Negative),
            ] {
                if let Err(e) = output::filter_log(&log, needles, mode) {
                    failures.push(format!("filtering {} failed: {e}", log.display()));
                }
            }
        }
        for failure in failures {
            self.warn(failure);
        }
    }

    fn count_nominations(&self) -> Option<usize> {
        let log = self.run_dir.join("h1.log");
        output::count_nominations(&log).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestKind;
    use mpice_sim::test_util::{ManualClock, RecordingEmulator};

    fn network() -> RecordingEmulator {
        RecordingEmulator::new(&["h1", "h2", "nat1", "nat2", "turn"])
            .with_switch("s1")
            .with_iface("h1", "h1-wifi", &["192.168.1.2/24"], &["192.168.1.0/24 proto kernel scope link src 192.168.1.2"])
            .with_iface("h1", "h1-eth", &["172.16.1.10/24"], &["172.16.1.0/24 proto kernel scope link src 172.16.1.10"])
            .with_iface("h2", "h2-wifi", &["192.168.1.3/24"], &[])
            .with_iface("nat1", "nat1-local", &["1.20.30.1/28"], &[])
    }

    fn quiet_conf(test: TestKind) -> TestConfiguration {
        TestConfiguration {
            test,
            change_file_permissions: false,
            ..TestConfiguration::default()
        }
    }

    #[test]
    fn full_run_collects_everything() {
        let emu = network();
        emu.script_process(
            "h1",
            "NominatedPair: a\nNominatedPair: b\nNominatedPair: c\n",
        );
        let dir = tempfile::tempdir().unwrap();
        let conf = quiet_conf(TestKind::Quicheperf);
        let harness = HarnessConfig::default();
        let clock = ManualClock::new();
        let mut paused = 0;

        let report = Experiment::new(&emu, &conf, &harness, dir.path())
            .run(clock.clone(), &mut |_| paused += 1)
            .unwrap();

        assert!(report.succeeded(), "{:?}", report.scenario);
        assert_eq!(paused, 0);
        assert!(report.turn_started);
        // warm-up plus the workload's own waits
        assert_eq!(clock.elapsed(), Duration::from_secs(26));
        assert_eq!(report.nominations, Some(3));
        assert_eq!(report.ice_succeeded, Some(true));

        // tshark on every host, TURN, then server and client
        let procs = emu.processes();
        let commands: Vec<&str> = procs.iter().map(|p| p.command.as_str()).collect();
        assert!(commands[0].starts_with("turnserver -z --log-file stdout"));
        assert_eq!(commands.iter().filter(|c| c.starts_with("tshark")).count(), 5);
        assert!(procs.iter().all(|p| p.terminations == 1));
        assert!(procs.iter().all(|p| p.env.rust_log.as_deref() == Some("info")));

        assert_eq!(
            report.nat_tables,
            vec![dir.path().join("nat1_conntrack.txt"), dir.path().join("nat2_conntrack.txt")]
        );
        let routes = fs::read_to_string(dir.path().join(ROUTES_FILE)).unwrap();
        assert!(routes.starts_with("h1:\n"));
        assert!(routes.contains("172.16.1.0/24 proto kernel scope link src 172.16.1.10 dev h1-eth"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(REPORT_FILE)).unwrap())
                .unwrap();
        assert_eq!(json["scenario"]["scenario"], "quicheperf");
        assert_eq!(json["configuration"]["test"], "quicheperf");
        assert_eq!(json["nominations"], 3);
    }

    #[test]
    fn pause_runs_while_network_is_up() {
        let emu = network();
        let dir = tempfile::tempdir().unwrap();
        let conf = TestConfiguration {
            enable_cli_after_test: true,
            enable_pcap: false,
            enable_turn_server: false,
            ..quiet_conf(TestKind::Debug)
        };
        let harness = HarnessConfig::default();
        let mut seen = None;

        let report = Experiment::new(&emu, &conf, &harness, dir.path())
            .run(ManualClock::new(), &mut |p| seen = Some(p.to_path_buf()))
            .unwrap();

        assert_eq!(seen.as_deref(), Some(dir.path()));
        assert!(emu.processes().is_empty());
        assert!(!report.turn_started);
        assert_eq!(report.nominations, None);
        assert_eq!(report.ice_succeeded, None);
    }

    #[test]
    fn missing_turn_host_is_a_warning() {
        let emu = RecordingEmulator::new(&["h1", "h2"]).with_switch("s1");
        let dir = tempfile::tempdir().unwrap();
        let conf = TestConfiguration {
            enable_pcap: false,
            ..quiet_conf(TestKind::Debug)
        };
        let harness = HarnessConfig::default();
        let report = Experiment::new(&emu, &conf, &harness, dir.path())
            .run(ManualClock::new(), &mut |_| {})
            .unwrap();
        assert!(report.succeeded());
        assert!(!report.turn_started);
        assert!(report.warnings.iter().any(|w| w.contains("TURN server skipped")));
    }

    #[test]
    fn aborted_workload_still_tears_down() {
        // h1-cellular refuses to go down, so the first workload step aborts
        let emu = RecordingEmulator::new(&["h1", "h2", "nat1"]).with_iface(
            "h1",
            "h1-cellular",
            &["1.20.30.2/28"],
            &["default via 1.20.30.1"],
        );
        emu.fail_on(
            "ip link set dev h1-cellular down",
            "RTNETLINK answers: Operation not permitted",
        );
        let dir = tempfile::tempdir().unwrap();
        let conf = TestConfiguration {
            enable_turn_server: false,
            enable_cli_after_test: true,
            ..quiet_conf(TestKind::QuicheperfIfInit)
        };
        let harness = HarnessConfig::default();
        let mut paused = false;

        let report = Experiment::new(&emu, &conf, &harness, dir.path())
            .run(ManualClock::new(), &mut |_| paused = true)
            .unwrap();

        assert!(!report.succeeded());
        assert!(!paused);
        assert!(report.warnings.iter().any(|w| w.starts_with("scenario aborted at step 1")));
        // captures started before the workload are stopped anyway
        let procs = emu.processes();
        assert_eq!(procs.len(), 3);
        assert!(procs.iter().all(|p| p.terminations == 1));
        assert!(dir.path().join(REPORT_FILE).exists());
        assert!(dir.path().join("nat1_conntrack.txt").exists());

        let cellular = emu.iface_state("h1", "h1-cellular").unwrap();
        assert!(cellular.up);
        assert_eq!(cellular.routes, vec!["default via 1.20.30.1"]);
    }

    #[test]
    fn debug_verbosity_filters_client_and_server_logs() {
        let emu = network();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("h1.log"), "candidate pair\nrx pkt 1\n").unwrap();
        let conf = TestConfiguration {
            log_level: LogLevel::Debug,
            log_sslkeys: true,
            enable_pcap: false,
            enable_turn_server: false,
            ..quiet_conf(TestKind::Debug)
        };
        let harness = HarnessConfig::default();
        let report = Experiment::new(&emu, &conf, &harness, dir.path())
            .run(ManualClock::new(), &mut |_| {})
            .unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("pos_filtered_h1.log")).unwrap(),
            "candidate pair\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("neg_filtered_h1.log")).unwrap(),
            "candidate pair\n"
        );
        assert!(!dir.path().join("pos_filtered_h2.log").exists());
        assert_eq!(report.nominations, Some(0));
        assert_eq!(report.ice_succeeded, Some(false));
    }
}
