//! Workload catalogue: the processes under test and the disruptions applied
//! while they run.
//!
//! All timings are fixed waits tuned against quicheperf's own timeline (ICE
//! gathering, path validation), not synchronised with it. A slower machine
//! can shift the disruption relative to the connection state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mpice_sim::scenario::{Condition, ProcessLaunch, Readiness, ScenarioBuilder};
use mpice_sim::{LogDestination, ProcessEnv, ProcessSpec, Scenario, StdioPolicy};

use crate::config::{LogLevel, TestConfiguration, TestKind, ToolPaths};

pub const SERVER_LISTEN: &str = "192.168.1.3:10000";
pub const CLIENT_LISTEN: &str = "192.168.1.2:20000";
pub const OFFER_ADDRESS: &str = "192.168.1.2:50000";
pub const ANSWER_ADDRESS: &str = "192.168.1.3:60000";

/// Conntrack UDP timeout forced on the NAT during `nat-rebind`.
const REBIND_TIMEOUT_SECS: u32 = 5;

pub struct WorkloadContext<'a> {
    pub conf: &'a TestConfiguration,
    pub tools: &'a ToolPaths,
    pub run_dir: &'a Path,
    pub env: ProcessEnv,
}

impl WorkloadContext<'_> {
    pub fn log_path(&self, host: &str) -> PathBuf {
        self.run_dir.join(format!("{host}.log"))
    }

    /// Above info the processes write their own log through a redirect so
    /// nothing large sits in the harness's pipes; otherwise the output is
    /// captured and written at termination.
    fn launch(&self, host: &str, program: &Path, args: Vec<String>) -> ProcessLaunch {
        let log = self.log_path(host);
        let spec = ProcessSpec::new(&program.display().to_string(), args).with_env(self.env.clone());
        let (spec, log) = if self.conf.log_level > LogLevel::Info {
            (
                spec.with_stdio(StdioPolicy::RedirectToFile(log)),
                LogDestination::SelfManaged,
            )
        } else {
            (spec.with_stdio(StdioPolicy::Capture), LogDestination::File(log))
        };
        ProcessLaunch {
            host: host.to_string(),
            label: host.to_string(),
            spec,
            log,
        }
    }

    fn quicheperf_pair(&self) -> Vec<ProcessLaunch> {
        let bin = self.tools.quicheperf_bin(&self.conf.build_target);
        let server = vec![
            "server".to_string(),
            "--cert".to_string(),
            self.tools.quicheperf_cert().display().to_string(),
            "--key".to_string(),
            self.tools.quicheperf_key().display().to_string(),
            "-l".to_string(),
            SERVER_LISTEN.to_string(),
            "--mp".to_string(),
            "true".to_string(),
        ];
        let client = vec![
            "client".to_string(),
            "-l".to_string(),
            CLIENT_LISTEN.to_string(),
            "-c".to_string(),
            SERVER_LISTEN.to_string(),
            "--mp".to_string(),
            "true".to_string(),
            "-d".to_string(),
            self.conf.duration_secs.to_string(),
            "-b".to_string(),
            self.conf.throughput.clone(),
        ];
        vec![self.launch("h2", &bin, server), self.launch("h1", &bin, client)]
    }

    fn ping_pong_pair(&self) -> Vec<ProcessLaunch> {
        let answer = vec!["--offer-address".to_string(), OFFER_ADDRESS.to_string()];
        let mut offer = vec!["--answer-address".to_string(), ANSWER_ADDRESS.to_string()];
        if self.conf.log_level >= LogLevel::Debug {
            offer.insert(0, "--debug".to_string());
        }
        vec![
            self.launch("h2", &self.tools.webrtc_example("answer"), answer),
            self.launch("h1", &self.tools.webrtc_example("offer"), offer),
        ]
    }

    /// Wait for the client log to show a nominated pair when the client
    /// writes its log live; fall back to a fixed wait otherwise.
    fn settle(&self, scenario: ScenarioBuilder, secs: u64) -> ScenarioBuilder {
        if self.conf.log_level > LogLevel::Info {
            scenario.wait_for(
                Readiness::LogContains {
                    path: self.log_path("h1"),
                    needle: crate::output::NOMINATION_MARKER.to_string(),
                },
                Duration::from_secs(secs),
            )
        } else {
            scenario.wait_secs(secs)
        }
    }
}

pub fn scenario(kind: TestKind, ctx: &WorkloadContext<'_>) -> Scenario {
    let builder = Scenario::builder(kind.as_str());
    match kind {
        TestKind::Quicheperf => builder
            .iface_down("h1", "h1-eth")
            .start(ctx.quicheperf_pair())
            .wait_secs(5)
            .iface_up("h1", "h1-eth")
            .wait_secs(20)
            .build(),
        TestKind::QuicheperfIfInit => builder
            .iface_down("h1", "h1-cellular")
            .start(ctx.quicheperf_pair())
            .wait_secs(10)
            .iface_up("h1", "h1-cellular")
            .wait_secs(20)
            .build(),
        TestKind::QuicheperfIf => ctx
            .settle(builder.start(ctx.quicheperf_pair()), 5)
            .iface_down("h1", "h1-wifi")
            .wait_secs(10)
            .iface_up("h1", "h1-wifi")
            .wait_secs(15)
            .build(),
        TestKind::QuicheperfLoss => ctx
            .settle(builder.start(ctx.quicheperf_pair()), 5)
            .loss("h1", "h1-cellular", 100.0)
            .wait_secs(15)
            .loss("h1", "h1-cellular", 0.0)
            .wait_secs(10)
            .build(),
        TestKind::NatRebind => builder
            .start(ctx.quicheperf_pair())
            .wait_secs(5)
            .snapshot_nat("nat1")
            .apply(Condition::ConntrackTimeout {
                host: "nat1".to_string(),
                seconds: REBIND_TIMEOUT_SECS,
            })
            .apply(Condition::ConntrackDeleteUnreplied {
                host: "nat1".to_string(),
            })
            .wait_secs(u64::from(REBIND_TIMEOUT_SECS) * 2)
            .snapshot_nat("nat1")
            .wait_secs(10)
            .snapshot_nat("nat1")
            .build(),
        TestKind::PingPong => builder
            .start(ctx.ping_pong_pair())
            .wait_secs(ctx.conf.duration_secs)
            .build(),
        TestKind::Debug => builder.build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Preset;
    use mpice_sim::paths::TopologyPlan;
    use mpice_sim::scenario::Action;
    use mpice_sim::test_util::{ManualClock, RecordingEmulator};
    use mpice_sim::{HostControl, Sequencer};

    fn ctx<'a>(conf: &'a TestConfiguration, tools: &'a ToolPaths) -> WorkloadContext<'a> {
        WorkloadContext {
            conf,
            tools,
            run_dir: Path::new("/runs/r1"),
            env: ProcessEnv {
                rust_log: Some(conf.log_level.as_filter().to_string()),
                ..ProcessEnv::default()
            },
        }
    }

    fn launches(scenario: &Scenario) -> Vec<&ProcessLaunch> {
        scenario
            .steps
            .iter()
            .filter_map(|s| match &s.action {
                Action::Start(l) => Some(l.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn actions(scenario: &Scenario) -> Vec<String> {
        scenario.steps.iter().map(|s| s.action.to_string()).collect()
    }

    #[test]
    fn quicheperf_command_lines() {
        let conf = TestConfiguration {
            duration_secs: 30,
            throughput: "5MB".into(),
            build_target: "release".into(),
            ..TestConfiguration::default()
        };
        let tools = ToolPaths {
            quicheperf_dir: "/opt/qp".into(),
            ..ToolPaths::default()
        };
        let s = scenario(TestKind::Quicheperf, &ctx(&conf, &tools));
        let l = launches(&s);
        assert_eq!(l.len(), 2);
        assert_eq!(l[0].host, "h2");
        assert_eq!(
            l[0].spec.command_line(),
            "/opt/qp/target/release/quicheperf server --cert /opt/qp/src/cert.crt \
             --key /opt/qp/src/cert.key -l 192.168.1.3:10000 --mp true"
        );
        assert_eq!(
            l[1].spec.command_line(),
            "/opt/qp/target/release/quicheperf client -l 192.168.1.2:20000 \
             -c 192.168.1.3:10000 --mp true -d 30 -b 5MB"
        );
        assert_eq!(l[1].spec.env.rust_log.as_deref(), Some("info"));
    }

    #[test]
    fn quicheperf_enables_wired_after_five_seconds() {
        let conf = TestConfiguration::default();
        let tools = ToolPaths::default();
        let s = scenario(TestKind::Quicheperf, &ctx(&conf, &tools));
        assert_eq!(
            actions(&s),
            vec![
                "apply iface h1:h1-eth down",
                "start h2, h1",
                "wait 5.0s",
                "apply iface h1:h1-eth up",
                "wait 20.0s",
            ]
        );
        assert_eq!(s.total_wait(), Duration::from_secs(25));
    }

    #[test]
    fn info_level_captures_output() {
        let conf = TestConfiguration::default();
        let tools = ToolPaths::default();
        let s = scenario(TestKind::QuicheperfIfInit, &ctx(&conf, &tools));
        for l in launches(&s) {
            assert_eq!(l.spec.stdio, StdioPolicy::Capture);
            assert_eq!(
                l.log,
                LogDestination::File(PathBuf::from(format!("/runs/r1/{}.log", l.host)))
            );
        }
    }

    #[test]
    fn debug_level_redirects_to_log_files() {
        let conf = TestConfiguration {
            log_level: LogLevel::Debug,
            ..TestConfiguration::default()
        };
        let tools = ToolPaths::default();
        let s = scenario(TestKind::QuicheperfLoss, &ctx(&conf, &tools));
        for l in launches(&s) {
            assert_eq!(
                l.spec.stdio,
                StdioPolicy::RedirectToFile(PathBuf::from(format!("/runs/r1/{}.log", l.host)))
            );
            assert_eq!(l.log, LogDestination::SelfManaged);
        }
        // the first wait follows the client's log instead of sleeping blindly
        assert!(matches!(s.steps[1].action, Action::WaitFor { .. }));
    }

    #[test]
    fn loss_workload_sequence() {
        let conf = TestConfiguration::default();
        let tools = ToolPaths::default();
        let s = scenario(TestKind::QuicheperfLoss, &ctx(&conf, &tools));
        assert_eq!(
            actions(&s),
            vec![
                "start h2, h1",
                "wait 5.0s",
                "apply loss 100% on h1:h1-cellular",
                "wait 15.0s",
                "apply loss 0% on h1:h1-cellular",
                "wait 10.0s",
            ]
        );
    }

    #[test]
    fn interface_workload_sequence() {
        let conf = TestConfiguration::default();
        let tools = ToolPaths::default();
        let s = scenario(TestKind::QuicheperfIf, &ctx(&conf, &tools));
        assert_eq!(s.total_wait(), Duration::from_secs(30));
        assert_eq!(actions(&s)[2], "apply iface h1:h1-wifi down");
        assert_eq!(actions(&s)[4], "apply iface h1:h1-wifi up");
    }

    #[test]
    fn nat_rebind_touches_first_nat() {
        let conf = TestConfiguration::default();
        let tools = ToolPaths::default();
        let s = scenario(TestKind::NatRebind, &ctx(&conf, &tools));
        let a = actions(&s);
        assert!(a.contains(&"apply conntrack udp timeout 5s on nat1".to_string()));
        assert!(a.contains(&"apply conntrack delete unreplied on nat1".to_string()));
        assert_eq!(a.iter().filter(|x| x.starts_with("snapshot")).count(), 3);
    }

    #[test]
    fn ping_pong_runs_for_duration() {
        let conf = TestConfiguration {
            duration_secs: 42,
            log_level: LogLevel::Trace,
            ..TestConfiguration::default()
        };
        let tools = ToolPaths {
            webrtc_examples_dir: "/opt/webrtc".into(),
            ..ToolPaths::default()
        };
        let s = scenario(TestKind::PingPong, &ctx(&conf, &tools));
        let l = launches(&s);
        assert_eq!(
            l[0].spec.command_line(),
            "/opt/webrtc/answer --offer-address 192.168.1.2:50000"
        );
        assert_eq!(
            l[1].spec.command_line(),
            "/opt/webrtc/offer --debug --answer-address 192.168.1.3:60000"
        );
        assert_eq!(s.total_wait(), Duration::from_secs(42));
    }

    #[test]
    fn debug_workload_is_empty() {
        let conf = TestConfiguration::default();
        let tools = ToolPaths::default();
        assert!(scenario(TestKind::Debug, &ctx(&conf, &tools)).steps.is_empty());
    }

    fn run_on_own_layout(conf: &TestConfiguration) -> mpice_sim::ScenarioReport {
        let emu = RecordingEmulator::from_plan(&TopologyPlan::new(&conf.network()));
        let tools = ToolPaths::default();
        let dir = tempfile::tempdir().unwrap();
        let s = scenario(conf.test, &ctx(conf, &tools));
        Sequencer::new(HostControl::new(&emu), dir.path(), ManualClock::new()).run(&s)
    }

    #[test]
    fn presets_run_on_their_own_layout() {
        for name in ["nat_fail", "default", "delay_wifi"] {
            let preset: Preset = name.parse().unwrap();
            let mut conf = TestConfiguration::default();
            preset.apply(&mut conf);

            let report = run_on_own_layout(&conf);
            assert!(report.succeeded(), "{name}: {:?}", report.aborted);
            assert_eq!(report.captures_started, 2, "{name}");
            assert!(report.cleanup_warnings.is_empty(), "{name}: {:?}", report.cleanup_warnings);
        }
    }

    #[test]
    fn quicheperf_workloads_skip_paths_the_setup_lacks() {
        let kinds = [
            TestKind::Quicheperf,
            TestKind::QuicheperfIfInit,
            TestKind::QuicheperfIf,
            TestKind::QuicheperfLoss,
        ];
        for setup in ["single", "single+local", "single+internet", "full"] {
            for test in kinds {
                let conf = TestConfiguration {
                    setup: TestConfiguration::parse_setup(setup).unwrap(),
                    test,
                    ..TestConfiguration::default()
                };
                let report = run_on_own_layout(&conf);
                assert!(report.succeeded(), "{setup}/{}: {:?}", test.as_str(), report.aborted);
                assert_eq!(report.interfaces_restored, 0, "{setup}/{}", test.as_str());
            }
        }
    }
}
