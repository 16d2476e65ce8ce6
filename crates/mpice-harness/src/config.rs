//! Run configuration: what to test, how loud, and where the tools live.
//!
//! [`TestConfiguration`] is fixed for the duration of one run. It comes from
//! the command line, optionally overridden by a named [`Preset`].
//! [`HarnessConfig`] describes the machine (tool paths, output folder) and is
//! read from an optional TOML file.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ValueEnum;
use mpice_sim::paths::{NetworkConfiguration, TopologyScenario};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("logging level {0} out of range (1 = error … 5 = trace)")]
    LogLevel(u8),
    #[error("unknown scenario preset '{0}' (expected nat_fail, default or delay_wifi)")]
    UnknownPreset(String),
    #[error("unknown setup '{0}' (expected single, single+local, single+internet or full)")]
    UnknownSetup(String),
    #[error("invalid config TOML: {0}")]
    Toml(String),
    #[error("invalid namespace prefix '{0}'")]
    NamespacePrefix(String),
}

// ── Test configuration ─────────────────────────────────────────────────────

/// Verbosity of the processes under test, 1 (error) to 5 (trace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_number(level: u8) -> Result<Self, ConfigError> {
        match level {
            1 => Ok(LogLevel::Error),
            2 => Ok(LogLevel::Warn),
            3 => Ok(LogLevel::Info),
            4 => Ok(LogLevel::Debug),
            5 => Ok(LogLevel::Trace),
            other => Err(ConfigError::LogLevel(other)),
        }
    }

    /// Directive used for both `RUST_LOG` and the harness's own filter.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Workload run between the capture start and the teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestKind {
    /// Wired interface enabled 5 s after the transfer starts.
    Quicheperf,
    /// Cellular interface down at start, enabled after 10 s.
    QuicheperfIfInit,
    /// Wifi interface disabled mid-transfer and enabled again.
    QuicheperfIf,
    /// Full packet loss on the cellular path for 15 s.
    QuicheperfLoss,
    /// Short conntrack timeout and UNREPLIED flush on the first NAT.
    NatRebind,
    /// WebRTC ICE offer/answer pair.
    #[value(alias = "ice_ping")]
    PingPong,
    /// Network only, no processes.
    Debug,
}

impl TestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TestKind::Quicheperf => "quicheperf",
            TestKind::QuicheperfIfInit => "quicheperf-if-init",
            TestKind::QuicheperfIf => "quicheperf-if",
            TestKind::QuicheperfLoss => "quicheperf-loss",
            TestKind::NatRebind => "nat-rebind",
            TestKind::PingPong => "ping-pong",
            TestKind::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestConfiguration {
    pub setup: TopologyScenario,
    pub test: TestKind,
    pub duration_secs: u64,
    /// Passed verbatim to quicheperf's `-b`, e.g. `1MB`.
    pub throughput: String,
    pub log_level: LogLevel,
    pub enable_pcap: bool,
    pub enable_turn_server: bool,
    pub enable_cli_after_test: bool,
    pub change_file_permissions: bool,
    pub log_sslkeys: bool,
    pub combine_pcaps: bool,
    pub build_target: String,
    pub snat: bool,
    /// Per-path delays; the path toggles are derived from `setup`.
    pub delays: NetworkConfiguration,
}

impl Default for TestConfiguration {
    fn default() -> Self {
        Self {
            setup: TopologyScenario::Full,
            test: TestKind::Quicheperf,
            duration_secs: 100,
            throughput: "1MB".to_string(),
            log_level: LogLevel::Info,
            enable_pcap: true,
            enable_turn_server: true,
            enable_cli_after_test: false,
            change_file_permissions: true,
            log_sslkeys: false,
            combine_pcaps: false,
            build_target: "debug".to_string(),
            snat: false,
            delays: NetworkConfiguration::default(),
        }
    }
}

impl TestConfiguration {
    pub fn parse_setup(setup: &str) -> Result<TopologyScenario, ConfigError> {
        TopologyScenario::from_str(setup).map_err(|_| ConfigError::UnknownSetup(setup.to_string()))
    }

    /// Network description handed to the topology builder.
    pub fn network(&self) -> NetworkConfiguration {
        let mut network = self.setup.configure(self.delays.clone());
        network.snat = self.snat;
        network.enable_turn_host &= self.enable_turn_server;
        network
    }
}

// ── Presets ────────────────────────────────────────────────────────────────

/// Named configurations that reproduce specific NAT traversal timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Slow first hop on the internet path; shows the NAT dropping the
    /// late ICE checks.
    NatFail,
    /// Internet path just fast enough for the cellular candidate pair.
    Default,
    /// Slow wifi-direct path against a fast internet path.
    DelayWifi,
}

impl FromStr for Preset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nat_fail" => Ok(Preset::NatFail),
            "default" => Ok(Preset::Default),
            "delay_wifi" => Ok(Preset::DelayWifi),
            other => Err(ConfigError::UnknownPreset(other.to_string())),
        }
    }
}

impl Preset {
    pub fn as_str(self) -> &'static str {
        match self {
            Preset::NatFail => "nat_fail",
            Preset::Default => "default",
            Preset::DelayWifi => "delay_wifi",
        }
    }

    pub fn apply(self, conf: &mut TestConfiguration) {
        conf.log_level = LogLevel::Info;
        conf.enable_turn_server = true;
        conf.enable_cli_after_test = false;
        conf.enable_pcap = true;

        // (ext, ext_2, local, local_2, turn, wifi)
        let delays = match self {
            Preset::NatFail => {
                conf.setup = TopologyScenario::SingleWithInternet;
                conf.test = TestKind::PingPong;
                conf.snat = false;
                (10, 10, 35, 10, 10, 3)
            }
            Preset::Default => {
                conf.setup = TopologyScenario::Full;
                conf.test = TestKind::Quicheperf;
                (15, 15, 3, 3, 1, 5)
            }
            Preset::DelayWifi => {
                conf.setup = TopologyScenario::SingleWithInternet;
                conf.test = TestKind::Quicheperf;
                (10, 10, 5, 5, 1, 20)
            }
        };
        let d = &mut conf.delays;
        (
            d.internet_path_ext_delay,
            d.internet_path_ext_2_delay,
            d.internet_path_local_delay,
            d.internet_path_local_2_delay,
            d.internet_path_turn_delay,
            d.wifi_direct_path_delay,
        ) = delays;
    }
}

// ── Harness configuration ──────────────────────────────────────────────────

const DEFAULT_OUTPUT_ROOT: &str = "measurements";
const DEFAULT_NAMESPACE_PREFIX: &str = "mpice";
const MAX_NAMESPACE_PREFIX: usize = 32;
const DEFAULT_QUICHEPERF_DIR: &str = "../quicheperf";
const DEFAULT_WEBRTC_EXAMPLES_DIR: &str = "../webrtc/target/debug/examples";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HarnessConfigInput {
    pub output_root: Option<PathBuf>,
    pub namespace_prefix: Option<String>,
    pub tools: ToolPathsInput,
    pub log_filter: LogFilterInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolPathsInput {
    pub quicheperf_dir: Option<PathBuf>,
    pub webrtc_examples_dir: Option<PathBuf>,
    pub turnserver: Option<String>,
    pub tshark: Option<String>,
    pub mergecap: Option<String>,
    pub editcap: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogFilterInput {
    pub keep: Option<Vec<String>>,
    pub drop: Option<Vec<String>>,
}

/// Locations of the external programs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolPaths {
    /// Checkout of quicheperf; binaries under `target/<build>/`, certs under `src/`.
    pub quicheperf_dir: PathBuf,
    /// Directory holding the WebRTC `offer` / `answer` example binaries.
    pub webrtc_examples_dir: PathBuf,
    pub turnserver: String,
    pub tshark: String,
    pub mergecap: String,
    pub editcap: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            quicheperf_dir: PathBuf::from(DEFAULT_QUICHEPERF_DIR),
            webrtc_examples_dir: PathBuf::from(DEFAULT_WEBRTC_EXAMPLES_DIR),
            turnserver: "turnserver".to_string(),
            tshark: "tshark".to_string(),
            mergecap: "mergecap".to_string(),
            editcap: "editcap".to_string(),
        }
    }
}

impl ToolPaths {
    pub fn quicheperf_bin(&self, build_target: &str) -> PathBuf {
        self.quicheperf_dir
            .join("target")
            .join(build_target)
            .join("quicheperf")
    }

    pub fn quicheperf_cert(&self) -> PathBuf {
        self.quicheperf_dir.join("src").join("cert.crt")
    }

    pub fn quicheperf_key(&self) -> PathBuf {
        self.quicheperf_dir.join("src").join("cert.key")
    }

    pub fn webrtc_example(&self, name: &str) -> PathBuf {
        self.webrtc_examples_dir.join(name)
    }
}

/// Substrings (matched case-insensitively) for the filtered log copies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogFilter {
    pub keep: Vec<String>,
    pub drop: Vec<String>,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            keep: vec!["nominatedpair".into(), "candidate".into(), "path".into()],
            drop: vec!["rx pkt".into(), "tx pkt".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarnessConfig {
    pub output_root: PathBuf,
    pub namespace_prefix: String,
    pub tools: ToolPaths,
    pub log_filter: LogFilter,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from(DEFAULT_OUTPUT_ROOT),
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            tools: ToolPaths::default(),
            log_filter: LogFilter::default(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn lowercase_all(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

impl HarnessConfigInput {
    pub fn resolve(self) -> Result<HarnessConfig, ConfigError> {
        let defaults = HarnessConfig::default();

        let namespace_prefix =
            non_empty(self.namespace_prefix).unwrap_or(defaults.namespace_prefix);
        // namespaces are named "<prefix>-<node>"
        if namespace_prefix.len() > MAX_NAMESPACE_PREFIX
            || !namespace_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ConfigError::NamespacePrefix(namespace_prefix));
        }

        let tools = ToolPaths {
            quicheperf_dir: self
                .tools
                .quicheperf_dir
                .unwrap_or(defaults.tools.quicheperf_dir),
            webrtc_examples_dir: self
                .tools
                .webrtc_examples_dir
                .unwrap_or(defaults.tools.webrtc_examples_dir),
            turnserver: non_empty(self.tools.turnserver).unwrap_or(defaults.tools.turnserver),
            tshark: non_empty(self.tools.tshark).unwrap_or(defaults.tools.tshark),
            mergecap: non_empty(self.tools.mergecap).unwrap_or(defaults.tools.mergecap),
            editcap: non_empty(self.tools.editcap).unwrap_or(defaults.tools.editcap),
        };

        let log_filter = LogFilter {
            keep: self
                .log_filter
                .keep
                .map(lowercase_all)
                .unwrap_or(defaults.log_filter.keep),
            drop: self
                .log_filter
                .drop
                .map(lowercase_all)
                .unwrap_or(defaults.log_filter.drop),
        };

        Ok(HarnessConfig {
            output_root: self.output_root.unwrap_or(defaults.output_root),
            namespace_prefix,
            tools,
            log_filter,
        })
    }
}

impl HarnessConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(HarnessConfig::default());
        }
        let parsed: HarnessConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Toml(e.to_string()))?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Self::from_toml_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_map_to_filters() {
        assert_eq!(LogLevel::from_number(1).unwrap().as_filter(), "error");
        assert_eq!(LogLevel::from_number(3).unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_number(5).unwrap().as_filter(), "trace");
        assert_eq!(LogLevel::from_number(0), Err(ConfigError::LogLevel(0)));
        assert_eq!(LogLevel::from_number(6), Err(ConfigError::LogLevel(6)));
        assert!(LogLevel::Debug > LogLevel::Info);
    }

    #[test]
    fn test_kinds_parse_from_cli_names() {
        assert_eq!(
            TestKind::from_str("quicheperf-if-init", false).unwrap(),
            TestKind::QuicheperfIfInit
        );
        assert_eq!(TestKind::from_str("ice_ping", false).unwrap(), TestKind::PingPong);
        assert_eq!(TestKind::from_str("nat-rebind", false).unwrap(), TestKind::NatRebind);
        assert!(TestKind::from_str("iperf", false).is_err());
        for kind in TestKind::value_variants() {
            assert_eq!(TestKind::from_str(kind.as_str(), false).unwrap(), *kind);
        }
    }

    #[test]
    fn unknown_preset_is_an_error() {
        assert_eq!(
            "fast".parse::<Preset>(),
            Err(ConfigError::UnknownPreset("fast".into()))
        );
        assert_eq!("delay_wifi".parse::<Preset>().unwrap(), Preset::DelayWifi);
    }

    #[test]
    fn nat_fail_preset_sets_delays_and_ping_pong() {
        let mut conf = TestConfiguration {
            snat: true,
            enable_pcap: false,
            log_level: LogLevel::Trace,
            ..TestConfiguration::default()
        };
        Preset::NatFail.apply(&mut conf);

        assert_eq!(conf.setup, TopologyScenario::SingleWithInternet);
        assert_eq!(conf.test, TestKind::PingPong);
        assert!(!conf.snat);
        assert!(conf.enable_pcap);
        assert_eq!(conf.log_level, LogLevel::Info);
        assert_eq!(conf.delays.internet_path_local_delay, 35);
        assert_eq!(conf.delays.internet_path_local_2_delay, 10);
        assert_eq!(conf.delays.internet_path_ext_delay, 10);
        assert_eq!(conf.delays.internet_path_turn_delay, 10);
        assert_eq!(conf.delays.wifi_direct_path_delay, 3);
    }

    #[test]
    fn default_preset_keeps_snat_choice() {
        let mut conf = TestConfiguration {
            snat: true,
            ..TestConfiguration::default()
        };
        Preset::Default.apply(&mut conf);
        assert!(conf.snat);
        assert_eq!(conf.setup, TopologyScenario::Full);
        assert_eq!(conf.delays.internet_path_ext_2_delay, 15);
        assert_eq!(conf.delays.wifi_direct_path_delay, 5);
    }

    #[test]
    fn network_follows_setup_and_toggles() {
        let conf = TestConfiguration {
            setup: TopologyScenario::SingleWithLocal,
            snat: true,
            ..TestConfiguration::default()
        };
        let net = conf.network();
        assert!(net.enable_wifi_direct_path);
        assert!(net.enable_local_network_path);
        assert!(!net.enable_internet_path);
        assert!(!net.enable_turn_host);
        assert!(net.snat);

        let conf = TestConfiguration {
            enable_turn_server: false,
            ..TestConfiguration::default()
        };
        let net = conf.network();
        assert!(net.enable_internet_path);
        assert!(!net.enable_turn_host);
    }

    #[test]
    fn setup_names() {
        assert_eq!(
            TestConfiguration::parse_setup("default").unwrap(),
            TopologyScenario::Full
        );
        assert!(matches!(
            TestConfiguration::parse_setup("mesh"),
            Err(ConfigError::UnknownSetup(_))
        ));
    }

    #[test]
    fn empty_toml_gives_defaults() {
        assert_eq!(
            HarnessConfig::from_toml_str("  \n").unwrap(),
            HarnessConfig::default()
        );
    }

    #[test]
    fn parse_toml_harness_config() {
        let toml = r#"
            output_root = "/srv/runs"
            namespace_prefix = "exp"

            [tools]
            quicheperf_dir = "/opt/quicheperf"
            tshark = " /usr/bin/tshark "
            editcap = ""

            [log_filter]
            keep = ["ICE", " "]
        "#;
        let cfg = HarnessConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.output_root, PathBuf::from("/srv/runs"));
        assert_eq!(cfg.namespace_prefix, "exp");
        assert_eq!(
            cfg.tools.quicheperf_bin("release"),
            PathBuf::from("/opt/quicheperf/target/release/quicheperf")
        );
        assert_eq!(
            cfg.tools.quicheperf_cert(),
            PathBuf::from("/opt/quicheperf/src/cert.crt")
        );
        assert_eq!(cfg.tools.tshark, "/usr/bin/tshark");
        assert_eq!(cfg.tools.editcap, "editcap");
        assert_eq!(cfg.log_filter.keep, vec!["ice"]);
        assert_eq!(cfg.log_filter.drop, LogFilter::default().drop);
    }

    #[test]
    fn bad_toml_and_prefix_rejected() {
        assert!(matches!(
            HarnessConfig::from_toml_str("output_root = ["),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            HarnessConfig::from_toml_str("namespace_prefix = \"a-prefix-that-is-far-longer-than-needed\""),
            Err(ConfigError::NamespacePrefix(_))
        ));
        assert!(matches!(
            HarnessConfig::from_toml_str("namespace_prefix = \"a b\""),
            Err(ConfigError::NamespacePrefix(_))
        ));
    }
}
