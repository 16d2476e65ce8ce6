//! Scenario sequencing.
//!
//! A [`Scenario`] is a fixed list of steps: waits, condition changes,
//! process launches and NAT table snapshots. The [`Sequencer`] runs them in
//! order on the calling thread and always finishes with a cleanup phase that
//! terminates every process it started, brings interfaces it took down back
//! up and reverts conntrack timeouts it changed.
//!
//! Timing is a static guess about the behaviour of the process under test.
//! [`Action::WaitFor`] polls a readiness signal instead where one exists.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::command::{InterfaceId, LinkStatus};
use crate::conditions::{InterfaceToken, NetworkConditions};
use crate::conntrack::{ConntrackFilter, ConntrackProbe};
use crate::emulator::Emulator;
use crate::error::{Result, SimError};
use crate::host::HostControl;
use crate::process::{LogDestination, ProcessCapture, ProcessSpec};

const READINESS_POLL: Duration = Duration::from_millis(250);
const SLEEP_SLICE: Duration = Duration::from_millis(100);

// ── Clock ──────────────────────────────────────────────────────────────────

/// Source of blocking waits.
pub trait Clock {
    /// Block for `duration`, or fail with [`SimError::Interrupted`].
    fn sleep(&self, duration: Duration) -> Result<()>;

    fn interrupted(&self) -> bool {
        false
    }
}

/// Wall-clock sleeps that wake up early when the abort flag is raised.
#[derive(Debug, Clone, Default)]
pub struct SystemClock {
    abort: Arc<AtomicBool>,
}

impl SystemClock {
    pub fn new(abort: Arc<AtomicBool>) -> Self {
        Self { abort }
    }
}

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            if self.interrupted() {
                return Err(SimError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    fn interrupted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }
}

// ── Steps ──────────────────────────────────────────────────────────────────

/// Signal polled by [`Action::WaitFor`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Readiness {
    /// A log file contains `needle`.
    LogContains { path: PathBuf, needle: String },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        match self {
            Readiness::LogContains { path, needle } => std::fs::read_to_string(path)
                .map(|text| text.contains(needle.as_str()))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::LogContains { path, needle } => {
                write!(f, "'{needle}' in {}", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Condition {
    LinkStatus {
        host: String,
        peer: String,
        status: LinkStatus,
    },
    InterfaceDown {
        host: String,
        iface: String,
    },
    InterfaceUp {
        host: String,
        iface: String,
    },
    Loss {
        host: String,
        iface: String,
        percent: f32,
    },
    DefaultRoute {
        host: String,
        gateway: Ipv4Addr,
        iface: String,
    },
    ConntrackDelete {
        host: String,
        filter: ConntrackFilter,
    },
    ConntrackDeleteUnreplied {
        host: String,
    },
    ConntrackTimeout {
        host: String,
        seconds: u32,
    },
}

impl Condition {
    fn is_conntrack(&self) -> bool {
        matches!(
            self,
            Condition::ConntrackDelete { .. }
                | Condition::ConntrackDeleteUnreplied { .. }
                | Condition::ConntrackTimeout { .. }
        )
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::LinkStatus { host, peer, status } => write!(f, "link {host}-{peer} {status}"),
            Condition::InterfaceDown { host, iface } => write!(f, "iface {host}:{iface} down"),
            Condition::InterfaceUp { host, iface } => write!(f, "iface {host}:{iface} up"),
            Condition::Loss {
                host,
                iface,
                percent,
            } => write!(f, "loss {percent}% on {host}:{iface}"),
            Condition::DefaultRoute {
                host,
                gateway,
                iface,
            } => write!(f, "default route {host} via {gateway} dev {iface}"),
            Condition::ConntrackDelete { host, filter } => {
                write!(f, "conntrack delete on {host} [{}]", filter.args().join(" "))
            }
            Condition::ConntrackDeleteUnreplied { host } => {
                write!(f, "conntrack delete unreplied on {host}")
            }
            Condition::ConntrackTimeout { host, seconds } => {
                write!(f, "conntrack udp timeout {seconds}s on {host}")
            }
        }
    }
}

/// A process started by a scenario step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessLaunch {
    pub host: String,
    pub label: String,
    pub spec: ProcessSpec,
    pub log: LogDestination,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Action {
    Wait(Duration),
    WaitFor { probe: Readiness, timeout: Duration },
    Apply(Condition),
    Start(Vec<ProcessLaunch>),
    SnapshotNat { host: String },
}

impl Action {
    /// Conntrack manipulation and NAT snapshots are observational; everything
    /// else shapes the experiment and aborts on failure.
    pub fn default_policy(&self) -> FailurePolicy {
        match self {
            Action::Apply(cond) if cond.is_conntrack() => FailurePolicy::Continue,
            Action::SnapshotNat { .. } => FailurePolicy::Continue,
            _ => FailurePolicy::Abort,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Wait(d) => write!(f, "wait {:.1}s", d.as_secs_f64()),
            Action::WaitFor { probe, timeout } => {
                write!(f, "wait up to {:.1}s for {probe}", timeout.as_secs_f64())
            }
            Action::Apply(cond) => write!(f, "apply {cond}"),
            Action::Start(launches) => {
                let labels: Vec<&str> = launches.iter().map(|l| l.label.as_str()).collect();
                write!(f, "start {}", labels.join(", "))
            }
            Action::SnapshotNat { host } => write!(f, "snapshot conntrack of {host}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailurePolicy {
    Abort,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub action: Action,
    pub on_failure: FailurePolicy,
}

impl Step {
    pub fn new(action: Action) -> Self {
        let on_failure = action.default_policy();
        Self { action, on_failure }
    }
}

// ── Scenario ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn builder(name: &str) -> ScenarioBuilder {
        ScenarioBuilder {
            scenario: Scenario {
                name: name.to_string(),
                steps: Vec::new(),
            },
        }
    }

    /// Sum of the fixed waits, the lower bound of the run time.
    pub fn total_wait(&self) -> Duration {
        self.steps
            .iter()
            .filter_map(|s| match s.action {
                Action::Wait(d) => Some(d),
                _ => None,
            })
            .sum()
    }
}

pub struct ScenarioBuilder {
    scenario: Scenario,
}

impl ScenarioBuilder {
    pub fn step(mut self, action: Action) -> Self {
        self.scenario.steps.push(Step::new(action));
        self
    }

    pub fn wait(self, duration: Duration) -> Self {
        self.step(Action::Wait(duration))
    }

    pub fn wait_secs(self, secs: u64) -> Self {
        self.wait(Duration::from_secs(secs))
    }

    pub fn wait_for(self, probe: Readiness, timeout: Duration) -> Self {
        self.step(Action::WaitFor { probe, timeout })
    }

    pub fn apply(self, condition: Condition) -> Self {
        self.step(Action::Apply(condition))
    }

    pub fn start(self, launches: Vec<ProcessLaunch>) -> Self {
        self.step(Action::Start(launches))
    }

    pub fn snapshot_nat(self, host: &str) -> Self {
        self.step(Action::SnapshotNat {
            host: host.to_string(),
        })
    }

    pub fn link(self, host: &str, peer: &str, status: LinkStatus) -> Self {
        self.apply(Condition::LinkStatus {
            host: host.to_string(),
            peer: peer.to_string(),
            status,
        })
    }

    pub fn iface_down(self, host: &str, iface: &str) -> Self {
        self.apply(Condition::InterfaceDown {
            host: host.to_string(),
            iface: iface.to_string(),
        })
    }

    pub fn iface_up(self, host: &str, iface: &str) -> Self {
        self.apply(Condition::InterfaceUp {
            host: host.to_string(),
            iface: iface.to_string(),
        })
    }

    pub fn loss(self, host: &str, iface: &str, percent: f32) -> Self {
        self.apply(Condition::Loss {
            host: host.to_string(),
            iface: iface.to_string(),
            percent,
        })
    }

    /// Override the failure policy of the most recent step.
    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        if let Some(step) = self.scenario.steps.last_mut() {
            step.on_failure = policy;
        }
        self
    }

    pub fn build(self) -> Scenario {
        self.scenario
    }
}

// ── Report ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepError {
    pub index: usize,
    pub action: String,
    pub error: String,
}

/// Outcome of one [`Sequencer::run`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub steps_total: usize,
    pub steps_completed: usize,
    /// Time spent in waits, as seen by the clock.
    pub waited_secs: f64,
    pub wall_clock_secs: f64,
    pub captures_started: usize,
    pub captures_terminated: usize,
    pub interfaces_restored: usize,
    pub timeouts_reverted: usize,
    pub step_errors: Vec<StepError>,
    pub aborted: Option<StepError>,
    pub cleanup_warnings: Vec<String>,
}

impl ScenarioReport {
    pub fn succeeded(&self) -> bool {
        self.aborted.is_none()
    }
}

// ── Sequencer ──────────────────────────────────────────────────────────────

/// Runs scenarios against one topology, one at a time.
pub struct Sequencer<'a, E: Emulator + ?Sized, C: Clock> {
    conditions: NetworkConditions<'a, E>,
    clock: C,
    run_dir: PathBuf,
    captures: Vec<ProcessCapture>,
    tokens: BTreeMap<InterfaceId, InterfaceToken>,
    absent: BTreeSet<InterfaceId>,
    timeouts: Vec<(String, u32)>,
    waited: Duration,
}

impl<'a, E: Emulator + ?Sized, C: Clock> Sequencer<'a, E, C> {
    pub fn new(control: HostControl<'a, E>, run_dir: &Path, clock: C) -> Self {
        Self {
            conditions: NetworkConditions::new(control, run_dir),
            clock,
            run_dir: run_dir.to_path_buf(),
            captures: Vec::new(),
            tokens: BTreeMap::new(),
            absent: BTreeSet::new(),
            timeouts: Vec::new(),
            waited: Duration::ZERO,
        }
    }

    fn probe(&self) -> ConntrackProbe<'a, E> {
        ConntrackProbe::new(self.conditions.control())
    }

    fn sleep(&mut self, duration: Duration) -> Result<()> {
        self.clock.sleep(duration)?;
        self.waited += duration;
        Ok(())
    }

    pub fn run(&mut self, scenario: &Scenario) -> ScenarioReport {
        let started = Instant::now();
        self.waited = Duration::ZERO;
        let mut report = ScenarioReport {
            scenario: scenario.name.clone(),
            steps_total: scenario.steps.len(),
            ..ScenarioReport::default()
        };
        tracing::info!(scenario = %scenario.name, steps = scenario.steps.len(), "scenario started");

        for (index, step) in scenario.steps.iter().enumerate() {
            let outcome = if self.clock.interrupted() {
                Err(SimError::Interrupted)
            } else {
                tracing::debug!(index, action = %step.action, "step");
                self.execute(index, &step.action, &mut report)
            };
            let Err(err) = outcome else {
                report.steps_completed += 1;
                continue;
            };
            let failure = StepError {
                index,
                action: step.action.to_string(),
                error: err.to_string(),
            };
            if err.is_fatal() || step.on_failure == FailurePolicy::Abort {
                tracing::error!(index, action = %step.action, error = %err, "scenario aborted");
                report.aborted = Some(failure);
                break;
            }
            tracing::warn!(index, action = %step.action, error = %err, "step failed, continuing");
            report.step_errors.push(failure);
            report.steps_completed += 1;
        }

        self.cleanup(&mut report);
        report.waited_secs = self.waited.as_secs_f64();
        report.wall_clock_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            scenario = %scenario.name,
            completed = report.steps_completed,
            total = report.steps_total,
            waited_secs = report.waited_secs,
            success = report.succeeded(),
            "scenario finished"
        );
        report
    }

    fn execute(&mut self, index: usize, action: &Action, report: &mut ScenarioReport) -> Result<()> {
        match action {
            Action::Wait(duration) => self.sleep(*duration),
            Action::WaitFor { probe, timeout } => self.wait_for(probe, *timeout),
            Action::Apply(condition) => self.apply(condition),
            Action::Start(launches) => {
                for launch in launches {
                    let handle = self.conditions.control().spawn(&launch.host, &launch.spec)?;
                    self.captures
                        .push(ProcessCapture::new(&launch.label, handle, launch.log.clone()));
                    report.captures_started += 1;
                }
                Ok(())
            }
            Action::SnapshotNat { host } => {
                std::fs::create_dir_all(&self.run_dir)?;
                let path = self.run_dir.join(format!("{host}_conntrack_{index}.txt"));
                self.probe().print_table(host, &path)
            }
        }
    }

    fn wait_for(&mut self, probe: &Readiness, timeout: Duration) -> Result<()> {
        let mut waited = Duration::ZERO;
        loop {
            if probe.is_ready() {
                tracing::info!(%probe, waited_secs = waited.as_secs_f64(), "ready");
                return Ok(());
            }
            if waited >= timeout {
                tracing::warn!(%probe, timeout_secs = timeout.as_secs_f64(), "readiness wait timed out");
                return Ok(());
            }
            let slice = READINESS_POLL.min(timeout - waited);
            self.sleep(slice)?;
            waited += slice;
        }
    }

    fn apply(&mut self, condition: &Condition) -> Result<()> {
        match condition {
            Condition::LinkStatus { host, peer, status } => {
                self.conditions.link_set(host, peer, *status)
            }
            Condition::InterfaceDown { host, iface } => {
                match self.conditions.iface_down(host, iface)? {
                    Some(token) => {
                        self.tokens.insert(token.id().clone(), token);
                    }
                    None => {
                        self.absent.insert(InterfaceId::new(host, iface)?);
                    }
                }
                Ok(())
            }
            Condition::InterfaceUp { host, iface } => {
                let id = InterfaceId::new(host, iface)?;
                if let Some(token) = self.tokens.remove(&id) {
                    return self.conditions.iface_up(token);
                }
                if self.absent.remove(&id) {
                    tracing::debug!(%id, "interface was never taken down, nothing to bring up");
                    return Ok(());
                }
                Err(SimError::MissingSnapshot {
                    host: host.clone(),
                    iface: iface.clone(),
                })
            }
            Condition::Loss {
                host,
                iface,
                percent,
            } => self.conditions.loss(host, iface, *percent).map(|_| ()),
            Condition::DefaultRoute {
                host,
                gateway,
                iface,
            } => self.conditions.set_default_route(host, *gateway, iface),
            Condition::ConntrackDelete { host, filter } => {
                self.probe().delete_entries(host, filter).map(|_| ())
            }
            Condition::ConntrackDeleteUnreplied { host } => {
                self.probe().delete_unreplied(host).map(|_| ())
            }
            Condition::ConntrackTimeout { host, seconds } => {
                let previous = self.probe().set_timeout(host, *seconds)?;
                if let Some(previous) = previous {
                    // keep the value from before the first change
                    if !self.timeouts.iter().any(|(h, _)| h == host) {
                        self.timeouts.push((host.clone(), previous));
                    }
                }
                Ok(())
            }
        }
    }

    fn cleanup(&mut self, report: &mut ScenarioReport) {
        for mut capture in std::mem::take(&mut self.captures) {
            match capture.finish() {
                Ok(true) => report.captures_terminated += 1,
                Ok(false) => {}
                Err(err) => {
                    report.captures_terminated += 1;
                    let msg = format!("{}: {err}", capture.label());
                    tracing::warn!(label = capture.label(), error = %err, "failed to finish capture");
                    report.cleanup_warnings.push(msg);
                }
            }
        }

        // covers interfaces whose token was lost to a failed step as well
        self.tokens.clear();
        self.absent.clear();
        for (id, result) in self.conditions.restore_outstanding() {
            match result {
                Ok(()) => report.interfaces_restored += 1,
                Err(err) => {
                    tracing::warn!(%id, error = %err, "failed to restore interface");
                    report.cleanup_warnings.push(format!("{id}: {err}"));
                }
            }
        }

        for (host, previous) in std::mem::take(&mut self.timeouts).into_iter().rev() {
            match self.probe().set_timeout(&host, previous) {
                Ok(Some(_)) => report.timeouts_reverted += 1,
                Ok(None) => report
                    .cleanup_warnings
                    .push(format!("{host}: conntrack timeout not reverted")),
                Err(err) => {
                    tracing::warn!(%host, error = %err, "failed to revert conntrack timeout");
                    report.cleanup_warnings.push(format!("{host}: {err}"));
                }
            }
        }
    }
}
