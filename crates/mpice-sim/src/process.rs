//! Processes launched inside emulated hosts and their captured output.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::Result;

/// Separator written between stdout and stderr in captured log files.
pub const LOG_SEPARATOR: &str = "\n---------------------\n\n";

/// How long a terminated process gets to exit before it is killed.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Environment handed to one process under test.
///
/// Passed explicitly per spawn so one run's verbosity or key-log path never
/// leaks into another run through the harness's own environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessEnv {
    pub rust_log: Option<String>,
    pub ssl_key_log: Option<PathBuf>,
    pub extra: Vec<(String, String)>,
}

impl ProcessEnv {
    pub fn vars(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        if let Some(level) = &self.rust_log {
            vars.push(("RUST_LOG".to_string(), level.clone()));
        }
        if let Some(path) = &self.ssl_key_log {
            vars.push(("SSLKEYLOGFILE".to_string(), path.display().to_string()));
        }
        vars.extend(self.extra.iter().cloned());
        vars
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StdioPolicy {
    /// Pipe stdout/stderr back to the harness.
    Capture,
    /// Send stdout and stderr straight into one file.
    RedirectToFile(PathBuf),
    Inherit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: ProcessEnv,
    pub stdio: StdioPolicy,
}

impl ProcessSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            env: ProcessEnv::default(),
            stdio: StdioPolicy::Capture,
        }
    }

    pub fn with_env(mut self, env: ProcessEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_stdio(mut self, stdio: StdioPolicy) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output collected from a process after termination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A running child process as seen by the scenario engine.
pub trait ProcessHandle {
    fn id(&self) -> Option<u32>;

    fn is_running(&mut self) -> bool;

    /// Stop the process and collect whatever it wrote to captured pipes.
    fn terminate(&mut self) -> Result<ProcessOutput>;
}

/// Where a capture's output ends up once it is finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LogDestination {
    File(PathBuf),
    /// The process wrote its own log (shell redirection or a log flag).
    SelfManaged,
    Discard,
}

/// A running process plus the destination of its captured output.
///
/// [`ProcessCapture::finish`] terminates the process at most once; later
/// calls are no-ops.
pub struct ProcessCapture {
    label: String,
    handle: Option<Box<dyn ProcessHandle>>,
    log: LogDestination,
}

impl ProcessCapture {
    pub fn new(label: &str, handle: Box<dyn ProcessHandle>, log: LogDestination) -> Self {
        Self {
            label: label.to_string(),
            handle: Some(handle),
            log,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn log(&self) -> &LogDestination {
        &self.log
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_none()
    }

    /// Terminate the process and flush its output. Returns `false` when the
    /// capture was already finished.
    pub fn finish(&mut self) -> Result<bool> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(false);
        };
        let output = handle.terminate()?;
        tracing::debug!(label = %self.label, status = ?output.status, "process terminated");
        if let LogDestination::File(path) = &self.log {
            write_log(path, &output)?;
            tracing::info!(label = %self.label, path = %path.display(), "wrote process log");
        }
        Ok(true)
    }
}

impl std::fmt::Debug for ProcessCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCapture")
            .field("label", &self.label)
            .field("finished", &self.is_finished())
            .field("log", &self.log)
            .finish()
    }
}

/// Write captured stdout, a separator, then stderr.
pub fn write_log(path: &Path, output: &ProcessOutput) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(&output.stdout)?;
    file.write_all(LOG_SEPARATOR.as_bytes())?;
    file.write_all(&output.stderr)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// NamespaceProcess
// ---------------------------------------------------------------------------

/// A child process started through `ip netns exec`.
///
/// The child leads its own process group so the signal reaches the process
/// under test even when wrapped by `sudo ip netns exec`. Captured pipes are
/// drained by background threads so a chatty child never blocks on a full
/// pipe.
pub struct NamespaceProcess {
    child: Child,
    label: String,
    sudo: bool,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    terminated: bool,
}

impl NamespaceProcess {
    /// Spawn a prepared command with the given stdio policy.
    pub fn spawn(mut cmd: Command, label: &str, stdio: &StdioPolicy, sudo: bool) -> Result<Self> {
        use std::os::unix::process::CommandExt;

        cmd.process_group(0).stdin(Stdio::null());
        match stdio {
            StdioPolicy::Capture => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            StdioPolicy::RedirectToFile(path) => {
                let file = File::create(path)?;
                cmd.stdout(Stdio::from(file.try_clone()?))
                    .stderr(Stdio::from(file));
            }
            StdioPolicy::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }

        let mut child = cmd.spawn()?;
        tracing::debug!(%label, pid = child.id(), "spawned namespace process");

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        Ok(Self {
            child,
            label: label.to_string(),
            sudo,
            stdout,
            stderr,
            terminated: false,
        })
    }

    fn signal_group(&self, signal: libc::c_int, name: &str) {
        let pid = self.child.id();
        if self.sudo {
            let _ = Command::new("sudo")
                .args(["kill", &format!("-{name}"), "--", &format!("-{pid}")])
                .output();
        } else {
            // SAFETY: the pid is our own child's process group id; a stale
            // group only yields ESRCH.
            unsafe {
                libc::kill(-(pid as libc::pid_t), signal);
            }
        }
    }

    fn wait_until(&mut self, deadline: Instant) -> Option<i32> {
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return status.code().or(Some(-1)),
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                _ => return None,
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

impl ProcessHandle for NamespaceProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) -> Result<ProcessOutput> {
        if self.terminated {
            return Ok(ProcessOutput::default());
        }
        self.terminated = true;

        let mut status = match self.child.try_wait()? {
            Some(status) => status.code(),
            None => {
                self.signal_group(libc::SIGTERM, "TERM");
                self.wait_until(Instant::now() + TERM_GRACE)
            }
        };
        if status.is_none() {
            tracing::warn!(label = %self.label, "process ignored SIGTERM, killing");
            self.signal_group(libc::SIGKILL, "KILL");
            let _ = self.child.kill();
            status = self.child.wait()?.code();
        }

        Ok(ProcessOutput {
            status,
            stdout: join(self.stdout.take()),
            stderr: join(self.stderr.take()),
        })
    }
}

impl Drop for NamespaceProcess {
    fn drop(&mut self) {
        if !self.terminated {
            let _ = self.terminate();
        }
    }
}
