use thiserror::Error;

/// Failures surfaced by the scenario engine and the emulator boundary.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("host '{0}' not found in topology")]
    HostNotFound(String),
    #[error("no emulated link with endpoint {host}:{iface}")]
    LinkNotFound { host: String, iface: String },
    #[error("command on {host} exited with {status:?}: `{command}`: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("interface {host}:{iface} already has an unconsumed snapshot")]
    SnapshotOverwrite { host: String, iface: String },
    #[error("no snapshot held for interface {host}:{iface}")]
    MissingSnapshot { host: String, iface: String },
    #[error("invalid name '{0}'")]
    InvalidName(String),
    #[error("loss percentage {0} outside 0..=100")]
    InvalidPercent(f32),
    #[error("scenario interrupted")]
    Interrupted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SimError {
    /// Unknown hosts and interruption abort a scenario regardless of the
    /// step's policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SimError::HostNotFound(_) | SimError::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
