use crate::command::{CommandOutput, HostCommand};
use crate::emulator::{Emulator, HostRef};
use crate::error::Result;
use crate::process::{ProcessHandle, ProcessSpec};

/// Name-addressed access to hosts of a running topology.
///
/// Every call resolves the host first, so a typo in a scenario surfaces as
/// [`crate::SimError::HostNotFound`] before anything is executed.
pub struct HostControl<'a, E: Emulator + ?Sized> {
    emulator: &'a E,
}

impl<E: Emulator + ?Sized> Clone for HostControl<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: Emulator + ?Sized> Copy for HostControl<'_, E> {}

impl<'a, E: Emulator + ?Sized> HostControl<'a, E> {
    pub fn new(emulator: &'a E) -> Self {
        Self { emulator }
    }

    pub fn emulator(&self) -> &'a E {
        self.emulator
    }

    pub fn host(&self, name: &str) -> Result<HostRef> {
        self.emulator.host(name)
    }

    /// Run to completion; the exit status is left for the caller to judge.
    pub fn run(&self, host: &str, command: &HostCommand) -> Result<CommandOutput> {
        let host_ref = self.host(host)?;
        let output = self.emulator.run(&host_ref, command)?;
        tracing::trace!(host, %command, status = ?output.status, "host command finished");
        Ok(output)
    }

    /// Run to completion, turning a non-zero exit into an error.
    pub fn run_checked(&self, host: &str, command: &HostCommand) -> Result<CommandOutput> {
        self.run(host, command)?.checked(host, command)
    }

    /// Whether the emulator created `iface` on `host`.
    pub fn has_interface(&self, host: &str, iface: &str) -> Result<bool> {
        self.host(host)?;
        Ok(self
            .emulator
            .nodes()
            .iter()
            .any(|n| n.name == host && n.interfaces.iter().any(|i| i == iface)))
    }

    pub fn spawn(&self, host: &str, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>> {
        let host_ref = self.host(host)?;
        self.emulator.spawn(&host_ref, spec)
    }
}
