use std::iter::Enumerate;
use std::ops::Index;
use std::slice;

use nix::errno::Errno;
use nix::libc;
use nix::unistd::Pid;
use tracing::debug;

use super::fd;
use super::redirect::{ProcessSetup, Setup};
use super::status::{ResourceUsage, Status};
use crate::error::SetupError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    /// Spawned (or about to be), not reaped yet.
    Pending,
    SetupError(SetupError),
    Status(Status),
}

/// Outcome of spawning one process, and of waiting for it once
/// [`wait`](Self::wait) has been called.
#[derive(Debug)]
pub struct Handle {
    pid: Option<Pid>,
    outcome: Outcome,
    usage: Option<ResourceUsage>,
    // Redirections of this run, released once the child is reaped.
    setups: Vec<Setup>,
}

impl Handle {
    pub(crate) fn new() -> Self {
        Handle { pid: None, outcome: Outcome::Pending, usage: None, setups: Vec::new() }
    }

    pub(crate) fn failed(err: SetupError) -> Self {
        Handle::new().fail(err)
    }

    pub(crate) fn setups_mut(&mut self) -> &mut Vec<Setup> {
        &mut self.setups
    }

    pub(crate) fn set_pid(&mut self, pid: Pid) {
        self.pid = Some(pid);
    }

    /// Record a setup failure and drop every redirection of the run.
    pub(crate) fn fail(mut self, err: SetupError) -> Self {
        debug!(pid = ?self.pid, error = %err, "process setup failed");
        self.outcome = Outcome::SetupError(err);
        self.release_setups();
        self
    }

    fn release_setups(&mut self) {
        for setup in &mut self.setups {
            setup.parent_cleanup();
        }
        self.setups.clear();
    }

    /// Process id, if the fork happened.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn setup_error(&self) -> bool {
        matches!(self.outcome, Outcome::SetupError(_))
    }

    pub fn error(&self) -> Option<&SetupError> {
        match &self.outcome {
            Outcome::SetupError(e) => Some(e),
            _ => None,
        }
    }

    pub fn have_status(&self) -> bool {
        matches!(self.outcome, Outcome::Status(_))
    }

    pub fn status(&self) -> Option<Status> {
        match self.outcome {
            Outcome::Status(st) => Some(st),
            _ => None,
        }
    }

    /// Spawned successfully but not waited for yet.
    pub fn is_pending(&self) -> bool {
        self.outcome == Outcome::Pending
    }

    /// Resource counters; available once the child has been reaped.
    pub fn usage(&self) -> Option<&ResourceUsage> {
        self.usage.as_ref()
    }

    /// No setup error, and the process exited with code 0.
    pub fn success(&self) -> bool {
        self.success_with(false)
    }

    /// Like [`success`](Self::success), but with `ignore_broken_pipe` a
    /// process killed by SIGPIPE also counts: a producer whose consumer
    /// stopped reading early.
    pub fn success_with(&self, ignore_broken_pipe: bool) -> bool {
        match self.outcome {
            Outcome::Status(st) => st.success() || (ignore_broken_pipe && st.broken_pipe()),
            _ => false,
        }
    }

    /// Block until the process terminates, then record its status and
    /// resource usage. Does nothing if the handle is already resolved.
    pub fn wait(&mut self) {
        if !self.is_pending() {
            return;
        }
        let Some(pid) = self.pid else { return };

        let mut raw: libc::c_int = 0;
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        let res = fd::retry(|| Errno::result(unsafe { libc::wait4(pid.as_raw(), &mut raw, 0, &mut ru) }));
        match res {
            Ok(_) => {
                let status = Status::from_raw(raw);
                debug!(pid = pid.as_raw(), %status, "reaped child");
                self.outcome = Outcome::Status(status);
                self.usage = Some(ResourceUsage::from(&ru));
            }
            Err(errno) => {
                self.outcome = Outcome::SetupError(SetupError::new(errno, "Failed to wait for child process"));
            }
        }
        self.release_setups();
    }
}

/// Outcome of running a pipeline: one [`Handle`] per stage, in order.
#[derive(Debug, Default)]
pub struct Exit {
    handles: Vec<Handle>,
}

impl Exit {
    pub(crate) fn push(&mut self, handle: Handle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Handle> {
        self.handles.get(index)
    }

    pub fn iter(&self) -> slice::Iter<'_, Handle> {
        self.handles.iter()
    }

    pub fn handles(&self) -> &[Handle] {
        &self.handles
    }

    pub fn into_handles(self) -> Vec<Handle> {
        self.handles
    }

    /// Wait for every stage still running.
    pub fn wait(&mut self) {
        for handle in &mut self.handles {
            handle.wait();
        }
    }

    pub fn success(&self) -> bool {
        self.success_with(false)
    }

    pub fn success_with(&self, ignore_broken_pipe: bool) -> bool {
        self.handles.iter().all(|h| h.success_with(ignore_broken_pipe))
    }

    /// Stages that did not succeed, with their index in the pipeline.
    pub fn failures(&self) -> Failures<'_> {
        self.failures_with(false)
    }

    pub fn failures_with(&self, ignore_broken_pipe: bool) -> Failures<'_> {
        Failures { inner: self.handles.iter().enumerate(), ignore_broken_pipe }
    }
}

impl Index<usize> for Exit {
    type Output = Handle;

    fn index(&self, index: usize) -> &Handle {
        &self.handles[index]
    }
}

impl<'a> IntoIterator for &'a Exit {
    type Item = &'a Handle;
    type IntoIter = slice::Iter<'a, Handle>;

    fn into_iter(self) -> Self::IntoIter {
        self.handles.iter()
    }
}

/// Lazy view over the failed stages of an [`Exit`].
#[derive(Debug, Clone)]
pub struct Failures<'a> {
    inner: Enumerate<slice::Iter<'a, Handle>>,
    ignore_broken_pipe: bool,
}

impl<'a> Iterator for Failures<'a> {
    type Item = (usize, &'a Handle);

    fn next(&mut self) -> Option<Self::Item> {
        let ignore = self.ignore_broken_pipe;
        self.inner.by_ref().find(|(_, h)| !h.success_with(ignore))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.inner.size_hint().1)
    }
}
