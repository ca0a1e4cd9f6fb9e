use std::ops::BitOr;
use std::os::fd::{AsRawFd, OwnedFd};

use tracing::{debug, trace, warn};

use super::command::Command;
use super::fd;
use super::handle::{Exit, Handle};
use super::redirect::{ChainSetup, Redirect, Redirection, Setup};
use crate::error::{Context, SetupError};

/// Commands connected stdout-to-stdin by anonymous pipes.
#[derive(Debug)]
pub struct PipeLine {
    commands: Vec<Command>,
    auto_wait: bool,
}

impl Default for PipeLine {
    fn default() -> Self {
        PipeLine { commands: Vec::new(), auto_wait: true }
    }
}

impl PipeLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn push(&mut self, command: Command) {
        if command.has_channel() {
            self.auto_wait = false;
        }
        self.commands.push(command);
    }

    /// Builder form of [`push`](Self::push).
    pub fn pipe(mut self, command: Command) -> Self {
        self.push(command);
        self
    }

    /// `self | other`: `other`'s stages run after this pipeline's.
    pub fn then(mut self, other: PipeLine) -> Self {
        self.commands.extend(other.commands);
        self.auto_wait &= other.auto_wait;
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Cleared once any stage hands the caller a live pipe end.
    pub fn auto_wait(&self) -> bool {
        self.auto_wait
    }

    /// Spawn every stage, first to last, without waiting on any.
    ///
    /// The returned [`Exit`] always holds one handle per stage. If the
    /// pipe feeding a stage cannot be created, that stage and the ones
    /// after it are reported as setup errors and never spawned.
    pub fn run(&self) -> Exit {
        let mut exit = Exit::default();
        let mut prev_read: Option<OwnedFd> = None;
        let last = self.commands.len().saturating_sub(1);

        for (stage, command) in self.commands.iter().enumerate() {
            let (next_read, write) = if stage < last {
                match fd::cloexec_pipe().context(|| "Failed to create pipe between pipeline stages".to_string()) {
                    Ok((r, w)) => (Some(r), Some(w)),
                    Err(e) => {
                        abort_from(&mut exit, stage, self.commands.len(), e);
                        break;
                    }
                }
            } else {
                (None, None)
            };

            trace!(
                stage,
                stdin = ?prev_read.as_ref().map(AsRawFd::as_raw_fd),
                stdout = ?write.as_ref().map(AsRawFd::as_raw_fd),
                "wiring pipeline stage"
            );
            let peer = next_read.as_ref().map(AsRawFd::as_raw_fd);
            let chain = Setup::Chain(ChainSetup::new(prev_read.take(), write, peer));
            let handle = command.spawn(Some(chain));
            debug!(stage, pid = ?handle.pid(), setup_error = handle.setup_error(), "spawned pipeline stage");
            exit.push(handle);
            prev_read = next_read;
        }
        exit
    }

    /// [`run`](Self::run), then wait for every stage.
    pub fn run_wait(&self) -> Exit {
        let mut exit = self.run();
        exit.wait();
        exit
    }

    /// [`run`](Self::run), waiting only if [`auto_wait`](Self::auto_wait)
    /// is still set.
    pub fn run_wait_auto(&self) -> Exit {
        if self.auto_wait { self.run_wait() } else { self.run() }
    }
}

fn abort_from(exit: &mut Exit, stage: usize, total: usize, err: SetupError) {
    debug!(stage, error = %err, "pipeline aborted");
    for _ in stage..total {
        exit.push(Handle::failed(err.clone()));
    }
}

/// Redirections on a pipeline go to its last stage.
impl Redirect for PipeLine {
    fn push_redirection(&mut self, redirection: Redirection) {
        if redirection.target().is_channel() {
            self.auto_wait = false;
        }
        match self.commands.last_mut() {
            Some(command) => command.push_redirection(redirection),
            None => warn!(?redirection, "redirection on an empty pipeline ignored"),
        }
    }
}

impl From<Command> for PipeLine {
    fn from(command: Command) -> Self {
        PipeLine::new().pipe(command)
    }
}

impl From<PipeLine> for Exit {
    fn from(pipeline: PipeLine) -> Self {
        pipeline.run_wait_auto()
    }
}

impl BitOr for PipeLine {
    type Output = PipeLine;

    fn bitor(self, rhs: PipeLine) -> PipeLine {
        self.then(rhs)
    }
}

impl BitOr<Command> for PipeLine {
    type Output = PipeLine;

    fn bitor(self, rhs: Command) -> PipeLine {
        self.pipe(rhs)
    }
}

impl BitOr for Command {
    type Output = PipeLine;

    fn bitor(self, rhs: Command) -> PipeLine {
        PipeLine::from(self).pipe(rhs)
    }
}

impl BitOr<PipeLine> for Command {
    type Output = PipeLine;

    fn bitor(self, rhs: PipeLine) -> PipeLine {
        PipeLine::from(self).then(rhs)
    }
}
