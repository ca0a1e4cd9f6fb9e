use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::mem;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult, Pid, fork};
use tracing::debug;

use super::fd::{self, ReservedFds};
use super::handle::Handle;
use super::redirect::{HookSetup, ProcessSetup, Redirect, Redirection, Setup};
use crate::error::{Context, SetupError};
use crate::signals;

/// Size of the message a failing child sends back: its `errno`.
const RELAY_LEN: usize = mem::size_of::<libc::c_int>();

type Hook = Arc<dyn Fn() -> io::Result<()> + Send + Sync>;

/// One program invocation: argument list plus redirections.
///
/// Nothing happens until [`run`](Self::run); the same command can be run
/// again, every run opens its own files and pipes.
pub struct Command {
    args: Vec<OsString>,
    redirections: Vec<Redirection>,
    // Run after every redirection, whatever order they were attached in.
    hooks: Vec<Hook>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("args", &self.args)
            .field("redirections", &self.redirections)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl Command {
    /// `program` is looked up in `PATH` like `execvp` does.
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Command::from_args([program])
    }

    /// Build from a full argument vector, program name first.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command {
            args: args.into_iter().map(|a| a.as_ref().to_owned()).collect(),
            redirections: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn program(&self) -> Option<&OsStr> {
        self.args.first().map(OsString::as_os_str)
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Whether running this command hands the caller a live pipe end.
    pub fn has_channel(&self) -> bool {
        self.redirections.iter().any(|r| r.target().is_channel())
    }

    /// Run `f` in the child after all redirections (including ones
    /// attached later), right before `exec`. Hooks run in the order they
    /// were added. An error aborts the spawn and is reported like a
    /// failed `exec`.
    ///
    /// # Safety
    ///
    /// `f` runs between `fork` and `exec`, possibly in a copy of a
    /// multi-threaded process: it must not allocate, take locks, or
    /// otherwise do anything that is not async-signal-safe.
    pub unsafe fn pre_exec<F>(mut self, f: F) -> Self
    where
        F: Fn() -> io::Result<()> + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(f));
        self
    }

    /// Spawn the process. Returns once the child has exec'd or failed to;
    /// every failure ends up in the returned [`Handle`].
    pub fn run(&self) -> Handle {
        self.spawn(None)
    }

    /// [`run`](Self::run), then wait unless the spawn already failed.
    pub fn run_wait(&self) -> Handle {
        let mut handle = self.run();
        if !handle.setup_error() {
            handle.wait();
        }
        handle
    }

    /// Spawn with an extra setup applied before the command's own
    /// redirections (how a pipeline wires stages together).
    pub(crate) fn spawn(&self, chain: Option<Setup>) -> Handle {
        let mut handle = Handle::new();
        let mut reserved = ReservedFds::new();

        handle.setups_mut().extend(chain);
        for redirection in &self.redirections {
            match redirection.make_setup(&mut reserved) {
                Ok(setup) => handle.setups_mut().push(setup),
                Err(e) => return handle.fail(e),
            }
        }
        handle.setups_mut().extend(self.hooks.iter().map(|hook| Setup::Hook(HookSetup(Arc::clone(hook)))));

        let argv = match Argv::new(&self.args) {
            Ok(argv) => argv,
            Err(e) => return handle.fail(e),
        };

        let (relay_read, relay_write) =
            match fd::cloexec_pipe().context(|| "Failed to create the child relay pipe".to_string()) {
                Ok(pair) => pair,
                Err(e) => return handle.fail(e),
            };

        let child = match fd::retry(|| unsafe { fork() }) {
            Ok(ForkResult::Parent { child }) => child,
            Ok(ForkResult::Child) => {
                let _ = fd::close(relay_read.into_raw_fd());
                child_main(handle.setups_mut(), &reserved, &argv, relay_write)
            }
            Err(errno) => return handle.fail(SetupError::new(errno, "Failed to fork")),
        };

        handle.set_pid(child);
        debug!(pid = child.as_raw(), program = %argv.program(), "forked child");
        drop(relay_write);

        let parent_failure = handle.setups_mut().iter_mut().find_map(|setup| setup.parent_action().err());
        if let Some(e) = parent_failure {
            debug!(pid = child.as_raw(), cause = %e, "parent side of the redirections failed");
            kill_and_reap(child);
            return handle.fail(SetupError::new(e.errno(), "Parent process setup error"));
        }

        match read_relay(relay_read) {
            Ok(None) => handle,
            Ok(Some(errno)) => {
                reap(child);
                handle.fail(SetupError::new(errno, "Child process setup error"))
            }
            Err(e) => {
                kill_and_reap(child);
                handle.fail(e)
            }
        }
    }
}

impl Redirect for Command {
    fn push_redirection(&mut self, redirection: Redirection) {
        self.redirections.push(redirection);
    }
}

impl From<Command> for Handle {
    fn from(command: Command) -> Self {
        command.run_wait()
    }
}

/// `execvp` arguments, converted before forking so the child does not
/// allocate.
struct Argv {
    strings: Vec<CString>,
    // Points into `strings`, null-terminated.
    ptrs: Vec<*const libc::c_char>,
}

impl Argv {
    fn new(args: &[OsString]) -> Result<Self, SetupError> {
        if args.is_empty() {
            return Err(SetupError::new(Errno::EINVAL, "Empty command"));
        }
        let strings = args
            .iter()
            .map(|a| CString::new(a.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| SetupError::new(Errno::EINVAL, "Argument contains a NUL byte"))?;
        let mut ptrs: Vec<_> = strings.iter().map(|s| s.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        Ok(Argv { strings, ptrs })
    }

    fn program(&self) -> String {
        self.strings[0].to_string_lossy().into_owned()
    }
}

/// Everything the child does after `fork`. Never returns: the process
/// image is either replaced or the errno is relayed and the child exits.
fn child_main(setups: &mut [Setup], reserved: &ReservedFds, argv: &Argv, relay: OwnedFd) -> ! {
    let mut relay = Some(relay);
    let errno = match prepare_child(setups, reserved, argv, &mut relay) {
        Err(errno) => errno,
        Ok(never) => match never {},
    };
    if let Some(relay) = relay.as_ref() {
        send_errno(relay, errno);
    }
    unsafe { libc::_exit(127) }
}

fn prepare_child(
    setups: &mut [Setup],
    reserved: &ReservedFds,
    argv: &Argv,
    relay: &mut Option<OwnedFd>,
) -> Result<Infallible, Errno> {
    signals::restore_default()?;
    // The relay end must survive every dup2 below, including the
    // pipeline's onto stdin and stdout.
    if let Some(end) = relay.take() {
        let raw = end.as_raw_fd();
        let above = reserved.above().max(libc::STDERR_FILENO + 1);
        let clash = raw <= libc::STDERR_FILENO || reserved.contains(raw);
        *relay = Some(if clash { fd::relocate(end, above)? } else { end });
    }
    for setup in setups.iter_mut() {
        setup.fix_collisions(reserved)?;
    }
    for setup in setups.iter_mut() {
        setup.child_action()?;
    }
    unsafe { libc::execvp(argv.ptrs[0], argv.ptrs.as_ptr()) };
    Err(Errno::last())
}

fn send_errno(relay: &OwnedFd, errno: Errno) {
    let bytes = (errno as libc::c_int).to_ne_bytes();
    // Nothing left to report to if this fails.
    let _ = fd::retry(|| unistd::write(relay, &bytes));
}

/// Wait for the child's verdict. `Ok(None)`: the relay closed empty,
/// meaning close-on-exec fired and `exec` succeeded.
fn read_relay(relay: OwnedFd) -> Result<Option<Errno>, SetupError> {
    let mut relay = File::from(relay);
    let mut buf = [0u8; RELAY_LEN];
    loop {
        match relay.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(RELAY_LEN) => return Ok(Some(Errno::from_raw(libc::c_int::from_ne_bytes(buf)))),
            Ok(_) => return Err(SetupError::new(Errno::EIO, "Failed to read from the child relay pipe")),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context(|| "Failed to read from the child relay pipe".to_string()),
        }
    }
}

fn reap(pid: Pid) {
    let _ = fd::retry(|| waitpid(pid, None));
}

fn kill_and_reap(pid: Pid) {
    let _ = kill(pid, Signal::SIGKILL);
    reap(pid);
}
