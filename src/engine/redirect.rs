//! Redirection blueprints and their per-run materializations.
//!
//! A [`Redirection`] describes what the caller wants ("fd 1 goes to this
//! file"). When a command runs, each one is turned into a [`Setup`]
//! owning the real descriptors for that run. A setup is then driven
//! through a fixed sequence around `fork`:
//!
//! 1. `fix_collisions` (child): move internal descriptors off numbers
//!    reserved by explicit redirections;
//! 2. `child_action` (child): the `dup2`/`close` work;
//! 3. `parent_action` (parent): drop the child's ends, hand caller
//!    channels their descriptor;
//! 4. `parent_cleanup` (parent): release whatever is left.
//!
//! Every descriptor has exactly one owner. In the child the setups are
//! never dropped normally (the child either execs or `_exit`s), so the
//! child side closes explicitly and the parent side relies on `OwnedFd`.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter};
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;

use super::fd::{self, ReservedFds};
use crate::error::{Context, SetupError};

// ── Caller-visible pipe ends ──────────────────────────────────────────────

/// Slot through which a pipe redirection hands its far end to the caller.
///
/// The slot is empty until the command has been spawned; afterwards
/// [`take`](Self::take) yields the descriptor (or stream) connected to
/// the child. Dropping the taken value closes the caller's end.
pub struct Channel<T>(Arc<Mutex<Option<T>>>);

impl<T> Channel<T> {
    pub fn new() -> Self {
        Channel(Arc::new(Mutex::new(None)))
    }

    pub fn take(&self) -> Option<T> {
        self.slot().take()
    }

    pub fn is_ready(&self) -> bool {
        self.slot().is_some()
    }

    fn put(&self, value: T) {
        *self.slot() = Some(value);
    }

    // The slot only ever holds a finished value, so a poisoned lock is
    // still consistent.
    fn slot(&self) -> MutexGuard<'_, Option<T>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel(Arc::clone(&self.0))
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("ready", &self.is_ready()).finish()
    }
}

/// Which way data flows through a pipe redirection, seen from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The child writes into its redirected descriptors, the caller reads.
    Read,
    /// The caller writes, the child reads from its redirected descriptors.
    Write,
}

/// Raw forms a pipe end can be handed over in.
pub trait PipeEnd: Sized {
    fn sink(channel: &Channel<Self>) -> Sink;
}

impl PipeEnd for OwnedFd {
    fn sink(channel: &Channel<Self>) -> Sink {
        Sink::Fd(channel.clone())
    }
}

impl PipeEnd for File {
    fn sink(channel: &Channel<Self>) -> Sink {
        Sink::File(channel.clone())
    }
}

/// Where the caller's end of a pipe redirection ends up.
#[derive(Debug, Clone)]
pub enum Sink {
    Fd(Channel<OwnedFd>),
    File(Channel<File>),
    Reader(Channel<BufReader<File>>),
    Writer(Channel<BufWriter<File>>),
}

impl Sink {
    fn direction(&self, requested: Direction) -> Direction {
        match self {
            Sink::Reader(_) => Direction::Read,
            Sink::Writer(_) => Direction::Write,
            Sink::Fd(_) | Sink::File(_) => requested,
        }
    }

    fn fill(&self, fd: OwnedFd) {
        match self {
            Sink::Fd(c) => c.put(fd),
            Sink::File(c) => c.put(File::from(fd)),
            Sink::Reader(c) => c.put(BufReader::new(File::from(fd))),
            Sink::Writer(c) => c.put(BufWriter::new(File::from(fd))),
        }
    }
}

// ── Redirection targets ───────────────────────────────────────────────────

/// How a named file is opened for a path redirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
    /// `<  file`
    Read,
    /// `>  file`, truncating
    Write,
    /// `>> file`
    Append,
}

/// What the redirected descriptors end up pointing at.
#[derive(Debug, Clone)]
pub enum Target {
    /// A descriptor already open in the calling process. It must stay
    /// open until the run has spawned; the child closes its copy after
    /// the `dup2`s unless the number is one of the sources.
    Fd(RawFd),
    /// A named file, opened in the parent before forking.
    Path(PathBuf, PathMode),
    /// A fresh pipe whose other end goes to the caller.
    Pipe(Direction, Sink),
}

impl Target {
    pub fn read(path: impl Into<PathBuf>) -> Self {
        Target::Path(path.into(), PathMode::Read)
    }

    pub fn write(path: impl Into<PathBuf>) -> Self {
        Target::Path(path.into(), PathMode::Write)
    }

    pub fn append(path: impl Into<PathBuf>) -> Self {
        Target::Path(path.into(), PathMode::Append)
    }

    /// Pipe whose caller end is delivered as a raw descriptor or `File`.
    pub fn pipe<T: PipeEnd>(direction: Direction, channel: &Channel<T>) -> Self {
        Target::Pipe(direction, T::sink(channel))
    }

    /// True when running hands the caller a live end of a pipe.
    pub fn is_channel(&self) -> bool {
        matches!(self, Target::Pipe(..))
    }
}

impl From<RawFd> for Target {
    fn from(fd: RawFd) -> Self {
        Target::Fd(fd)
    }
}

impl From<BorrowedFd<'_>> for Target {
    fn from(fd: BorrowedFd<'_>) -> Self {
        Target::Fd(fd.as_raw_fd())
    }
}

impl From<&File> for Target {
    fn from(file: &File) -> Self {
        Target::Fd(file.as_raw_fd())
    }
}

impl From<&Channel<BufReader<File>>> for Target {
    fn from(channel: &Channel<BufReader<File>>) -> Self {
        Target::Pipe(Direction::Read, Sink::Reader(channel.clone()))
    }
}

impl From<&Channel<BufWriter<File>>> for Target {
    fn from(channel: &Channel<BufWriter<File>>) -> Self {
        Target::Pipe(Direction::Write, Sink::Writer(channel.clone()))
    }
}

/// One or several descriptor numbers of the child to redirect.
pub trait IntoFds {
    fn into_fds(self) -> Vec<RawFd>;
}

impl IntoFds for RawFd {
    fn into_fds(self) -> Vec<RawFd> {
        vec![self]
    }
}

impl<const N: usize> IntoFds for [RawFd; N] {
    fn into_fds(self) -> Vec<RawFd> {
        self.to_vec()
    }
}

impl IntoFds for &[RawFd] {
    fn into_fds(self) -> Vec<RawFd> {
        self.to_vec()
    }
}

impl IntoFds for Vec<RawFd> {
    fn into_fds(self) -> Vec<RawFd> {
        self
    }
}

// ── Setters ───────────────────────────────────────────────────────────────

/// Blueprint for "redirect these child descriptors to this target".
///
/// Holds no OS resources; [`make_setup`](Self::make_setup) creates them
/// fresh for every run.
#[derive(Debug, Clone)]
pub struct Redirection {
    from: Vec<RawFd>,
    target: Target,
}

impl Redirection {
    pub fn new(from: impl IntoFds, target: impl Into<Target>) -> Self {
        Redirection { from: from.into_fds(), target: target.into() }
    }

    pub fn sources(&self) -> &[RawFd] {
        &self.from
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Materialize this redirection for one run. Files are opened, pipes
    /// created and caller descriptors checked here, in the parent, so
    /// failures surface before forking. The sources are recorded in
    /// `reserved`.
    pub(crate) fn make_setup(&self, reserved: &mut ReservedFds) -> Result<Setup, SetupError> {
        let setup = match &self.target {
            Target::Fd(to) => {
                fd::is_cloexec(*to).context(|| format!("Invalid descriptor {} for redirection", to))?;
                Setup::Fd(FdSetup { from: self.from.clone(), to: *to })
            }
            Target::Path(path, mode) => {
                let mut options = OpenOptions::new();
                let verb = match mode {
                    PathMode::Read => {
                        options.read(true);
                        "reading"
                    }
                    PathMode::Write => {
                        options.write(true).create(true).truncate(true);
                        "writing"
                    }
                    PathMode::Append => {
                        options.append(true).create(true);
                        "writing"
                    }
                };
                let file = options
                    .open(path)
                    .context(|| format!("Failed to open the file '{}' for {}", path.display(), verb))?;
                Setup::File(FileSetup { from: self.from.clone(), file: Some(file.into()) })
            }
            Target::Pipe(direction, sink) => {
                let (read, write) =
                    fd::cloexec_pipe().context(|| "Failed to create pipes for pipe redirection".to_string())?;
                let (child_end, parent_end) = match sink.direction(*direction) {
                    Direction::Read => (write, read),
                    Direction::Write => (read, write),
                };
                Setup::Pipe(PipeSetup {
                    from: self.from.clone(),
                    child_end: Some(child_end),
                    parent_end: Some(parent_end),
                    sink: sink.clone(),
                })
            }
        };
        reserved.extend(&self.from);
        Ok(setup)
    }
}

/// Builder methods for anything that takes redirections.
///
/// Redirections apply in the order they are attached; a later one on
/// the same descriptor wins. Targets are always resolved in the calling
/// process: `redirect(2, 1)` means "this process's stdout", not the
/// child's fd 1 after earlier redirections. Use `redirect([1, 2], ..)` to
/// send both streams to one target; two separate redirections onto the
/// same caller descriptor fail, since the first one closes it in the
/// child.
pub trait Redirect: Sized {
    fn push_redirection(&mut self, redirection: Redirection);

    fn redirect(mut self, from: impl IntoFds, to: impl Into<Target>) -> Self {
        self.push_redirection(Redirection::new(from, to));
        self
    }

    /// `< path`
    fn stdin_from(self, path: impl Into<PathBuf>) -> Self {
        self.redirect(nix::libc::STDIN_FILENO, Target::read(path))
    }

    /// `> path`
    fn stdout_to(self, path: impl Into<PathBuf>) -> Self {
        self.redirect(nix::libc::STDOUT_FILENO, Target::write(path))
    }

    /// `>> path`
    fn stdout_append(self, path: impl Into<PathBuf>) -> Self {
        self.redirect(nix::libc::STDOUT_FILENO, Target::append(path))
    }

    /// `2> path`
    fn stderr_to(self, path: impl Into<PathBuf>) -> Self {
        self.redirect(nix::libc::STDERR_FILENO, Target::write(path))
    }
}

// ── Setups ────────────────────────────────────────────────────────────────

/// The four steps every materialized redirection goes through.
pub(crate) trait ProcessSetup {
    /// Child, before any `child_action`.
    fn fix_collisions(&mut self, _reserved: &ReservedFds) -> Result<(), Errno> {
        Ok(())
    }

    /// Child, after `fork` and before `exec`. Must stay syscall-only.
    fn child_action(&mut self) -> Result<(), Errno> {
        Ok(())
    }

    /// Parent, right after `fork`.
    fn parent_action(&mut self) -> Result<(), SetupError> {
        Ok(())
    }

    /// Parent, once the child is reaped or the run failed.
    fn parent_cleanup(&mut self) {}
}

/// `dup2` `fd` onto every source. Returns whether `fd` itself is one of
/// the sources (and so must stay open).
fn dup_onto(fd: RawFd, sources: &[RawFd]) -> Result<bool, Errno> {
    let mut first_err = None;
    let mut is_source = false;
    for &src in sources {
        let res = if src == fd {
            is_source = true;
            fd::set_cloexec(fd, false)
        } else {
            fd::dup2(fd, src)
        };
        if let Err(e) = res {
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(is_source),
    }
}

/// Give up ownership without closing: the descriptor now lives on under
/// one of the redirected numbers.
fn release(slot: &mut Option<OwnedFd>) {
    if let Some(fd) = slot.take() {
        let _ = fd.into_raw_fd();
    }
}

fn close_slot(slot: &mut Option<OwnedFd>) -> Result<(), Errno> {
    match slot.take() {
        Some(fd) => fd::close_owned(fd),
        None => Ok(()),
    }
}

/// Redirect onto a descriptor of the calling process. The parent never
/// owns it; only the child's copy is closed.
#[derive(Debug)]
pub(crate) struct FdSetup {
    from: Vec<RawFd>,
    to: RawFd,
}

impl ProcessSetup for FdSetup {
    fn fix_collisions(&mut self, reserved: &ReservedFds) -> Result<(), Errno> {
        reserved.fix_raw(&mut self.to)
    }

    fn child_action(&mut self) -> Result<(), Errno> {
        if dup_onto(self.to, &self.from)? {
            return Ok(());
        }
        fd::close(self.to)
    }
}

/// Redirect onto a file opened for this run.
#[derive(Debug)]
pub(crate) struct FileSetup {
    from: Vec<RawFd>,
    file: Option<OwnedFd>,
}

impl ProcessSetup for FileSetup {
    fn fix_collisions(&mut self, reserved: &ReservedFds) -> Result<(), Errno> {
        reserved.fix_owned(&mut self.file)
    }

    fn child_action(&mut self) -> Result<(), Errno> {
        let Some(file) = self.file.as_ref() else { return Ok(()) };
        if dup_onto(file.as_raw_fd(), &self.from)? {
            release(&mut self.file);
            return Ok(());
        }
        close_slot(&mut self.file)
    }

    fn parent_action(&mut self) -> Result<(), SetupError> {
        self.file.take();
        Ok(())
    }

    fn parent_cleanup(&mut self) {
        self.file.take();
    }
}

/// Redirect onto one end of a fresh pipe; the other end goes to a
/// [`Channel`].
#[derive(Debug)]
pub(crate) struct PipeSetup {
    from: Vec<RawFd>,
    child_end: Option<OwnedFd>,
    parent_end: Option<OwnedFd>,
    sink: Sink,
}

impl ProcessSetup for PipeSetup {
    fn fix_collisions(&mut self, reserved: &ReservedFds) -> Result<(), Errno> {
        reserved.fix_owned(&mut self.child_end)?;
        reserved.fix_owned(&mut self.parent_end)
    }

    fn child_action(&mut self) -> Result<(), Errno> {
        let closed = close_slot(&mut self.parent_end);
        let Some(end) = self.child_end.as_ref() else { return closed };
        if dup_onto(end.as_raw_fd(), &self.from)? {
            release(&mut self.child_end);
        } else {
            close_slot(&mut self.child_end)?;
        }
        closed
    }

    fn parent_action(&mut self) -> Result<(), SetupError> {
        self.child_end.take();
        if let Some(end) = self.parent_end.take() {
            self.sink.fill(end);
        }
        Ok(())
    }

    fn parent_cleanup(&mut self) {
        self.child_end.take();
        self.parent_end.take();
    }
}

/// Wires one pipeline stage: stdin from the previous pipe, stdout into
/// the next one.
#[derive(Debug)]
pub(crate) struct ChainSetup {
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    // Read end of the next pipe. Owned by the pipeline loop in the
    // parent, only closed here in the child.
    peer: Option<RawFd>,
}

impl ChainSetup {
    pub(crate) fn new(stdin: Option<OwnedFd>, stdout: Option<OwnedFd>, peer: Option<RawFd>) -> Self {
        ChainSetup { stdin, stdout, peer }
    }
}

fn chain_onto(slot: &mut Option<OwnedFd>, target: RawFd) -> Result<(), Errno> {
    let Some(fd) = slot.as_ref() else { return Ok(()) };
    if dup_onto(fd.as_raw_fd(), &[target])? {
        release(slot);
        return Ok(());
    }
    close_slot(slot)
}

impl ProcessSetup for ChainSetup {
    // Stdin and stdout are claimed by the chain itself: a pipe end sitting
    // on 0 or 1 (the caller had them closed) would be clobbered by the
    // other end's `dup2`.
    fn fix_collisions(&mut self, reserved: &ReservedFds) -> Result<(), Errno> {
        let above = reserved.above().max(nix::libc::STDERR_FILENO + 1);
        for slot in [&mut self.stdin, &mut self.stdout] {
            if let Some(end) = slot.take() {
                let raw = end.as_raw_fd();
                let clash = raw <= nix::libc::STDOUT_FILENO || reserved.contains(raw);
                *slot = Some(if clash { fd::relocate(end, above)? } else { end });
            }
        }
        Ok(())
    }

    fn child_action(&mut self) -> Result<(), Errno> {
        if let Some(peer) = self.peer.take() {
            fd::close(peer)?;
        }
        chain_onto(&mut self.stdin, nix::libc::STDIN_FILENO)?;
        chain_onto(&mut self.stdout, nix::libc::STDOUT_FILENO)
    }

    fn parent_action(&mut self) -> Result<(), SetupError> {
        self.stdin.take();
        self.stdout.take();
        Ok(())
    }

    fn parent_cleanup(&mut self) {
        self.stdin.take();
        self.stdout.take();
    }
}

/// Caller code run in the child after all redirections.
pub(crate) struct HookSetup(pub(crate) Arc<dyn Fn() -> io::Result<()> + Send + Sync>);

impl ProcessSetup for HookSetup {
    fn child_action(&mut self) -> Result<(), Errno> {
        (self.0)().map_err(|e| e.raw_os_error().map_or(Errno::EINVAL, Errno::from_raw))
    }
}

impl fmt::Debug for HookSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HookSetup")
    }
}

/// A materialized redirection, owned by the [`Handle`](super::Handle)
/// of the run that created it.
#[derive(Debug)]
pub(crate) enum Setup {
    Fd(FdSetup),
    File(FileSetup),
    Pipe(PipeSetup),
    Chain(ChainSetup),
    Hook(HookSetup),
}

impl Setup {
    fn inner(&mut self) -> &mut dyn ProcessSetup {
        match self {
            Setup::Fd(s) => s,
            Setup::File(s) => s,
            Setup::Pipe(s) => s,
            Setup::Chain(s) => s,
            Setup::Hook(s) => s,
        }
    }
}

impl ProcessSetup for Setup {
    fn fix_collisions(&mut self, reserved: &ReservedFds) -> Result<(), Errno> {
        self.inner().fix_collisions(reserved)
    }

    fn child_action(&mut self) -> Result<(), Errno> {
        self.inner().child_action()
    }

    fn parent_action(&mut self) -> Result<(), SetupError> {
        self.inner().parent_action()
    }

    fn parent_cleanup(&mut self) {
        self.inner().parent_cleanup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, Read, Write};

    #[test]
    fn test_path_read_missing_file() {
        let mut reserved = ReservedFds::new();
        let r = Redirection::new(0, Target::read("/definitely/not/here"));
        let err = r.make_setup(&mut reserved).unwrap_err();
        assert_eq!(err.errno(), Errno::ENOENT);
        assert_eq!(err.message(), "Failed to open the file '/definitely/not/here' for reading");
        assert!(!reserved.contains(0));
    }

    #[test]
    fn test_path_write_creates_file_and_reserves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let mut reserved = ReservedFds::new();
        let r = Redirection::new([1, 2], Target::write(&path));
        let mut setup = r.make_setup(&mut reserved).unwrap();
        assert!(path.exists());
        assert!(reserved.contains(1) && reserved.contains(2));
        setup.parent_action().unwrap();
        match setup {
            Setup::File(f) => assert!(f.file.is_none()),
            other => panic!("unexpected setup {:?}", other),
        }
    }

    #[test]
    fn test_pipe_read_fills_reader_on_parent_action() {
        let channel: Channel<BufReader<File>> = Channel::new();
        let r = Redirection::new(1, &channel);
        assert!(r.target().is_channel());

        let mut setup = r.make_setup(&mut ReservedFds::new()).unwrap();
        let Setup::Pipe(pipe) = &mut setup else { panic!("expected pipe setup") };
        let child_end = pipe.child_end.take().unwrap();
        assert!(!channel.is_ready());

        setup.parent_action().unwrap();
        let mut reader = channel.take().unwrap();
        File::from(child_end).write_all(b"hello\n").unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "hello\n");
    }

    #[test]
    fn test_pipe_write_direction_for_raw_fd() {
        let channel: Channel<OwnedFd> = Channel::new();
        let r = Redirection::new(0, Target::pipe(Direction::Write, &channel));
        let mut setup = r.make_setup(&mut ReservedFds::new()).unwrap();
        let Setup::Pipe(pipe) = &mut setup else { panic!("expected pipe setup") };
        let child_end = pipe.child_end.take().unwrap();
        setup.parent_action().unwrap();

        File::from(channel.take().unwrap()).write_all(b"data").unwrap();
        let mut s = String::new();
        File::from(child_end).read_to_string(&mut s).unwrap();
        assert_eq!(s, "data");
    }

    #[test]
    fn test_cleanup_releases_pipe_ends() {
        let channel: Channel<File> = Channel::new();
        let r = Redirection::new(1, Target::pipe(Direction::Read, &channel));
        let mut setup = r.make_setup(&mut ReservedFds::new()).unwrap();
        setup.parent_cleanup();
        let Setup::Pipe(pipe) = &setup else { panic!("expected pipe setup") };
        assert!(pipe.child_end.is_none() && pipe.parent_end.is_none());
        assert!(!channel.is_ready());
    }

    #[test]
    fn test_fd_target_uses_caller_descriptor() {
        let file = tempfile::tempfile().unwrap();
        let mut reserved = ReservedFds::new();
        let mut setup = Redirection::new(2, &file).make_setup(&mut reserved).unwrap();
        let Setup::Fd(fd_setup) = &setup else { panic!("expected fd setup") };
        assert_eq!(fd_setup.to, file.as_raw_fd());
        assert!(reserved.contains(2));

        // Nothing to release on the parent side: the caller keeps it.
        setup.parent_action().unwrap();
        setup.parent_cleanup();
        assert!(fd::is_cloexec(file.as_raw_fd()).is_ok());
    }

    #[test]
    fn test_fd_target_must_be_open() {
        let mut reserved = ReservedFds::new();
        let err = Redirection::new(1, 999).make_setup(&mut reserved).unwrap_err();
        assert_eq!(err.errno(), Errno::EBADF);
        assert_eq!(err.message(), "Invalid descriptor 999 for redirection");
        assert!(!reserved.contains(1));
    }

    #[test]
    fn test_channel_is_send() {
        fn assert_send<T: Send + Sync>() {}
        assert_send::<Channel<BufReader<File>>>();
        assert_send::<Redirection>();
        assert_send::<HookSetup>();

        let channel: Channel<OwnedFd> = Channel::new();
        let other = channel.clone();
        let (_r, w) = fd::cloexec_pipe().unwrap();
        std::thread::spawn(move || other.put(w)).join().unwrap();
        assert!(channel.is_ready());
    }

    #[test]
    fn test_fd_target_conversions() {
        let file = tempfile::tempfile().unwrap();
        match Target::from(&file) {
            Target::Fd(fd) => assert_eq!(fd, file.as_raw_fd()),
            other => panic!("unexpected target {:?}", other),
        }
        assert!(!Target::from(2).is_channel());
        assert_eq!(Redirection::new([1, 2], 5).sources(), &[1, 2]);
    }
}
