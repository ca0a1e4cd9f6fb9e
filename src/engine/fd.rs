//! Descriptor primitives used on both sides of the fork.
//!
//! Everything here is a thin wrapper over a single syscall (plus an
//! `EINTR` retry loop) so it can be called in the child between `fork`
//! and `exec`: no allocation, no locks.

use std::collections::BTreeSet;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::libc;
use nix::unistd;

/// Run `f` until it stops failing with `EINTR`.
pub fn retry<T>(mut f: impl FnMut() -> Result<T, Errno>) -> Result<T, Errno> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            res => return res,
        }
    }
}

/// Borrow a raw number for one nix call. Negative numbers are rejected
/// up front (`BorrowedFd` cannot represent them).
fn borrow(fd: RawFd) -> Result<BorrowedFd<'static>, Errno> {
    if fd < 0 {
        return Err(Errno::EBADF);
    }
    Ok(unsafe { BorrowedFd::borrow_raw(fd) })
}

/// Close a raw descriptor.
///
/// Not retried on `EINTR`: Linux releases the descriptor even when
/// `close` is interrupted, and a retry could close a number another
/// thread has just been handed.
pub fn close(fd: RawFd) -> Result<(), Errno> {
    unistd::close(fd)
}

/// Close an owned descriptor, reporting the error `Drop` would swallow.
pub fn close_owned(fd: OwnedFd) -> Result<(), Errno> {
    unistd::close(fd)
}

/// Duplicate `fd` onto the lowest free descriptor `>= above`.
pub fn dup_above(fd: RawFd, above: RawFd, cloexec: bool) -> Result<RawFd, Errno> {
    let fd = borrow(fd)?;
    let arg = || if cloexec { FcntlArg::F_DUPFD_CLOEXEC(above) } else { FcntlArg::F_DUPFD(above) };
    retry(|| fcntl(fd, arg()))
}

/// `dup2(src, dst)`, retried on `EINTR` and `EBUSY`. The new `dst`
/// never has close-on-exec set.
///
/// `dst` is usually not open yet, which nix's `dup2` (it wants an
/// `OwnedFd` target) cannot express, hence the raw call.
pub fn dup2(src: RawFd, dst: RawFd) -> Result<(), Errno> {
    loop {
        match Errno::result(unsafe { libc::dup2(src, dst) }) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR | Errno::EBUSY) => continue,
            Err(e) => return Err(e),
        }
    }
}

fn fd_flags(fd: RawFd) -> Result<FdFlag, Errno> {
    let fd = borrow(fd)?;
    retry(|| fcntl(fd, FcntlArg::F_GETFD)).map(FdFlag::from_bits_truncate)
}

pub fn is_cloexec(fd: RawFd) -> Result<bool, Errno> {
    Ok(fd_flags(fd)?.contains(FdFlag::FD_CLOEXEC))
}

pub fn set_cloexec(fd: RawFd, on: bool) -> Result<(), Errno> {
    let mut flags = fd_flags(fd)?;
    flags.set(FdFlag::FD_CLOEXEC, on);
    let fd = borrow(fd)?;
    retry(|| fcntl(fd, FcntlArg::F_SETFD(flags))).map(drop)
}

/// Move the open file behind `fd` to a descriptor `>= above`, keeping
/// its close-on-exec flag, and close `fd`. Returns the new number.
pub fn relocate_raw(fd: RawFd, above: RawFd) -> Result<RawFd, Errno> {
    let cloexec = is_cloexec(fd)?;
    let new_fd = dup_above(fd, above, cloexec)?;
    if let Err(e) = close(fd) {
        let _ = close(new_fd);
        return Err(e);
    }
    Ok(new_fd)
}

/// Owned flavour of [`relocate_raw`]: ownership moves to the returned
/// descriptor, the original is closed.
pub fn relocate(fd: OwnedFd, above: RawFd) -> Result<OwnedFd, Errno> {
    let cloexec = is_cloexec(fd.as_raw_fd())?;
    let new_fd = dup_above(fd.as_raw_fd(), above, cloexec)?;
    let new_fd = unsafe { OwnedFd::from_raw_fd(new_fd) };
    close_owned(fd)?;
    Ok(new_fd)
}

/// An anonymous pipe with close-on-exec set on both ends, as
/// `(read, write)`.
pub fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    retry(|| nix::unistd::pipe2(OFlag::O_CLOEXEC))
}

/// Descriptor numbers claimed by a command's explicit redirections.
///
/// Internally allocated descriptors (pipe ends, opened files) must not
/// sit on one of these numbers when the child starts applying
/// redirections, or an explicit `dup2` would clobber them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReservedFds(BTreeSet<RawFd>);

impl ReservedFds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, fds: &[RawFd]) {
        self.0.extend(fds.iter().copied());
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.0.contains(&fd)
    }

    /// First descriptor number guaranteed to be free of reservations.
    pub fn above(&self) -> RawFd {
        self.0.last().map_or(0, |max| max + 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.0.iter().copied()
    }

    /// Relocate a raw descriptor if it is reserved; `fd` is updated in
    /// place.
    pub fn fix_raw(&self, fd: &mut RawFd) -> Result<(), Errno> {
        if *fd >= 0 && self.contains(*fd) {
            *fd = relocate_raw(*fd, self.above())?;
        }
        Ok(())
    }

    /// Relocate `slot` if its descriptor is reserved.
    pub fn fix_owned(&self, slot: &mut Option<OwnedFd>) -> Result<(), Errno> {
        if let Some(fd) = slot.take() {
            let fd = if self.contains(fd.as_raw_fd()) { relocate(fd, self.above())? } else { fd };
            *slot = Some(fd);
        }
        Ok(())
    }
}

impl FromIterator<RawFd> for ReservedFds {
    fn from_iter<I: IntoIterator<Item = RawFd>>(iter: I) -> Self {
        ReservedFds(iter.into_iter().collect())
    }
}
