//! Descriptor-table checks. They look at the whole table of the test
//! process, so everything runs inside one test, one step at a time.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};

use nix::sys::signal::{Signal, kill};
use noshell::{Channel, Command, Redirect, Target, fd};

/// Open descriptors of `pid` (`"self"` for this process).
fn open_fds(pid: &str) -> BTreeSet<RawFd> {
    let names: Vec<String> = fs::read_dir(format!("/proc/{pid}/fd"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    let mut fds: BTreeSet<RawFd> = names.iter().filter_map(|n| n.parse().ok()).collect();
    if pid == "self" {
        // Drop the directory handle used for the listing.
        fds.retain(|&fd| fd::is_cloexec(fd).is_ok());
    }
    fds
}

/// Descriptors of this process a child would inherit.
fn inheritable_fds() -> BTreeSet<RawFd> {
    open_fds("self").into_iter().filter(|&fd| fd::is_cloexec(fd) == Ok(false)).collect()
}

/// Number the write end of a pipe gets when created right after
/// opening one file, the order a command materializes its redirections in.
fn pipe_write_end_after_one_file() -> RawFd {
    let file = File::open("/dev/null").unwrap();
    let (_r, w) = fd::cloexec_pipe().unwrap();
    let n = w.as_raw_fd();
    drop(file);
    n
}

fn child_sees_only_inherited_and_redirected() {
    let dir = tempfile::tempdir().unwrap();
    let before = open_fds("self");
    let inheritable = inheritable_fds();

    let out: Channel<File> = Channel::new();
    let mut handle = Command::from_args(["sleep", "5"])
        .redirect(7, Target::write(dir.path().join("seven")))
        .redirect(8, Target::pipe(noshell::Direction::Read, &out))
        .run();
    assert!(handle.is_pending(), "spawn failed: {:?}", handle.error());

    let pid = handle.pid().unwrap();
    let child = open_fds(&pid.as_raw().to_string());
    let allowed: BTreeSet<RawFd> = inheritable.iter().copied().chain([7, 8]).collect();
    assert!(child.is_subset(&allowed), "child has {child:?}, allowed {allowed:?}");
    assert!(child.contains(&7) && child.contains(&8));

    kill(pid, Signal::SIGKILL).unwrap();
    handle.wait();
    assert_eq!(handle.status().unwrap().signal(), Some(Signal::SIGKILL));
    drop(out.take());
    assert_eq!(open_fds("self"), before);
}

fn failed_spawns_leak_nothing() {
    let before = open_fds("self");

    let missing_input = Command::new("cat").stdin_from("/doesntexists").run_wait();
    assert!(missing_input.setup_error());

    let reader: Channel<File> = Channel::new();
    let bad_program = Command::new("/doesntexists")
        .redirect(1, Target::pipe(noshell::Direction::Read, &reader))
        .run();
    assert!(bad_program.setup_error());
    // Parent-side actions run before the child's verdict is read; the
    // caller's end only ever sees EOF.
    let mut leftover = String::new();
    reader.take().unwrap().read_to_string(&mut leftover).unwrap();
    assert!(leftover.is_empty());
    drop(bad_program);

    let exit = (Command::new("true") | Command::new("/doesntexists") | Command::new("true")).run_wait();
    assert_eq!(exit.failures().map(|(i, _)| i).collect::<Vec<_>>(), vec![1]);
    drop(exit);

    assert_eq!(open_fds("self"), before);
}

fn internal_pipe_end_moves_off_reserved_number() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("side");
    // Reserving that number for the file makes the pipe's write end land
    // on a descriptor the child is about to `dup2` the file onto.
    let explicit = pipe_write_end_after_one_file();
    let reader: Channel<File> = Channel::new();
    let to_file = if explicit < 10 {
        format!("echo to-file >&{explicit}")
    } else {
        format!("echo to-file >> /proc/self/fd/{explicit}")
    };
    let mut handle = Command::from_args(["sh", "-c", &format!("echo to-pipe; {to_file}")])
        .redirect(explicit, Target::write(&path))
        .redirect(1, Target::pipe(noshell::Direction::Read, &reader))
        .run();
    assert!(handle.is_pending(), "spawn failed: {:?}", handle.error());

    let mut piped = String::new();
    reader.take().unwrap().read_to_string(&mut piped).unwrap();
    handle.wait();
    assert!(handle.success());
    assert_eq!(piped, "to-pipe\n");
    assert_eq!(fs::read_to_string(&path).unwrap(), "to-file\n");
}

fn caller_fd_target_is_closed_in_child() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log");
    let file = File::create(&log).unwrap();
    let n = fd::dup_above(file.as_raw_fd(), 40, false).unwrap();
    drop(file);
    assert!(!fd::is_cloexec(n).unwrap());

    let check = format!("[ -e /proc/self/fd/{n} ] && echo open || echo closed");
    let handle = Command::from_args(["sh", "-c", &check]).redirect(1, n).run_wait();
    assert!(handle.success(), "{:?}", handle.error());
    assert_eq!(fs::read_to_string(&log).unwrap(), "closed\n");

    // The caller's descriptor is left alone.
    assert!(fd::is_cloexec(n).is_ok());
    fd::close(n).unwrap();
}

fn relocate_moves_and_closes() {
    let before = open_fds("self");
    let (r, w) = fd::cloexec_pipe().unwrap();
    let old = w.as_raw_fd();
    let w = fd::relocate(w, 500).unwrap();
    assert!(w.as_raw_fd() >= 500);
    assert!(fd::is_cloexec(w.as_raw_fd()).unwrap());
    assert!(!open_fds("self").contains(&old));

    let raw = fd::relocate_raw(std::os::fd::IntoRawFd::into_raw_fd(r), 600).unwrap();
    assert!(raw >= 600);
    fd::close(raw).unwrap();
    drop(w);
    assert_eq!(open_fds("self"), before);
}

#[test]
fn test_descriptor_table() {
    child_sees_only_inherited_and_redirected();
    failed_spawns_leak_nothing();
    internal_pipe_end_moves_off_reserved_number();
    caller_fd_target_is_closed_in_child();
    relocate_moves_and_closes();
}
