use std::fmt;
use std::time::Duration;

use nix::libc;
use nix::sys::signal::Signal;

/// A decoded termination record, as filled in by `wait4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(libc::c_int);

impl Status {
    pub fn from_raw(raw: libc::c_int) -> Self {
        Status(raw)
    }

    pub fn raw(&self) -> libc::c_int {
        self.0
    }

    pub fn exited(&self) -> bool {
        libc::WIFEXITED(self.0)
    }

    /// Exit code; only meaningful when [`exited`](Self::exited).
    pub fn exit_status(&self) -> i32 {
        libc::WEXITSTATUS(self.0)
    }

    pub fn signaled(&self) -> bool {
        libc::WIFSIGNALED(self.0)
    }

    /// Terminating signal number; only meaningful when
    /// [`signaled`](Self::signaled).
    pub fn term_sig(&self) -> i32 {
        libc::WTERMSIG(self.0)
    }

    pub fn signal(&self) -> Option<Signal> {
        if self.signaled() { Signal::try_from(self.term_sig()).ok() } else { None }
    }

    pub fn core_dump(&self) -> bool {
        self.signaled() && libc::WCOREDUMP(self.0)
    }

    pub fn stopped(&self) -> bool {
        libc::WIFSTOPPED(self.0)
    }

    pub fn stop_sig(&self) -> i32 {
        libc::WSTOPSIG(self.0)
    }

    pub fn success(&self) -> bool {
        self.exited() && self.exit_status() == 0
    }

    /// Killed because it wrote to a pipe nobody reads anymore.
    pub fn broken_pipe(&self) -> bool {
        self.signaled() && self.term_sig() == libc::SIGPIPE
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exited() {
            write!(f, "exited with code {}", self.exit_status())
        } else if self.signaled() {
            match self.signal() {
                Some(sig) => write!(f, "killed by {}", sig)?,
                None => write!(f, "killed by signal {}", self.term_sig())?,
            }
            if self.core_dump() {
                write!(f, " (core dumped)")?;
            }
            Ok(())
        } else if self.stopped() {
            write!(f, "stopped by signal {}", self.stop_sig())
        } else {
            write!(f, "unknown status {:#x}", self.0)
        }
    }
}

/// Per-child resource counters captured when the child is reaped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub user_time: Duration,
    pub system_time: Duration,
    /// Peak resident set size in KiB.
    pub max_rss: i64,
    pub minor_faults: i64,
    pub major_faults: i64,
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

impl From<&libc::rusage> for ResourceUsage {
    fn from(ru: &libc::rusage) -> Self {
        ResourceUsage {
            user_time: timeval(ru.ru_utime),
            system_time: timeval(ru.ru_stime),
            max_rss: ru.ru_maxrss as i64,
            minor_faults: ru.ru_minflt as i64,
            major_faults: ru.ru_majflt as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Raw wait statuses in the Linux encoding.
    fn exited(code: i32) -> Status {
        Status::from_raw((code & 0xff) << 8)
    }

    fn killed(sig: i32, core: bool) -> Status {
        Status::from_raw(sig | if core { 0x80 } else { 0 })
    }

    #[test]
    fn test_exit_code() {
        let st = exited(4);
        assert!(st.exited());
        assert!(!st.signaled());
        assert_eq!(st.exit_status(), 4);
        assert!(!st.success());
        assert!(exited(0).success());
        assert_eq!(st.to_string(), "exited with code 4");
    }

    #[test]
    fn test_signaled() {
        let st = killed(libc::SIGKILL, false);
        assert!(!st.exited());
        assert!(st.signaled());
        assert_eq!(st.term_sig(), libc::SIGKILL);
        assert_eq!(st.signal(), Some(Signal::SIGKILL));
        assert!(!st.core_dump());
        assert!(!st.broken_pipe());
        assert_eq!(st.to_string(), "killed by SIGKILL");
    }

    #[test]
    fn test_core_dump_and_broken_pipe() {
        assert!(killed(libc::SIGSEGV, true).core_dump());
        assert_eq!(killed(libc::SIGSEGV, true).to_string(), "killed by SIGSEGV (core dumped)");
        assert!(killed(libc::SIGPIPE, false).broken_pipe());
        assert!(!exited(libc::SIGPIPE).broken_pipe());
    }

    #[test]
    fn test_stopped() {
        let st = Status::from_raw((libc::SIGSTOP << 8) | 0x7f);
        assert!(st.stopped());
        assert_eq!(st.stop_sig(), libc::SIGSTOP);
        assert!(!st.exited());
        assert!(!st.signaled());
    }

    #[test]
    fn test_usage_from_rusage() {
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        ru.ru_utime.tv_sec = 1;
        ru.ru_utime.tv_usec = 500;
        ru.ru_maxrss = 2048;
        ru.ru_minflt = 10;
        let usage = ResourceUsage::from(&ru);
        assert_eq!(usage.user_time, Duration::from_micros(1_000_500));
        assert_eq!(usage.system_time, Duration::ZERO);
        assert_eq!(usage.max_rss, 2048);
        assert_eq!(usage.minor_faults, 10);
        assert_eq!(usage.major_faults, 0);
    }
}
