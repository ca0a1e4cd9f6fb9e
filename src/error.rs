use nix::errno::Errno;

/// An OS failure captured while setting up or reaping a child process.
///
/// `errno` is the raw OS error; `message` says which step failed
/// (opening a redirection file, forking, the child's `exec`, ...).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}: {}", .errno.desc())]
pub struct SetupError {
    errno: Errno,
    message: String,
}

impl SetupError {
    pub fn new(errno: Errno, message: impl Into<String>) -> Self {
        SetupError { errno, message: message.into() }
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub(crate) trait Context<T> {
    fn context(self, message: impl FnOnce() -> String) -> Result<T, SetupError>;
}

impl<T> Context<T> for Result<T, Errno> {
    fn context(self, message: impl FnOnce() -> String) -> Result<T, SetupError> {
        self.map_err(|errno| SetupError::new(errno, message()))
    }
}

impl<T> Context<T> for std::io::Result<T> {
    fn context(self, message: impl FnOnce() -> String) -> Result<T, SetupError> {
        self.map_err(|e| {
            let errno = e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO);
            SetupError::new(errno, message())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_errno_description() {
        let err = SetupError::new(Errno::ENOENT, "Failed to open the file 'x' for reading");
        assert_eq!(err.message(), "Failed to open the file 'x' for reading");
        assert_eq!(err.errno(), Errno::ENOENT);
        assert_eq!(
            err.to_string(),
            format!("Failed to open the file 'x' for reading: {}", Errno::ENOENT.desc())
        );
    }

    #[test]
    fn test_io_error_keeps_os_code() {
        let io: std::io::Result<()> = Err(std::io::Error::from_raw_os_error(nix::libc::EACCES));
        let err = io.context(|| "open".to_string()).unwrap_err();
        assert_eq!(err.errno(), Errno::EACCES);
    }
}
