//! Startup-failure side channel between the forked child and the keeper.
//!
//! The child writes at most one short diagnostic and exits with status 2.
//! The pipe is close-on-exec, so a successful `execve` closes the write end
//! without a word and the keeper reads EOF.

use crate::config::types::{KeeperError, Result, STARTUP_MESSAGE_MAX};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

pub struct StartupPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl StartupPipe {
    /// Non-blocking, close-on-exec pipe. Create before fork.
    pub fn create() -> Result<Self> {
        let mut fds = [-1; 2];
        // SAFETY: fds is a valid two-element buffer.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(KeeperError::Process(format!(
                "pipe: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: pipe2 succeeded, so both descriptors are fresh and owned by us.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }

    /// Keeper side; dropping the write end here is what makes EOF possible
    pub fn into_listener(self) -> StartupListener {
        StartupListener {
            read: File::from(self.read),
        }
    }

    /// Child side
    pub fn into_reporter(self) -> ChildReporter {
        ChildReporter { write: self.write }
    }
}

pub struct ChildReporter {
    write: OwnedFd,
}

impl ChildReporter {
    /// Send the diagnostic and terminate the child with status 2
    pub fn report_and_exit(self, message: &str) -> ! {
        let bytes = truncate_message(message);
        // SAFETY: bytes is a valid slice; a short or failed write loses only the text.
        unsafe {
            libc::write(self.write.as_raw_fd(), bytes.as_ptr().cast(), bytes.len());
            libc::_exit(2)
        }
    }
}

/// Cut a diagnostic to the pipe limit without splitting a UTF-8 sequence
pub fn truncate_message(message: &str) -> &[u8] {
    if message.len() <= STARTUP_MESSAGE_MAX {
        return message.as_bytes();
    }
    let mut end = STARTUP_MESSAGE_MAX;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message.as_bytes()[..end]
}

pub struct StartupListener {
    read: File,
}

impl StartupListener {
    /// Collect the child's diagnostic, if it sent one.
    /// Only meaningful once the child has been reaped.
    pub fn take_report(&mut self) -> Result<Option<String>> {
        let mut buf = [0u8; STARTUP_MESSAGE_MAX + 1];
        loop {
            match self.read.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    return Ok(Some(String::from_utf8_lossy(&buf[..n]).into_owned()));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(KeeperError::Process(format!("read from error pipe: {}", e)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::waitpid;
    use nix::unistd::{fork, ForkResult};

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("short"), b"short");
        let long = "x".repeat(5000);
        assert_eq!(truncate_message(&long).len(), STARTUP_MESSAGE_MAX);
        let wide = "é".repeat(1000);
        let cut = truncate_message(&wide);
        assert!(cut.len() <= STARTUP_MESSAGE_MAX);
        assert!(std::str::from_utf8(cut).is_ok());
    }

    #[test]
    fn test_child_report_reaches_keeper() {
        let pipe = StartupPipe::create().unwrap();
        let read_fd = pipe.read.as_raw_fd();
        let write_fd = pipe.write.as_raw_fd();
        // SAFETY: the child only writes to the pipe and exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                unsafe { libc::close(read_fd) };
                // SAFETY: the child owns its copy of the descriptor.
                let reporter = ChildReporter {
                    write: unsafe { OwnedFd::from_raw_fd(write_fd) },
                };
                reporter.report_and_exit("execve(\"/nope\"): No such file or directory");
            }
            ForkResult::Parent { child } => {
                let mut listener = pipe.into_listener();
                waitpid(child, None).unwrap();
                let report = listener.take_report().unwrap();
                assert_eq!(
                    report.as_deref(),
                    Some("execve(\"/nope\"): No such file or directory")
                );
            }
        }
    }

    #[test]
    fn test_silent_pipe_reads_as_no_report() {
        let mut listener = StartupPipe::create().unwrap().into_listener();
        assert_eq!(listener.take_report().unwrap(), None);
    }
}
