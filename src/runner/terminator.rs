use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerminateError {
    #[error("could not signal pid {pid}: {message}")]
    Signal { pid: u32, message: String },
}

/// Best-effort delivery of stop signals to a supervised child. Signalling a
/// process that already exited is a no-op, not an error.
pub struct ProcessTerminator {
    pid: u32,
}

impl ProcessTerminator {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

#[cfg(target_family = "unix")]
mod unix {
    use super::{ProcessTerminator, TerminateError};
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    impl ProcessTerminator {
        /// Asks the child to stop (SIGTERM). The caller owns the deadline and
        /// follows up with [`ProcessTerminator::kill`] if the child lingers.
        pub fn terminate(&self) -> Result<(), TerminateError> {
            self.send(Signal::SIGTERM)
        }

        /// Forcibly ends the child (SIGKILL).
        pub fn kill(&self) -> Result<(), TerminateError> {
            self.send(Signal::SIGKILL)
        }

        fn send(&self, signal: Signal) -> Result<(), TerminateError> {
            match signal::kill(Pid::from_raw(self.pid as i32), signal) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(err) => Err(TerminateError::Signal {
                    pid: self.pid,
                    message: err.to_string(),
                }),
            }
        }
    }
}

#[cfg(target_family = "windows")]
mod windows {
    use super::{ProcessTerminator, TerminateError};

    impl ProcessTerminator {
        // Pid-based process control is only wired up for Unix. Asking for a
        // graceful stop is a no-op and a forced kill reports the gap rather
        // than pretending the child was stopped.
        pub fn terminate(&self) -> Result<(), TerminateError> {
            Ok(())
        }

        pub fn kill(&self) -> Result<(), TerminateError> {
            Err(TerminateError::Signal {
                pid: self.pid,
                message: "force kill is not supported on this platform".to_string(),
            })
        }
    }
}
