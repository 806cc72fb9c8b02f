//! Signals a client sends to the server process.
//!
//! The server announces its PID on connect; the client uses it to reload,
//! toggle, pause, resume or terminate the adjustment daemon.

use clap::ValueEnum;
use std::fmt;
use std::io;

/// Control request sent as a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ControlAction {
    /// Reload the configuration script (SIGUSR1).
    Reload,
    /// Toggle the adjustments on or off (SIGUSR2).
    Toggle,
    /// Terminate gracefully (SIGTERM).
    Terminate,
    /// Terminate immediately (SIGTERM twice).
    PanicTerminate,
    /// Pause (SIGTSTP).
    Pause,
    /// Resume (SIGCONT).
    Resume,
}

impl ControlAction {
    /// Signals to deliver, in order.
    pub fn signals(self) -> &'static [libc::c_int] {
        match self {
            ControlAction::Reload => &[libc::SIGUSR1],
            ControlAction::Toggle => &[libc::SIGUSR2],
            ControlAction::Terminate => &[libc::SIGTERM],
            ControlAction::PanicTerminate => &[libc::SIGTERM, libc::SIGTERM],
            ControlAction::Pause => &[libc::SIGTSTP],
            ControlAction::Resume => &[libc::SIGCONT],
        }
    }
}

/// Signal delivery errors.
#[derive(Debug)]
pub enum ControlError {
    /// Not a usable process id.
    InvalidPid(u32),
    /// kill(2) failed.
    Signal {
        pid: u32,
        signal: libc::c_int,
        source: io::Error,
    },
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::InvalidPid(pid) => write!(f, "invalid server PID {}", pid),
            ControlError::Signal {
                pid,
                signal,
                source,
            } => write!(f, "failed to send signal {} to PID {}: {}", signal, pid, source),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Signal { source, .. } => Some(source),
            ControlError::InvalidPid(_) => None,
        }
    }
}

/// Handle for signalling the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerControl {
    pid: libc::pid_t,
}

impl ServerControl {
    /// Refuses 0 and values that do not fit a `pid_t`, which kill(2)
    /// would interpret as process groups.
    pub fn new(pid: u32) -> Result<Self, ControlError> {
        match libc::pid_t::try_from(pid) {
            Ok(raw) if raw > 0 => Ok(Self { pid: raw }),
            _ => Err(ControlError::InvalidPid(pid)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid as u32
    }

    /// Deliver the signals of `action`.
    pub fn signal(&self, action: ControlAction) -> Result<(), ControlError> {
        for &signal in action.signals() {
            self.send(signal)?;
        }
        Ok(())
    }

    fn send(&self, signal: libc::c_int) -> Result<(), ControlError> {
        // SAFETY: kill has no memory-safety preconditions; pid is positive.
        let rc = unsafe { libc::kill(self.pid, signal) };
        if rc != 0 {
            return Err(ControlError::Signal {
                pid: self.pid(),
                signal,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_mapping() {
        assert_eq!(ControlAction::Reload.signals(), &[libc::SIGUSR1]);
        assert_eq!(ControlAction::Toggle.signals(), &[libc::SIGUSR2]);
        assert_eq!(
            ControlAction::PanicTerminate.signals(),
            &[libc::SIGTERM, libc::SIGTERM]
        );
        assert_eq!(ControlAction::Pause.signals(), &[libc::SIGTSTP]);
    }

    #[test]
    fn test_action_names() {
        assert_eq!(
            ControlAction::from_str("panic-terminate", false),
            Ok(ControlAction::PanicTerminate)
        );
        assert_eq!(
            ControlAction::from_str("reload", false),
            Ok(ControlAction::Reload)
        );
        assert!(ControlAction::from_str("explode", false).is_err());
    }

    #[test]
    fn test_invalid_pid() {
        assert!(matches!(
            ServerControl::new(0),
            Err(ControlError::InvalidPid(0))
        ));
        assert!(matches!(
            ServerControl::new(u32::MAX),
            Err(ControlError::InvalidPid(_))
        ));
    }

    #[test]
    fn test_resume_self() {
        // SIGCONT to a running process is a no-op
        let control = ServerControl::new(std::process::id()).unwrap();
        control.signal(ControlAction::Resume).unwrap();
    }

    #[test]
    fn test_missing_process() {
        // Above any configurable pid_max
        let control = ServerControl::new(i32::MAX as u32).unwrap();
        match control.signal(ControlAction::Resume) {
            Err(ControlError::Signal { source, .. }) => {
                assert_eq!(source.raw_os_error(), Some(libc::ESRCH))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
