//! Crash analysis for worker processes.

use std::fmt;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal other than the ones below.
    Signaled(Signal),
    /// SIGKILL: the OOM killer, or a forced shutdown.
    Killed,
    /// SIGSEGV or SIGBUS.
    Fault(Signal),
    /// The pipe closed but the process has not been reaped yet.
    StillAlive,
    Unknown,
}

impl TerminationReason {
    /// Whether the worker went away on its own terms.
    pub fn is_clean_exit(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {:?}", sig),
            Self::Killed => write!(f, "killed by SIGKILL (out of memory or forced stop)"),
            Self::Fault(sig) => write!(f, "crashed with {:?}", sig),
            Self::StillAlive => write!(f, "closed its pipe while still running"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Classify a `WaitStatus`.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::Killed,
        WaitStatus::Signaled(_, sig @ (Signal::SIGSEGV | Signal::SIGBUS), _) => {
            TerminationReason::Fault(sig)
        }
        WaitStatus::Signaled(_, sig, _) => TerminationReason::Signaled(sig),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}
