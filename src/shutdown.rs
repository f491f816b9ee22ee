//! Graceful-then-forceful shutdown shared by the coordinator and workers.
//!
//! The first interrupt moves the coordinator to [`ShutdownState::ShuttingDown`]
//! and wakes everything listening on [`ShutdownCoordinator::notified`]. If the
//! process has not finished shutting down when the grace period runs out, or
//! a second interrupt arrives, the force action runs (by default the process
//! exits with status 130).

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::error::{BuildError, Result};

/// Exit status used when shutdown is forced, as for SIGINT.
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Terminated,
}

type ForceAction = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    state: Mutex<ShutdownState>,
    /// Dropped on the first interrupt; receivers see a disconnect.
    notify_tx: Mutex<Option<Sender<()>>>,
    notify_rx: Receiver<()>,
    grace: Duration,
    force: ForceAction,
}

/// Tracks the shutdown state of one process. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .field("grace", &self.inner.grace)
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self::with_force_action(grace, || std::process::exit(FORCED_EXIT_CODE))
    }

    /// Use `force` instead of exiting the process when shutdown escalates.
    pub fn with_force_action(grace: Duration, force: impl Fn() + Send + Sync + 'static) -> Self {
        let (notify_tx, notify_rx) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ShutdownState::Running),
                notify_tx: Mutex::new(Some(notify_tx)),
                notify_rx,
                grace,
                force: Arc::new(force),
            }),
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(ShutdownState::Terminated)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    pub fn grace(&self) -> Duration {
        self.inner.grace
    }

    /// A receiver that disconnects once shutdown starts. Use it in a
    /// `select!` next to the channels a loop is waiting on.
    pub fn notified(&self) -> Receiver<()> {
        self.inner.notify_rx.clone()
    }

    /// Handle an interrupt signal or parent disconnect.
    ///
    /// The first call starts a graceful shutdown bounded by the grace period;
    /// a call while already shutting down escalates immediately.
    pub fn interrupt(&self) {
        match self.transition() {
            Some(ShutdownState::Running) => {
                info!(grace_ms = self.inner.grace.as_millis() as u64, "Interrupted, shutting down");
                self.arm_escalation();
            }
            Some(ShutdownState::ShuttingDown) => {
                warn!("Interrupted again, forcing shutdown");
                self.force();
            }
            _ => {}
        }
    }

    /// Start a graceful shutdown without a deadline.
    pub fn request_stop(&self) {
        if self.transition() == Some(ShutdownState::Running) {
            debug!("Stop requested");
        }
    }

    /// Mark shutdown as finished; disarms any pending escalation.
    pub fn complete(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            *state = ShutdownState::Terminated;
        }
        self.broadcast();
    }

    /// Move Running → ShuttingDown and wake listeners. Returns the state
    /// observed before the call.
    fn transition(&self) -> Option<ShutdownState> {
        let previous = {
            let mut state = self.inner.state.lock().ok()?;
            let previous = *state;
            if previous == ShutdownState::Running {
                *state = ShutdownState::ShuttingDown;
            }
            previous
        };
        if previous == ShutdownState::Running {
            self.broadcast();
        }
        Some(previous)
    }

    fn broadcast(&self) {
        if let Ok(mut tx) = self.inner.notify_tx.lock() {
            tx.take();
        }
    }

    fn arm_escalation(&self) {
        let coordinator = self.clone();
        let spawned = std::thread::Builder::new()
            .name("parabuild-shutdown".into())
            .spawn(move || {
                std::thread::sleep(coordinator.inner.grace);
                if coordinator.state() == ShutdownState::ShuttingDown {
                    warn!("Graceful shutdown timed out, forcing");
                    coordinator.force();
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Could not arm shutdown timer");
        }
    }

    fn force(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            *state = ShutdownState::Terminated;
        }
        self.broadcast();
        (self.inner.force)();
    }
}

static ACTIVE: Mutex<Option<ShutdownCoordinator>> = Mutex::new(None);
static INSTALLED: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Route SIGINT, SIGTERM and SIGHUP to `coordinator`.
///
/// The OS handler is installed once per process; later calls only swap the
/// coordinator it notifies.
pub fn install_signal_handler(coordinator: &ShutdownCoordinator) -> Result<()> {
    if let Ok(mut active) = ACTIVE.lock() {
        *active = Some(coordinator.clone());
    }
    INSTALLED
        .get_or_init(|| {
            ctrlc::set_handler(|| {
                let active = ACTIVE.lock().ok().and_then(|a| a.clone());
                if let Some(coordinator) = active {
                    coordinator.interrupt();
                }
            })
            .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(|e| {
            BuildError::Io(std::io::Error::other(format!(
                "Failed to install signal handler: {}",
                e
            )))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(grace: Duration) -> (ShutdownCoordinator, Arc<AtomicUsize>) {
        let forced = Arc::new(AtomicUsize::new(0));
        let counter = forced.clone();
        let coordinator = ShutdownCoordinator::with_force_action(grace, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (coordinator, forced)
    }

    #[test]
    fn test_interrupt_notifies_listeners() {
        let (coordinator, forced) = counting(Duration::from_secs(60));
        let notified = coordinator.notified();
        assert!(notified.try_recv().is_err());
        assert_eq!(coordinator.state(), ShutdownState::Running);

        coordinator.interrupt();
        assert_eq!(coordinator.state(), ShutdownState::ShuttingDown);
        assert!(matches!(
            notified.recv_timeout(Duration::from_millis(100)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));
        assert_eq!(forced.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_double_interrupt_forces() {
        let (coordinator, forced) = counting(Duration::from_secs(60));
        coordinator.interrupt();
        coordinator.interrupt();
        assert_eq!(forced.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.state(), ShutdownState::Terminated);
    }

    #[test]
    fn test_grace_expiry_forces() {
        let (coordinator, forced) = counting(Duration::from_millis(50));
        coordinator.interrupt();
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(forced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_complete_disarms_escalation() {
        let (coordinator, forced) = counting(Duration::from_millis(100));
        coordinator.interrupt();
        coordinator.complete();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(forced.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.state(), ShutdownState::Terminated);

        // Interrupts after completion are ignored.
        coordinator.interrupt();
        assert_eq!(forced.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_request_stop_has_no_deadline() {
        let (coordinator, forced) = counting(Duration::from_millis(20));
        coordinator.request_stop();
        assert!(coordinator.is_shutting_down());
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(forced.load(Ordering::SeqCst), 0);
    }
}
