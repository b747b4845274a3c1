//! Scan state and cooperative pause/stop control.
//!
//! [`ScanControl`] is shared between the configuration manager (which refuses
//! mutations unless the scanner is idle), the scan thread (which parks at
//! checkpoints while paused) and callers requesting pause, resume or stop.

use crate::error::{AppResult, LabError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Scanner lifecycle state.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> Armed ──thread up──> Running ──done/stop/error──> Idle
///                                       │   ▲
///                                  pause│   │resume
///                                       ▼   │
///                                      Paused
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// No scan; the configuration can be edited
    Idle,
    /// Validated and about to run
    Armed,
    /// Scan thread executing
    Running,
    /// Scan thread parked at a checkpoint
    Paused,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::Idle => write!(f, "Idle"),
            ScanState::Armed => write!(f, "Armed"),
            ScanState::Running => write!(f, "Running"),
            ScanState::Paused => write!(f, "Paused"),
        }
    }
}

impl ScanState {
    /// Check if the configuration may be changed.
    pub fn can_configure(&self) -> bool {
        matches!(self, ScanState::Idle)
    }

    /// Check if the state allows starting a new scan.
    pub fn can_begin(&self) -> bool {
        matches!(self, ScanState::Idle)
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(self, ScanState::Armed | ScanState::Running)
    }

    /// Check if the state allows resuming.
    pub fn can_resume(&self) -> bool {
        matches!(self, ScanState::Paused)
    }

    /// Armed, running or paused.
    pub fn is_active(&self) -> bool {
        !matches!(self, ScanState::Idle)
    }
}

/// Outcome of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Carry on with the next step
    Continue,
    /// A stop was requested
    Stop,
}

#[derive(Debug)]
struct ControlState {
    state: ScanState,
    pause_requested: bool,
    stop_requested: bool,
}

/// Shared scan state with pause and stop flags.
#[derive(Debug)]
pub struct ScanControl {
    inner: Mutex<ControlState>,
    changed: Condvar,
}

impl ScanControl {
    /// Idle control without pending request.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ControlState {
                state: ScanState::Idle,
                pause_requested: false,
                stop_requested: false,
            }),
            changed: Condvar::new(),
        })
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        self.inner.lock().state
    }

    /// Fails with [`LabError::ScanRunning`] unless the scanner is idle.
    pub fn ensure_idle(&self) -> AppResult<()> {
        if self.state().can_configure() {
            Ok(())
        } else {
            Err(LabError::ScanRunning)
        }
    }

    /// Idle -> Armed. Clears any leftover pause/stop request.
    pub(crate) fn arm(&self) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if !inner.state.can_begin() {
            return Err(LabError::ScanRunning);
        }
        inner.pause_requested = false;
        inner.stop_requested = false;
        self.set_state(&mut inner, ScanState::Armed);
        Ok(())
    }

    /// Armed -> Running.
    pub(crate) fn begin(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ScanState::Armed {
            self.set_state(&mut inner, ScanState::Running);
        }
    }

    /// Any state -> Idle.
    pub(crate) fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.pause_requested = false;
        inner.stop_requested = false;
        self.set_state(&mut inner, ScanState::Idle);
    }

    /// Asks the scan thread to park at its next checkpoint.
    pub fn request_pause(&self) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if inner.state.can_resume() {
            return Ok(());
        }
        if !inner.state.can_pause() {
            return Err(LabError::InvalidState(format!(
                "cannot pause while {}",
                inner.state
            )));
        }
        inner.pause_requested = true;
        Ok(())
    }

    /// Clears a pause request and wakes the parked scan thread.
    pub fn resume(&self) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if !inner.state.is_active() {
            return Err(LabError::InvalidState("no scan to resume".to_string()));
        }
        inner.pause_requested = false;
        self.changed.notify_all();
        Ok(())
    }

    /// Requests a stop; also releases a paused scan thread.
    pub fn request_stop(&self) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if !inner.state.is_active() {
            return Err(LabError::InvalidState("no scan to stop".to_string()));
        }
        inner.stop_requested = true;
        inner.pause_requested = false;
        self.changed.notify_all();
        Ok(())
    }

    /// Whether a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.inner.lock().stop_requested
    }

    /// Whether a pause was requested.
    pub fn is_pause_requested(&self) -> bool {
        self.inner.lock().pause_requested
    }

    /// Suspension point of the scan thread.
    ///
    /// Parks the calling thread while a pause is requested. `on_transition`
    /// is called without the lock held with `Paused` before parking and
    /// `Running` after waking up.
    pub(crate) fn checkpoint(&self, mut on_transition: impl FnMut(ScanState)) -> Checkpoint {
        let mut inner = self.inner.lock();
        if inner.pause_requested && !inner.stop_requested {
            self.set_state(&mut inner, ScanState::Paused);
            MutexGuard::unlocked(&mut inner, || on_transition(ScanState::Paused));

            while inner.pause_requested && !inner.stop_requested {
                self.changed.wait(&mut inner);
            }

            self.set_state(&mut inner, ScanState::Running);
            MutexGuard::unlocked(&mut inner, || on_transition(ScanState::Running));
        }

        if inner.stop_requested {
            Checkpoint::Stop
        } else {
            Checkpoint::Continue
        }
    }

    /// Sleeps for `duration`, waking early if a stop is requested.
    pub(crate) fn sleep(&self, duration: Duration) -> Checkpoint {
        let deadline = Instant::now() + duration;
        let mut inner = self.inner.lock();
        while !inner.stop_requested {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        if inner.stop_requested {
            Checkpoint::Stop
        } else {
            Checkpoint::Continue
        }
    }

    /// Blocks until the state equals `state` or `timeout` elapses.
    pub fn wait_for(&self, state: ScanState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.state != state {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return inner.state == state;
            }
        }
        true
    }

    fn set_state(&self, inner: &mut ControlState, state: ScanState) {
        inner.state = state;
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_state_guards() {
        assert!(ScanState::Idle.can_begin());
        assert!(ScanState::Idle.can_configure());
        assert!(!ScanState::Running.can_configure());
        assert!(!ScanState::Paused.can_configure());
        assert!(ScanState::Running.can_pause());
        assert!(!ScanState::Paused.can_pause());
        assert!(ScanState::Paused.can_resume());
        assert_eq!(ScanState::Armed.to_string(), "Armed");
    }

    #[test]
    fn test_mutation_rejected_unless_idle() {
        let control = ScanControl::new();
        assert!(control.ensure_idle().is_ok());
        control.arm().unwrap();
        assert!(matches!(control.ensure_idle(), Err(LabError::ScanRunning)));
        assert!(control.arm().is_err());
        control.finish();
        assert!(control.ensure_idle().is_ok());
    }

    #[test]
    fn test_pause_parks_until_resume() {
        let control = ScanControl::new();
        control.arm().unwrap();
        control.begin();
        control.request_pause().unwrap();

        let worker = {
            let control = control.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                let outcome = control.checkpoint(|state| seen.push(state));
                (outcome, seen)
            })
        };

        assert!(control.wait_for(ScanState::Paused, Duration::from_secs(5)));
        control.resume().unwrap();

        let (outcome, seen) = worker.join().unwrap();
        assert_eq!(outcome, Checkpoint::Continue);
        assert_eq!(seen, vec![ScanState::Paused, ScanState::Running]);
        assert_eq!(control.state(), ScanState::Running);
    }

    #[test]
    fn test_stop_releases_paused_thread() {
        let control = ScanControl::new();
        control.arm().unwrap();
        control.begin();
        control.request_pause().unwrap();

        let worker = {
            let control = control.clone();
            thread::spawn(move || control.checkpoint(|_| {}))
        };

        assert!(control.wait_for(ScanState::Paused, Duration::from_secs(5)));
        control.request_stop().unwrap();
        assert_eq!(worker.join().unwrap(), Checkpoint::Stop);
    }

    #[test]
    fn test_requests_need_active_scan() {
        let control = ScanControl::new();
        assert!(control.request_pause().is_err());
        assert!(control.resume().is_err());
        assert!(control.request_stop().is_err());
        assert!(!control.wait_for(ScanState::Running, Duration::from_millis(10)));
    }

    #[test]
    fn test_sleep_cut_short_by_stop() {
        let control = ScanControl::new();
        control.arm().unwrap();
        control.begin();
        assert_eq!(control.sleep(Duration::from_millis(5)), Checkpoint::Continue);

        let worker = {
            let control = control.clone();
            thread::spawn(move || {
                let started = Instant::now();
                (control.sleep(Duration::from_secs(30)), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        control.request_stop().unwrap();
        let (outcome, elapsed) = worker.join().unwrap();
        assert_eq!(outcome, Checkpoint::Stop);
        assert!(elapsed < Duration::from_secs(10));
    }
}
