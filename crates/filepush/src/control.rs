//! Run/pause/stop handshake between a pump's owner and its worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::PumpError;

/// How often a waiting `pause()` re-sends the interrupt, in case the first one
/// landed while the worker was not blocked in a syscall.
const PAUSE_REINTERRUPT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Stopped,
    Running,
    PauseRequested,
    Paused,
}

#[derive(Debug)]
struct ControlCell {
    state: PumpState,
    /// The worker is inside its copy loop (not parked, not exited).
    worker_active: bool,
}

/// Mutex + condition variable state machine shared by owner and worker.
///
/// The owner drives `begin_run`, `pause`, `resume` and `request_stop`; the
/// worker polls `should_halt` after every blocking call and calls `park` when
/// its copy loop exits.
#[derive(Debug)]
pub struct PauseController {
    cell: Mutex<ControlCell>,
    cond: Condvar,
    /// Lock-free mirror of `state != Running`.
    halt: AtomicBool,
}

impl Default for PauseController {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseController {
    pub fn new() -> Self {
        Self {
            cell: Mutex::new(ControlCell {
                state: PumpState::Stopped,
                worker_active: false,
            }),
            cond: Condvar::new(),
            halt: AtomicBool::new(true),
        }
    }

    fn set_state(&self, cell: &mut MutexGuard<'_, ControlCell>, state: PumpState) {
        cell.state = state;
        self.halt
            .store(state != PumpState::Running, Ordering::Release);
    }

    pub fn state(&self) -> PumpState {
        self.cell.lock().state
    }

    /// Whether the worker must leave its copy loop (stop or pause pending).
    pub fn should_halt(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    pub fn stop_requested(&self) -> bool {
        self.state() == PumpState::Stopped
    }

    /// Owner: Stopped -> Running, before the worker is spawned.
    pub fn begin_run(&self) -> Result<(), PumpError> {
        let mut cell = self.cell.lock();
        if cell.state != PumpState::Stopped || cell.worker_active {
            return Err(PumpError::AlreadyRunning);
        }
        self.set_state(&mut cell, PumpState::Running);
        cell.worker_active = true;
        Ok(())
    }

    /// Owner: undo `begin_run` when the worker could not be spawned or died.
    pub fn abort_run(&self) {
        let mut cell = self.cell.lock();
        self.set_state(&mut cell, PumpState::Stopped);
        cell.worker_active = false;
        self.cond.notify_all();
    }

    /// Worker: the thread is unwinding and will never reach `park`.
    ///
    /// Leaves the pump Stopped so that `pause` and `begin_run` do not wait on
    /// a worker that is gone.
    pub fn worker_lost(&self) {
        let mut cell = self.cell.lock();
        warn!(state = ?cell.state, "worker lost");
        self.set_state(&mut cell, PumpState::Stopped);
        cell.worker_active = false;
        self.cond.notify_all();
    }

    /// Owner: request termination and release a paused worker.
    ///
    /// Returns whether a run was in progress.
    pub fn request_stop(&self) -> bool {
        let mut cell = self.cell.lock();
        let was_running = cell.state != PumpState::Stopped;
        self.set_state(&mut cell, PumpState::Stopped);
        self.cond.notify_all();
        was_running
    }

    /// Owner: ask the worker to pause and block until it has.
    ///
    /// `interrupt` must knock the worker out of any blocking call. Returns
    /// `true` once the worker is parked, `false` if the pump is stopped.
    pub fn pause(&self, interrupt: &dyn Fn()) -> bool {
        let mut cell = self.cell.lock();
        match cell.state {
            PumpState::Stopped => {
                warn!("pause called while not running");
                return false;
            }
            PumpState::Paused => return true,
            PumpState::Running | PumpState::PauseRequested => {}
        }

        self.set_state(&mut cell, PumpState::PauseRequested);
        interrupt();
        self.cond.notify_all();

        while cell.worker_active && cell.state == PumpState::PauseRequested {
            debug!("waiting for pause");
            if self
                .cond
                .wait_for(&mut cell, PAUSE_REINTERRUPT_INTERVAL)
                .timed_out()
            {
                interrupt();
            }
        }
        cell.state == PumpState::Paused
    }

    /// Owner: release a paused worker. A no-op unless paused.
    pub fn resume(&self) -> bool {
        let mut cell = self.cell.lock();
        if cell.state != PumpState::Paused {
            warn!(state = ?cell.state, "resume called while not paused");
            return false;
        }
        self.set_state(&mut cell, PumpState::Running);
        self.cond.notify_all();
        true
    }

    /// Worker: report that the copy loop exited and wait out a pause.
    ///
    /// Returns `true` if the worker was resumed and must run its loop again,
    /// `false` if it must exit. A loop that ended on its own (fatal error)
    /// leaves the pump Stopped.
    pub fn park(&self) -> bool {
        let mut cell = self.cell.lock();
        cell.worker_active = false;
        match cell.state {
            PumpState::PauseRequested => self.set_state(&mut cell, PumpState::Paused),
            PumpState::Running => self.set_state(&mut cell, PumpState::Stopped),
            PumpState::Paused | PumpState::Stopped => {}
        }
        self.cond.notify_all();

        while cell.state == PumpState::Paused {
            debug!("paused");
            self.cond.wait(&mut cell);
        }

        if cell.state == PumpState::Running {
            cell.worker_active = true;
            true
        } else {
            false
        }
    }

    /// Worker: sleep for `duration`, returning early (with `false`) when a
    /// stop or pause is requested.
    pub fn nap(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cell = self.cell.lock();
        while cell.state == PumpState::Running {
            if self.cond.wait_until(&mut cell, deadline).timed_out() {
                break;
            }
        }
        cell.state == PumpState::Running
    }
}
