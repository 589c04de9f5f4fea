//! Child termination tracking
//!
//! The OS reports process exit before the pty pipe has necessarily been
//! drained. The wait callback therefore only arms a polling timer, and the
//! exit is delivered on the loop once the output stream stops being
//! readable.
//!
//! ```text
//! Running --arm--> WaitRegistered --OS callback--> EofPending --drained--> Finished
//! ```

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use super::backend::ChildProcess;
use super::ProcessObserver;
use crate::event_loop::{EventLoop, LoopTimer, PipeStream};

/// Exit code reported when the OS cannot provide one
pub const UNKNOWN_EXIT_STATUS: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPhase {
    /// Spawned, no exit wait yet
    Running,
    /// OS wait armed against the process handle
    WaitRegistered,
    /// Process gone, waiting for the output to drain
    EofPending,
    /// Exit delivered, or the session was torn down
    Finished,
}

struct Inner<P: ChildProcess> {
    phase: ExitPhase,
    process: Option<P>,
    wait: Option<P::Wait>,
}

pub(crate) struct ExitTracker<P: ChildProcess> {
    inner: Mutex<Inner<P>>,
    timer: Arc<dyn LoopTimer>,
    output: Arc<dyn PipeStream>,
    observer: Arc<dyn ProcessObserver>,
    poll: Duration,
}

impl<P: ChildProcess> ExitTracker<P> {
    pub(crate) fn new(
        event_loop: &mut dyn EventLoop,
        process: P,
        output: Arc<dyn PipeStream>,
        observer: Arc<dyn ProcessObserver>,
        poll: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let timer = event_loop.new_timer(Box::new(move || {
                if let Some(tracker) = weak.upgrade() {
                    tracker.tick();
                }
            }));
            Self {
                inner: Mutex::new(Inner {
                    phase: ExitPhase::Running,
                    process: Some(process),
                    wait: None,
                }),
                timer,
                output,
                observer,
                poll,
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn phase(&self) -> ExitPhase {
        self.lock().phase
    }

    /// Register the OS exit wait on the process handle.
    ///
    /// The lock is held across registration, so a callback that fires at
    /// once blocks until the phase has moved to `WaitRegistered`.
    pub(crate) fn arm(self: &Arc<Self>) -> io::Result<()> {
        let weak = Arc::downgrade(self);
        let mut inner = self.lock();
        let Some(process) = inner.process.as_ref() else {
            return Ok(());
        };

        let wait = process.register_exit_wait(Box::new(move || {
            if let Some(tracker) = weak.upgrade() {
                tracker.on_process_exit();
            }
        }))?;
        inner.wait = Some(wait);
        if inner.phase == ExitPhase::Running {
            inner.phase = ExitPhase::WaitRegistered;
        }
        Ok(())
    }

    /// Runs on the OS wait thread: arm the poll timer and nothing else
    fn on_process_exit(&self) {
        {
            let mut inner = self.lock();
            match inner.phase {
                ExitPhase::Running | ExitPhase::WaitRegistered => {
                    inner.phase = ExitPhase::EofPending
                }
                ExitPhase::EofPending | ExitPhase::Finished => return,
            }
        }
        debug!("Child process exited, waiting for output to drain");
        self.timer.start(self.poll, self.poll);
    }

    /// Poll timer callback, on the loop
    fn tick(&self) {
        if self.phase() != ExitPhase::EofPending || self.output.is_readable() {
            return;
        }

        let (wait, process) = {
            let mut inner = self.lock();
            if inner.phase != ExitPhase::EofPending {
                return;
            }
            inner.phase = ExitPhase::Finished;
            (inner.wait.take(), inner.process.take())
        };

        self.timer.stop();
        self.timer.close();
        drop(wait);

        let status = match &process {
            Some(process) => match process.exit_code() {
                Ok(code) => code as i32,
                Err(e) => {
                    warn!("Failed to get exit code: {}", e);
                    UNKNOWN_EXIT_STATUS
                }
            },
            None => UNKNOWN_EXIT_STATUS,
        };
        drop(process);

        debug!("Child process finished with status {}", status);
        self.observer.on_exit(status);
    }

    /// Release the wait, the timer and the process handle without reporting
    /// an exit. Must not be called from the wait callback.
    pub(crate) fn shutdown(&self) {
        let (wait, process) = {
            let mut inner = self.lock();
            inner.phase = ExitPhase::Finished;
            (inner.wait.take(), inner.process.take())
        };
        self.timer.stop();
        self.timer.close();
        drop(wait);
        drop(process);
    }
}
