//! Event loop contract
//!
//! The process driver only needs three things from its host's loop: narrow
//! I/O dispatch while it waits for pipe connects, timers that can be armed
//! from a foreign thread, and streams that connect to a named pipe and report
//! whether they still have data to give.

pub mod threaded;

#[cfg(windows)]
pub mod pipe;

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub use threaded::{LoopHandle, ThreadedLoop};

#[cfg(windows)]
pub use pipe::NamedPipeStream;

/// The host's single-threaded loop
pub trait EventLoop {
    /// Dispatch pending I/O completions only, blocking until at least one
    /// has been handled. Timers do not run.
    fn run_io_once(&mut self);

    /// Create a stopped timer owned by this loop
    fn new_timer(&mut self, callback: Box<dyn FnMut() + Send>) -> Arc<dyn LoopTimer>;
}

/// A loop timer. `start` and `stop` may be called from any thread; the
/// callback always runs on the loop.
pub trait LoopTimer: Send + Sync {
    /// Fire after `delay`, then every `repeat` (zero means once)
    fn start(&self, delay: Duration, repeat: Duration);

    fn stop(&self);

    /// Stop for good and detach from the loop; later starts are ignored
    fn close(&self);
}

/// A loop-owned stream that is connected to a named pipe after creation
pub trait PipeStream: Send + Sync {
    /// Begin connecting to `name`; `request` completes on the loop
    fn connect(&self, name: &str, request: ConnectRequest);

    /// Whether a read may still produce data
    fn is_readable(&self) -> bool;
}

enum ConnectState {
    Pending,
    Done(io::Result<()>),
    Taken,
}

/// Completion slot of one pending connect, shared with the stream
#[derive(Clone)]
pub struct ConnectRequest {
    state: Arc<Mutex<ConnectState>>,
}

impl Default for ConnectRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectRequest {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectState::Pending)),
        }
    }

    /// Record the outcome; only the first completion counts
    pub fn complete(&self, result: io::Result<()>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, ConnectState::Pending) {
            *state = ConnectState::Done(result);
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            ConnectState::Pending
        )
    }

    /// The outcome, once. `None` while pending or after it was taken.
    pub fn take_result(&self) -> Option<io::Result<()>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *state, ConnectState::Taken) {
            ConnectState::Done(result) => Some(result),
            ConnectState::Pending => {
                *state = ConnectState::Pending;
                None
            }
            ConnectState::Taken => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_completes_once() {
        let request = ConnectRequest::new();
        assert!(!request.is_done());
        assert!(request.take_result().is_none());
        assert!(!request.is_done());

        request.clone().complete(Ok(()));
        request.complete(Err(io::Error::new(io::ErrorKind::Other, "late")));

        assert!(request.is_done());
        assert!(matches!(request.take_result(), Some(Ok(()))));
        assert!(request.take_result().is_none());
        assert!(request.is_done());
    }
}
