//! Dedicated thread for a compatibility runtime
//!
//! A runtime DLL loaded into a foreign process keeps its thread-local block
//! in the top `PADDING_SIZE` bytes of the initializing thread's stack. The
//! runtime thread reserves that region with a block in its first frame,
//! initializes the DLL below it and then runs every later runtime call on the
//! same thread, so the block is never reused by live frames.
//!
//! ```text
//! stack base ──► ┌──────────────────────┐
//!                │ thread start frames  │  delta bytes, saved and restored
//!    block end ► ├──────────────────────┤
//!                │ reserved block       │  2 * PADDING_SIZE
//!                ├──────────────────────┤
//!                │ setup / job frames   │
//!                └──────────────────────┘
//! ```

use std::hint::black_box;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread;

use tracing::{debug, warn};

use super::ResolveError;

/// Stack region the runtime may claim below the stack base
pub const PADDING_SIZE: usize = 32768;

const BLOCK_SIZE: usize = 2 * PADDING_SIZE;
const RUNTIME_STACK_SIZE: usize = 1024 * 1024;

type Job = Box<dyn FnOnce() + Send>;

/// Bytes between the stack base and the end of the reserved block, if the
/// block covers the runtime's region.
pub fn padding_delta(stack_base: usize, block_end: usize) -> Option<usize> {
    let delta = stack_base.checked_sub(block_end)?;
    (delta < PADDING_SIZE).then_some(delta)
}

#[cfg(windows)]
fn stack_base() -> Option<usize> {
    use windows::Win32::System::Threading::GetCurrentThreadStackLimits;

    let mut low = 0usize;
    let mut high = 0usize;
    unsafe { GetCurrentThreadStackLimits(&mut low, &mut high) };
    (high != 0).then_some(high)
}

#[cfg(not(windows))]
fn stack_base() -> Option<usize> {
    None
}

/// Everything the thread needs, kept on the heap so the entry frame holds
/// only the block and one pointer.
struct Start<T> {
    setup: Box<dyn FnOnce() -> Result<T, ResolveError> + Send>,
    ready: mpsc::SyncSender<Result<T, ResolveError>>,
    jobs: Receiver<Job>,
}

/// Handle to the runtime thread. Dropping it lets the thread finish.
pub struct RuntimeThread {
    jobs: Mutex<Sender<Job>>,
}

impl RuntimeThread {
    /// Start the thread and run `setup` below the reserved block.
    ///
    /// Returns once `setup` has finished. On error the thread exits without
    /// serving jobs.
    pub fn spawn<T, F>(name: &str, setup: F) -> Result<(Self, T), ResolveError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ResolveError> + Send + 'static,
    {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let start = Box::new(Start {
            setup: Box::new(setup),
            ready: ready_tx,
            jobs: job_rx,
        });

        thread::Builder::new()
            .name(name.to_string())
            .stack_size(RUNTIME_STACK_SIZE)
            .spawn(move || entry(start))
            .map_err(|e| ResolveError::RuntimeThread(e.to_string()))?;

        let value = ready_rx.recv().map_err(|_| {
            ResolveError::RuntimeThread("runtime thread exited during setup".to_string())
        })??;
        Ok((
            Self {
                jobs: Mutex::new(job_tx),
            },
            value,
        ))
    }

    /// Run `job` on the runtime thread and wait for its result.
    ///
    /// `None` if the thread is gone.
    pub fn call<R, F>(&self, job: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let sent = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(Box::new(move || {
                let _ = tx.send(job());
            }));
        if sent.is_err() {
            warn!("Runtime thread is gone");
            return None;
        }
        rx.recv().ok()
    }
}

#[inline(never)]
fn entry<T>(start: Box<Start<T>>) {
    let mut block = [0u8; BLOCK_SIZE];
    let block_end = black_box(&mut block).as_ptr() as usize + BLOCK_SIZE;
    below_block(start, block_end);
    black_box(&mut block);
}

#[inline(never)]
fn below_block<T>(start: Box<Start<T>>, block_end: usize) {
    let Start { setup, ready, jobs } = *start;

    let result = match stack_base() {
        Some(base) => match padding_delta(base, block_end) {
            Some(delta) => {
                debug!("Runtime block ends {} bytes below the stack base", delta);
                // The runtime zeroes its region on init, which can reach
                // into the thread start frames above the block
                let saved =
                    unsafe { std::slice::from_raw_parts(block_end as *const u8, delta) }.to_vec();
                let result = setup();
                unsafe {
                    std::ptr::copy_nonoverlapping(saved.as_ptr(), block_end as *mut u8, delta)
                };
                result
            }
            None => Err(ResolveError::RuntimeThread(format!(
                "reserved block ends {} bytes below the stack base",
                base.saturating_sub(block_end)
            ))),
        },
        None => setup(),
    };

    let ok = result.is_ok();
    if ready.send(result).is_err() || !ok {
        return;
    }
    for job in jobs {
        job();
    }
    debug!("Runtime thread finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_delta() {
        let base = 0x10_0000;
        assert_eq!(padding_delta(base, base), Some(0));
        assert_eq!(padding_delta(base, base - 1200), Some(1200));
        assert_eq!(padding_delta(base, base - PADDING_SIZE + 1), Some(PADDING_SIZE - 1));
        // Block too deep to cover the runtime's region
        assert_eq!(padding_delta(base, base - PADDING_SIZE), None);
        // Block above the stack base
        assert_eq!(padding_delta(base, base + 16), None);
    }

    #[test]
    fn test_setup_and_calls_share_one_thread() {
        let (runtime, setup_thread) =
            RuntimeThread::spawn("runtime-test", || Ok(thread::current().id())).unwrap();

        let first = runtime.call(|| thread::current().id()).unwrap();
        let second = runtime.call(|| thread::current().id()).unwrap();
        assert_eq!(first, setup_thread);
        assert_eq!(second, setup_thread);
        assert_ne!(first, thread::current().id());
        assert_eq!(runtime.call(|| 6 * 7), Some(42));
    }

    #[test]
    fn test_setup_failure_is_returned() {
        let err = RuntimeThread::spawn::<(), _>("runtime-test", || Err(ResolveError::IdentityQuery))
            .err()
            .unwrap();
        assert_eq!(err, ResolveError::IdentityQuery);
    }

    #[test]
    fn test_setup_panic_is_an_error() {
        let err = RuntimeThread::spawn::<(), _>("runtime-test", || panic!("init crashed"))
            .err()
            .unwrap();
        assert!(matches!(err, ResolveError::RuntimeThread(_)));
    }
}
