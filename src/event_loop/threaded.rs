//! Thread/channel event loop
//!
//! Worker threads post completions to the loop through a `LoopHandle`; the
//! loop thread runs them, together with due timers, in `run_once`.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::trace;

use super::{EventLoop, LoopTimer};

enum Message {
    /// Completion to run on the loop thread
    Io(Box<dyn FnOnce() + Send>),
    /// Re-evaluate timers and return to the caller
    Wake,
}

/// Cloneable, thread-safe sender into a `ThreadedLoop`
#[derive(Clone)]
pub struct LoopHandle {
    tx: Arc<Mutex<Sender<Message>>>,
}

impl LoopHandle {
    /// Queue `job` to run on the loop thread. Returns false if the loop is gone.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.send(Message::Io(Box::new(job)))
    }

    /// Make a blocked `run_once` return early
    pub fn wake(&self) -> bool {
        self.send(Message::Wake)
    }

    fn send(&self, message: Message) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(message)
            .is_ok()
    }
}

struct Schedule {
    deadline: Option<Instant>,
    repeat: Duration,
    closed: bool,
}

struct Timer {
    schedule: Mutex<Schedule>,
    callback: Mutex<Box<dyn FnMut() + Send>>,
    handle: LoopHandle,
}

impl Timer {
    fn schedule(&self) -> std::sync::MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.schedule().closed
    }

    fn deadline(&self) -> Option<Instant> {
        self.schedule().deadline
    }

    /// Consume the deadline if it has passed, rescheduling repeating timers
    fn take_due(&self, now: Instant) -> bool {
        let mut schedule = self.schedule();
        match schedule.deadline {
            Some(deadline) if deadline <= now && !schedule.closed => {
                schedule.deadline = if schedule.repeat.is_zero() {
                    None
                } else {
                    Some(now + schedule.repeat)
                };
                true
            }
            _ => false,
        }
    }

    fn fire(&self) {
        let mut callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        (*callback)();
    }
}

impl LoopTimer for Timer {
    fn start(&self, delay: Duration, repeat: Duration) {
        {
            let mut schedule = self.schedule();
            if schedule.closed {
                return;
            }
            schedule.deadline = Some(Instant::now() + delay);
            schedule.repeat = repeat;
        }
        self.handle.wake();
    }

    fn stop(&self) {
        self.schedule().deadline = None;
    }

    fn close(&self) {
        let mut schedule = self.schedule();
        schedule.deadline = None;
        schedule.closed = true;
    }
}

/// Event loop driven by the thread that calls `run_once`
pub struct ThreadedLoop {
    rx: Receiver<Message>,
    handle: LoopHandle,
    timers: Vec<Weak<Timer>>,
}

impl Default for ThreadedLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadedLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            rx,
            handle: LoopHandle {
                tx: Arc::new(Mutex::new(tx)),
            },
            timers: Vec::new(),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Run due timers, then wait up to `timeout` for one message and run it.
    ///
    /// The wait is cut short by the next timer deadline, so a timer armed
    /// before the call fires on time.
    pub fn run_once(&mut self, timeout: Duration) {
        self.run_due_timers();

        let now = Instant::now();
        let wait = match self.next_deadline() {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(now)),
            None => timeout,
        };

        match self.rx.recv_timeout(wait) {
            Ok(Message::Io(job)) => job(),
            Ok(Message::Wake) => trace!("Loop woken"),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }

        self.run_due_timers();
    }

    /// Number of timers that are still attached
    pub fn timer_count(&self) -> usize {
        self.timers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|timer| !timer.is_closed())
            .count()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .iter()
            .filter_map(Weak::upgrade)
            .filter_map(|timer| timer.deadline())
            .min()
    }

    fn run_due_timers(&mut self) {
        self.timers
            .retain(|timer| timer.upgrade().map_or(false, |timer| !timer.is_closed()));

        let now = Instant::now();
        let due: Vec<Arc<Timer>> = self
            .timers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|timer| timer.take_due(now))
            .collect();

        for timer in due {
            timer.fire();
        }
    }
}

impl EventLoop for ThreadedLoop {
    fn run_io_once(&mut self) {
        loop {
            match self.rx.recv() {
                Ok(Message::Io(job)) => {
                    job();
                    return;
                }
                Ok(Message::Wake) => continue,
                Err(_) => return,
            }
        }
    }

    fn new_timer(&mut self, callback: Box<dyn FnMut() + Send>) -> Arc<dyn LoopTimer> {
        let timer = Arc::new(Timer {
            schedule: Mutex::new(Schedule {
                deadline: None,
                repeat: Duration::ZERO,
                closed: false,
            }),
            callback: Mutex::new(callback),
            handle: self.handle(),
        });
        self.timers.push(Arc::downgrade(&timer));
        timer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counting_timer(event_loop: &mut ThreadedLoop) -> (Arc<dyn LoopTimer>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = event_loop.new_timer(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        (timer, fired)
    }

    #[test]
    fn test_posted_job_runs_on_loop() {
        let mut event_loop = ThreadedLoop::new();
        let handle = event_loop.handle();
        let ran = Arc::new(AtomicUsize::new(0));

        let flag = ran.clone();
        thread::spawn(move || {
            handle.post(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            });
        })
        .join()
        .unwrap();

        event_loop.run_io_once();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_io_dispatch_does_not_run_timers() {
        let mut event_loop = ThreadedLoop::new();
        let (timer, fired) = counting_timer(&mut event_loop);
        timer.start(Duration::ZERO, Duration::ZERO);

        event_loop.handle().post(|| {});
        event_loop.run_io_once();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        event_loop.run_once(Duration::ZERO);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_repeating_timer_armed_from_another_thread() {
        let mut event_loop = ThreadedLoop::new();
        let (timer, fired) = counting_timer(&mut event_loop);

        let remote = timer.clone();
        thread::spawn(move || remote.start(Duration::from_millis(1), Duration::from_millis(1)))
            .join()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while fired.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            event_loop.run_once(Duration::from_millis(10));
        }
        assert!(fired.load(Ordering::SeqCst) >= 3);

        timer.stop();
        let count = fired.load(Ordering::SeqCst);
        event_loop.run_once(Duration::from_millis(5));
        assert_eq!(fired.load(Ordering::SeqCst), count);
    }

    #[test]
    fn test_closed_timer_is_detached() {
        let mut event_loop = ThreadedLoop::new();
        let (timer, fired) = counting_timer(&mut event_loop);
        assert_eq!(event_loop.timer_count(), 1);

        timer.close();
        timer.start(Duration::ZERO, Duration::ZERO);
        event_loop.run_once(Duration::ZERO);

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(event_loop.timer_count(), 0);
    }

    #[test]
    fn test_timer_callback_may_stop_itself() {
        let mut event_loop = ThreadedLoop::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Arc<dyn LoopTimer>>>> = Arc::new(Mutex::new(None));

        let counter = fired.clone();
        let me = slot.clone();
        let timer = event_loop.new_timer(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(timer) = me.lock().unwrap().as_ref() {
                timer.stop();
            }
        }));
        *slot.lock().unwrap() = Some(timer.clone());

        timer.start(Duration::ZERO, Duration::from_millis(1));
        for _ in 0..5 {
            event_loop.run_once(Duration::from_millis(2));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
