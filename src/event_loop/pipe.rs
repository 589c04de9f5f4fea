//! Named pipe stream for the threaded loop
//!
//! The pipe is opened on a worker thread and handed to the loop as an I/O
//! completion. A reader stream then pumps data on its own thread into a
//! buffer the host drains with `try_read`.

use std::ffi::c_void;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_ATTRIBUTE_NORMAL, FILE_GENERIC_READ,
    FILE_GENERIC_WRITE, FILE_SHARE_NONE, OPEN_EXISTING,
};
use windows::Win32::System::IO::CancelIoEx;

use super::{ConnectRequest, LoopHandle, PipeStream};

const READ_BUFFER_SIZE: usize = 4096;
const CANCEL_RETRY: Duration = Duration::from_millis(5);

/// `HANDLE` as an integer so it can cross threads
#[derive(Clone, Copy)]
struct RawHandle(usize);

impl RawHandle {
    fn get(self) -> HANDLE {
        HANDLE(self.0 as *mut c_void)
    }

    fn close(self) {
        unsafe {
            let _ = CloseHandle(self.get());
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

struct Shared {
    pipe: Mutex<Option<RawHandle>>,
    buffer: Mutex<Vec<u8>>,
    eof: AtomicBool,
    closing: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// One direction of a named pipe
pub struct NamedPipeStream {
    shared: Arc<Shared>,
    direction: Direction,
    event_loop: LoopHandle,
}

impl NamedPipeStream {
    /// Stream that reads from the pipe it connects to
    pub fn reader(event_loop: LoopHandle) -> Self {
        Self::new(event_loop, Direction::Read)
    }

    /// Stream that writes to the pipe it connects to
    pub fn writer(event_loop: LoopHandle) -> Self {
        Self::new(event_loop, Direction::Write)
    }

    fn new(event_loop: LoopHandle, direction: Direction) -> Self {
        Self {
            shared: Arc::new(Shared {
                pipe: Mutex::new(None),
                buffer: Mutex::new(Vec::new()),
                eof: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                reader: Mutex::new(None),
            }),
            direction,
            event_loop,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.pipe.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Take everything read so far
    pub fn try_read(&self) -> Vec<u8> {
        std::mem::take(&mut *self.shared.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        let pipe = self
            .shared
            .pipe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "pipe not connected"))?;

        while !data.is_empty() {
            let mut written: u32 = 0;
            unsafe {
                WriteFile(pipe.get(), Some(data), Some(&mut written as *mut u32), None)
                    .map_err(io::Error::from)?;
            }
            if written == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "pipe accepted no data"));
            }
            data = &data[written as usize..];
        }
        Ok(())
    }
}

fn open_pipe(name: &str, direction: Direction) -> io::Result<RawHandle> {
    let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
    let access = match direction {
        Direction::Read => FILE_GENERIC_READ,
        Direction::Write => FILE_GENERIC_WRITE,
    };
    let handle = unsafe {
        CreateFileW(
            PCWSTR(wide.as_ptr()),
            access.0,
            FILE_SHARE_NONE,
            None,
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            HANDLE::default(),
        )
    }
    .map_err(io::Error::from)?;
    Ok(RawHandle(handle.0 as usize))
}

fn pump(shared: Arc<Shared>, pipe: RawHandle, event_loop: LoopHandle) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        if shared.closing.load(Ordering::SeqCst) {
            break;
        }

        let mut read: u32 = 0;
        let result =
            unsafe { ReadFile(pipe.get(), Some(&mut buffer), Some(&mut read as *mut u32), None) };
        match result {
            Ok(()) if read > 0 => {
                shared
                    .buffer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&buffer[..read as usize]);
                event_loop.wake();
            }
            // Zero-byte read or broken pipe: the far end is gone
            Ok(()) | Err(_) => break,
        }
    }

    shared.eof.store(true, Ordering::SeqCst);
    event_loop.wake();
}

impl PipeStream for NamedPipeStream {
    fn connect(&self, name: &str, request: ConnectRequest) {
        let name = name.to_string();
        let direction = self.direction;
        let shared = self.shared.clone();
        let event_loop = self.event_loop.clone();

        thread::spawn(move || {
            let pipe = match open_pipe(&name, direction) {
                Ok(pipe) => pipe,
                Err(e) => {
                    warn!("Failed to connect to {}: {}", name, e);
                    event_loop.post(move || request.complete(Err(e)));
                    return;
                }
            };
            debug!("Connected to {}", name);

            let pump_loop = event_loop.clone();
            let posted = event_loop.post(move || {
                *shared.pipe.lock().unwrap_or_else(PoisonError::into_inner) = Some(pipe);
                if direction == Direction::Read {
                    let pump_shared = shared.clone();
                    let reader = thread::spawn(move || pump(pump_shared, pipe, pump_loop));
                    *shared.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader);
                }
                request.complete(Ok(()));
            });
            if !posted {
                pipe.close();
            }
        });
    }

    fn is_readable(&self) -> bool {
        match self.direction {
            Direction::Read => {
                let drained = self
                    .shared
                    .buffer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_empty();
                !(self.shared.eof.load(Ordering::SeqCst) && drained)
            }
            Direction::Write => false,
        }
    }
}

/// Cancel until the reader has exited. A cancel issued just before the
/// reader enters `ReadFile` finds nothing to cancel, so one is not enough.
fn stop_reader(reader: JoinHandle<()>, mut cancel: impl FnMut()) {
    while !reader.is_finished() {
        cancel();
        thread::sleep(CANCEL_RETRY);
    }
    let _ = reader.join();
}

impl Drop for NamedPipeStream {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let pipe = self.shared.pipe.lock().unwrap_or_else(PoisonError::into_inner).take();
        let reader = self.shared.reader.lock().unwrap_or_else(PoisonError::into_inner).take();

        if let Some(reader) = reader {
            stop_reader(reader, || {
                if let Some(pipe) = pipe {
                    unsafe {
                        let _ = CancelIoEx(pipe.get(), None);
                    }
                }
            });
        }
        if let Some(pipe) = pipe {
            pipe.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{EventLoop, ThreadedLoop};

    #[test]
    fn test_connect_to_missing_pipe_fails() {
        let mut event_loop = ThreadedLoop::new();
        let stream = NamedPipeStream::reader(event_loop.handle());
        let request = ConnectRequest::new();

        stream.connect(r"\\.\pipe\ptybridge-test-no-such-pipe", request.clone());
        while !request.is_done() {
            event_loop.run_io_once();
        }

        assert!(matches!(request.take_result(), Some(Err(_))));
        assert!(!stream.is_connected());
        assert!(stream.write_all(b"x").is_err());
    }

    #[test]
    fn test_reader_stopped_after_missed_cancels() {
        use std::sync::atomic::AtomicUsize;

        // Reader that only notices the third cancel, like one that entered
        // ReadFile after the first cancels were issued
        let cancels = Arc::new(AtomicUsize::new(0));
        let seen = cancels.clone();
        let reader = thread::spawn(move || {
            while seen.load(Ordering::SeqCst) < 3 {
                thread::sleep(Duration::from_millis(1));
            }
        });

        stop_reader(reader, || {
            cancels.fetch_add(1, Ordering::SeqCst);
        });
        assert!(cancels.load(Ordering::SeqCst) >= 3);
    }
}
