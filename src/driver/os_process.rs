//! Windows process handle with a one-shot exit wait

use std::ffi::c_void;
use std::io;
use std::sync::{Mutex, PoisonError};

use windows::Win32::Foundation::{CloseHandle, BOOLEAN, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, RegisterWaitForSingleObject, UnregisterWaitEx, INFINITE,
    WT_EXECUTEDEFAULT, WT_EXECUTEONLYONCE,
};

use super::backend::ChildProcess;

type ExitCallback = Mutex<Option<Box<dyn FnOnce() + Send>>>;

/// Owned process handle, closed on drop
pub struct OsProcess {
    handle: HANDLE,
}

// Safety: a process handle may be used and closed from any thread
unsafe impl Send for OsProcess {}

impl OsProcess {
    /// Take ownership of `handle`
    ///
    /// # Safety
    ///
    /// `handle` must be a valid process handle not owned elsewhere.
    pub unsafe fn from_raw(handle: HANDLE) -> Self {
        Self { handle }
    }
}

impl Drop for OsProcess {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

/// A registered exit wait. Dropping it blocks until a running callback has
/// returned, then frees the callback.
pub struct ExitWait {
    wait: HANDLE,
    context: *mut ExitCallback,
}

// Safety: wait handles may be unregistered from any thread
unsafe impl Send for ExitWait {}

impl Drop for ExitWait {
    fn drop(&mut self) {
        unsafe {
            let _ = UnregisterWaitEx(self.wait, INVALID_HANDLE_VALUE);
            drop(Box::from_raw(self.context));
        }
    }
}

unsafe extern "system" fn on_signaled(context: *mut c_void, _timed_out: BOOLEAN) {
    let callback = &*(context as *const ExitCallback);
    let on_exit = callback.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(on_exit) = on_exit {
        on_exit();
    }
}

impl ChildProcess for OsProcess {
    type Wait = ExitWait;

    fn register_exit_wait(&self, on_exit: Box<dyn FnOnce() + Send>) -> io::Result<ExitWait> {
        let context: *mut ExitCallback = Box::into_raw(Box::new(Mutex::new(Some(on_exit))));
        let mut wait = HANDLE::default();
        let registered = unsafe {
            RegisterWaitForSingleObject(
                &mut wait,
                self.handle,
                Some(on_signaled),
                Some(context as *const c_void),
                INFINITE,
                WT_EXECUTEDEFAULT | WT_EXECUTEONLYONCE,
            )
        };
        if let Err(e) = registered {
            unsafe { drop(Box::from_raw(context)) };
            return Err(io::Error::from(e));
        }
        Ok(ExitWait { wait, context })
    }

    fn exit_code(&self) -> io::Result<u32> {
        let mut code: u32 = 0;
        unsafe { GetExitCodeProcess(self.handle, &mut code) }.map_err(io::Error::from)?;
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use windows::Win32::System::Threading::{
        GetCurrentProcessId, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SYNCHRONIZE,
    };

    #[test]
    fn test_running_process_does_not_signal() {
        let handle = unsafe {
            OpenProcess(
                PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_SYNCHRONIZE,
                false,
                GetCurrentProcessId(),
            )
        }
        .unwrap();
        let process = unsafe { OsProcess::from_raw(handle) };

        // STILL_ACTIVE
        assert_eq!(process.exit_code().unwrap(), 259);

        let (tx, rx) = mpsc::channel();
        let wait = process
            .register_exit_wait(Box::new(move || {
                let _ = tx.send(());
            }))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(wait);
    }
}
