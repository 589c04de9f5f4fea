//! Runtime-loaded DLLs
//!
//! Owned module handle with typed symbol lookup, shared by the Cygwin/MSYS
//! loader and the winpty backend.

use std::ffi::{c_void, CString};
use std::mem;

use windows::core::{PCSTR, PCWSTR};
use windows::Win32::Foundation::{FreeLibrary, HMODULE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};

/// A loaded DLL, unloaded on drop
pub struct Library {
    handle: HMODULE,
    name: String,
}

// Safety: module handles and the symbols resolved from them are process-global
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    /// Load a DLL by file name through the standard search order
    pub fn load(name: &str) -> windows::core::Result<Self> {
        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
        let handle = unsafe { LoadLibraryW(PCWSTR(wide.as_ptr()))? };
        Ok(Self {
            handle,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a function export and reinterpret it as `F`.
    ///
    /// # Safety
    ///
    /// `F` must be an `extern` function pointer type matching the export's
    /// real signature and calling convention.
    pub unsafe fn function<F: Copy>(&self, symbol: &str) -> Option<F> {
        assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
        let proc = self.lookup(symbol)?;
        Some(mem::transmute_copy(&proc))
    }

    /// Address of a data export
    pub fn data(&self, symbol: &str) -> Option<*mut c_void> {
        self.lookup(symbol).map(|proc| proc as *mut c_void)
    }

    fn lookup(&self, symbol: &str) -> Option<unsafe extern "system" fn() -> isize> {
        let symbol = CString::new(symbol).ok()?;
        unsafe { GetProcAddress(self.handle, PCSTR(symbol.as_ptr().cast())) }
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        unsafe {
            let _ = FreeLibrary(self.handle);
        }
    }
}
