//! Runtime per-process user data
//!
//! A process that loads the runtime dynamically has to record the API
//! version it was built against in the runtime's `per_process` export.
//! Without it the runtime treats the caller as a client of its oldest ABI
//! and uses the 16-bit `termios` layout.

use std::ffi::{c_char, c_int, c_void};
use std::mem;

use tracing::debug;

use super::module::ApiVersion;

/// Leading part of the runtime's `struct per_process` (x86_64 layout)
#[allow(dead_code)]
#[repr(C)]
pub struct PerProcess {
    initial_sp: *mut c_char,
    /// The runtime's own `sizeof(struct per_process)`
    pub magic_biscuit: u32,
    dll_major: u32,
    dll_minor: u32,
    impure_ptr_ptr: *mut c_void,
    main: *mut c_void,
    ctors: *mut c_void,
    dtors: *mut c_void,
    data_start: *mut c_void,
    data_end: *mut c_void,
    bss_start: *mut c_void,
    bss_end: *mut c_void,
    calloc: *mut c_void,
    free: *mut c_void,
    realloc: *mut c_void,
    fmode_ptr: *mut c_int,
    premain: [*mut c_void; 4],
    cxx_malloc: *mut c_void,
    hmodule: *mut c_void,
    pub api_major: u32,
    pub api_minor: u32,
}

/// Store `version` in the runtime's user data.
///
/// Returns the size the runtime reports when it is too small to hold the
/// API fields; nothing is written then.
///
/// # Safety
///
/// `user_data` must point to the runtime's writable `per_process` export.
pub unsafe fn write_api_version(
    user_data: *mut PerProcess,
    version: ApiVersion,
) -> Result<(), usize> {
    let size = (*user_data).magic_biscuit as usize;
    if size < mem::size_of::<PerProcess>() {
        return Err(size);
    }
    (*user_data).api_major = version.major;
    (*user_data).api_minor = version.minor;
    debug!("Published API version {}", version);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_data(size: usize) -> PerProcess {
        let mut data: PerProcess = unsafe { mem::zeroed() };
        data.magic_biscuit = size as u32;
        data
    }

    #[test]
    fn test_version_written_when_struct_is_large_enough() {
        let mut data = user_data(mem::size_of::<PerProcess>() + 64);
        let result = unsafe { write_api_version(&mut data, ApiVersion { major: 0, minor: 345 }) };
        assert_eq!(result, Ok(()));
        assert_eq!((data.api_major, data.api_minor), (0, 345));
    }

    #[test]
    fn test_small_struct_is_left_alone() {
        let size = mem::size_of::<PerProcess>() - 8;
        let mut data = user_data(size);
        let result = unsafe { write_api_version(&mut data, ApiVersion { major: 0, minor: 345 }) };
        assert_eq!(result, Err(size));
        assert_eq!((data.api_major, data.api_minor), (0, 0));
    }
}
