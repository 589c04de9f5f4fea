//! winpty backend
//!
//! `winpty.dll` is loaded at runtime so the binary starts without it and can
//! report a missing DLL as an ordinary error.

use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::Arc;

use tracing::debug;
use windows::Win32::Foundation::HANDLE;

use super::backend::{AgentFlags, BackendError, PtyBackend, SpawnFlags};
use super::os_process::OsProcess;
use crate::dylib::Library;

/// Error code used when the DLL itself is unusable
const UNSPECIFIED: u32 = 5;

type ErrorPtr = *mut c_void;

type ConfigNewFn = unsafe extern "C" fn(u64, *mut ErrorPtr) -> *mut c_void;
type ConfigFreeFn = unsafe extern "C" fn(*mut c_void);
type ConfigSetInitialSizeFn = unsafe extern "C" fn(*mut c_void, c_int, c_int);
type OpenFn = unsafe extern "C" fn(*const c_void, *mut ErrorPtr) -> *mut c_void;
type PipeNameFn = unsafe extern "C" fn(*mut c_void) -> *const u16;
type SpawnConfigNewFn = unsafe extern "C" fn(
    u64,
    *const u16,
    *const u16,
    *const u16,
    *const u16,
    *mut ErrorPtr,
) -> *mut c_void;
type SpawnConfigFreeFn = unsafe extern "C" fn(*mut c_void);
type SpawnFn = unsafe extern "C" fn(
    *mut c_void,
    *const c_void,
    *mut HANDLE,
    *mut HANDLE,
    *mut u32,
    *mut ErrorPtr,
) -> i32;
type SetSizeFn = unsafe extern "C" fn(*mut c_void, c_int, c_int, *mut ErrorPtr) -> i32;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type ErrorCodeFn = unsafe extern "C" fn(ErrorPtr) -> u32;
type ErrorMsgFn = unsafe extern "C" fn(ErrorPtr) -> *const u16;
type ErrorFreeFn = unsafe extern "C" fn(ErrorPtr);

struct Api {
    config_new: ConfigNewFn,
    config_free: ConfigFreeFn,
    config_set_initial_size: ConfigSetInitialSizeFn,
    open: OpenFn,
    conin_name: PipeNameFn,
    conout_name: PipeNameFn,
    spawn_config_new: SpawnConfigNewFn,
    spawn_config_free: SpawnConfigFreeFn,
    spawn: SpawnFn,
    set_size: SetSizeFn,
    free: FreeFn,
    error_code: ErrorCodeFn,
    error_msg: ErrorMsgFn,
    error_free: ErrorFreeFn,
    _library: Library,
}

impl Api {
    fn load(path: &str) -> Result<Self, BackendError> {
        let library = Library::load(path).map_err(|e| {
            BackendError::new(UNSPECIFIED, format!("Failed to load {}: {}", path, e))
        })?;

        macro_rules! symbol {
            ($name:literal) => {
                unsafe { library.function($name) }.ok_or_else(|| {
                    BackendError::new(UNSPECIFIED, format!("{} does not export {}", path, $name))
                })?
            };
        }

        Ok(Self {
            config_new: symbol!("winpty_config_new"),
            config_free: symbol!("winpty_config_free"),
            config_set_initial_size: symbol!("winpty_config_set_initial_size"),
            open: symbol!("winpty_open"),
            conin_name: symbol!("winpty_conin_name"),
            conout_name: symbol!("winpty_conout_name"),
            spawn_config_new: symbol!("winpty_spawn_config_new"),
            spawn_config_free: symbol!("winpty_spawn_config_free"),
            spawn: symbol!("winpty_spawn"),
            set_size: symbol!("winpty_set_size"),
            free: symbol!("winpty_free"),
            error_code: symbol!("winpty_error_code"),
            error_msg: symbol!("winpty_error_msg"),
            error_free: symbol!("winpty_error_free"),
            _library: library,
        })
    }

    /// Convert and free a winpty error object
    fn take_error(&self, err: ErrorPtr, context: &str) -> BackendError {
        if err.is_null() {
            return BackendError::new(UNSPECIFIED, context);
        }
        let code = unsafe { (self.error_code)(err) };
        let message = unsafe { wide_cstr((self.error_msg)(err)) }
            .map(|wide| String::from_utf16_lossy(&wide))
            .unwrap_or_else(|| context.to_string());
        unsafe { (self.error_free)(err) };
        BackendError::new(code, message)
    }
}

/// Copy a NUL-terminated UTF-16 string
unsafe fn wide_cstr(ptr: *const u16) -> Option<Vec<u16>> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    Some(std::slice::from_raw_parts(ptr, len).to_vec())
}

fn opt_ptr(wide: Option<&[u16]>) -> *const u16 {
    wide.map_or(ptr::null(), <[u16]>::as_ptr)
}

/// Agent configuration
pub struct Config {
    raw: *mut c_void,
    api: Arc<Api>,
}

impl Drop for Config {
    fn drop(&mut self) {
        unsafe { (self.api.config_free)(self.raw) };
    }
}

/// Spawn configuration
pub struct SpawnConfig {
    raw: *mut c_void,
    api: Arc<Api>,
}

impl Drop for SpawnConfig {
    fn drop(&mut self) {
        unsafe { (self.api.spawn_config_free)(self.raw) };
    }
}

/// A running winpty agent; freeing it shuts the agent down
pub struct Agent {
    raw: *mut c_void,
    api: Arc<Api>,
}

// Safety: winpty_t is used behind &self only for calls winpty serializes
unsafe impl Send for Agent {}

impl Drop for Agent {
    fn drop(&mut self) {
        unsafe { (self.api.free)(self.raw) };
    }
}

/// `winpty.dll`, resolved at runtime
pub struct WinptyBackend {
    api: Arc<Api>,
}

impl WinptyBackend {
    /// Load the DLL by name or path
    pub fn load(path: &str) -> Result<Self, BackendError> {
        let api = Api::load(path)?;
        debug!("Loaded {}", path);
        Ok(Self { api: Arc::new(api) })
    }

    fn pipe_name(
        &self,
        name: PipeNameFn,
        agent: &Agent,
        which: &str,
    ) -> Result<Vec<u16>, BackendError> {
        unsafe { wide_cstr(name(agent.raw)) }
            .ok_or_else(|| BackendError::new(UNSPECIFIED, format!("No {} pipe name", which)))
    }
}

// Safety: the function table is immutable after load
unsafe impl Send for Api {}
unsafe impl Sync for Api {}

impl PtyBackend for WinptyBackend {
    type Config = Config;
    type SpawnConfig = SpawnConfig;
    type Agent = Agent;
    type Process = OsProcess;

    fn new_config(&self, flags: AgentFlags) -> Result<Config, BackendError> {
        let mut err: ErrorPtr = ptr::null_mut();
        let raw = unsafe { (self.api.config_new)(flags.bits(), &mut err) };
        if raw.is_null() {
            return Err(self.api.take_error(err, "winpty_config_new failed"));
        }
        Ok(Config {
            raw,
            api: self.api.clone(),
        })
    }

    fn set_initial_size(&self, config: &mut Config, cols: i32, rows: i32) {
        unsafe { (self.api.config_set_initial_size)(config.raw, cols, rows) };
    }

    fn open(&self, config: &Config) -> Result<Agent, BackendError> {
        let mut err: ErrorPtr = ptr::null_mut();
        let raw = unsafe { (self.api.open)(config.raw, &mut err) };
        if raw.is_null() {
            return Err(self.api.take_error(err, "winpty_open failed"));
        }
        Ok(Agent {
            raw,
            api: self.api.clone(),
        })
    }

    fn conin_name(&self, agent: &Agent) -> Result<Vec<u16>, BackendError> {
        self.pipe_name(self.api.conin_name, agent, "conin")
    }

    fn conout_name(&self, agent: &Agent) -> Result<Vec<u16>, BackendError> {
        self.pipe_name(self.api.conout_name, agent, "conout")
    }

    fn new_spawn_config(
        &self,
        flags: SpawnFlags,
        cmdline: &[u16],
        cwd: Option<&[u16]>,
        env: Option<&[u16]>,
    ) -> Result<SpawnConfig, BackendError> {
        let mut err: ErrorPtr = ptr::null_mut();
        let raw = unsafe {
            (self.api.spawn_config_new)(
                flags.bits(),
                ptr::null(),
                cmdline.as_ptr(),
                opt_ptr(cwd),
                opt_ptr(env),
                &mut err,
            )
        };
        if raw.is_null() {
            return Err(self.api.take_error(err, "winpty_spawn_config_new failed"));
        }
        Ok(SpawnConfig {
            raw,
            api: self.api.clone(),
        })
    }

    fn spawn(&self, agent: &Agent, config: &SpawnConfig) -> Result<OsProcess, BackendError> {
        let mut err: ErrorPtr = ptr::null_mut();
        let mut process = HANDLE::default();
        let mut create_process_error: u32 = 0;
        let ok = unsafe {
            (self.api.spawn)(
                agent.raw,
                config.raw,
                &mut process,
                ptr::null_mut(),
                &mut create_process_error,
                &mut err,
            )
        };
        if ok == 0 {
            let mut error = self.api.take_error(err, "winpty_spawn failed");
            if create_process_error != 0 {
                error.message = format!(
                    "{} (CreateProcess error {})",
                    error.message, create_process_error
                );
            }
            return Err(error);
        }
        Ok(unsafe { OsProcess::from_raw(process) })
    }

    fn set_size(&self, agent: &Agent, cols: i32, rows: i32) -> Result<(), BackendError> {
        let mut err: ErrorPtr = ptr::null_mut();
        if unsafe { (self.api.set_size)(agent.raw, cols, rows, &mut err) } == 0 {
            return Err(self.api.take_error(err, "winpty_set_size failed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dll_is_backend_error() {
        let err = WinptyBackend::load("ptybridge-no-such-winpty.dll").err().unwrap();
        assert_eq!(err.code, UNSPECIFIED);
        assert!(err.message.contains("ptybridge-no-such-winpty.dll"));
    }

    #[test]
    fn test_wide_cstr() {
        let text = [0x61u16, 0x62, 0, 0x63];
        assert_eq!(unsafe { wide_cstr(text.as_ptr()) }, Some(vec![0x61, 0x62]));
        assert_eq!(unsafe { wide_cstr(ptr::null()) }, None);
    }
}
