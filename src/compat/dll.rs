//! DLL-backed compatibility module
//!
//! Resolves the runtime's POSIX exports by name. Every descriptor and errno
//! value seen here lives in the runtime's tables, not the host CRT's.
//!
//! Every symbol is resolved before the runtime's initializer runs, and an
//! initialized runtime is never unloaded. All calls into the runtime happen
//! on its dedicated thread (see `runtime`).

use std::ffi::{c_char, c_int, CStr};
use std::mem;

use tracing::debug;

use super::module::{
    parse_api_version, ApiVersion, CompatModule, ModuleLoader, UTSNAME_FIELD_LEN,
};
use super::runtime::RuntimeThread;
use super::shim::{Errno, PosixShim};
use super::termios::{Termios, Winsize, TIOCGWINSZ};
use super::user_data::{write_api_version, PerProcess};
use super::{MinttyKind, ResolveError};
use crate::dylib::Library;

type InitFn = unsafe extern "C" fn();
type TcgetattrFn = unsafe extern "C" fn(c_int, *mut Termios) -> c_int;
type TcsetattrFn = unsafe extern "C" fn(c_int, c_int, *const Termios) -> c_int;
type CfmakerawFn = unsafe extern "C" fn(*mut Termios);
type IoctlFn = unsafe extern "C" fn(c_int, c_int, ...) -> c_int;
type OpenFn = unsafe extern "C" fn(*const c_char, c_int, ...) -> c_int;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
type ErrnoFn = unsafe extern "C" fn() -> *mut c_int;
type StrerrorFn = unsafe extern "C" fn(c_int) -> *const c_char;
type UnameFn = unsafe extern "C" fn(*mut c_char) -> c_int;

/// Loads `cygwin1.dll` / `msys-2.0.dll`
pub struct DllLoader;

impl ModuleLoader for DllLoader {
    fn load(&self, kind: MinttyKind) -> Result<CompatModule, ResolveError> {
        // The user data layout below is the x86_64 one
        if cfg!(not(target_pointer_width = "64")) {
            return Err(ResolveError::Unsupported);
        }
        let (Some(module), Some(init_symbol), Some(user_data_symbol)) =
            (kind.dll_name(), kind.init_symbol(), kind.user_data_symbol())
        else {
            return Err(ResolveError::Unsupported);
        };

        let (runtime, loaded) = RuntimeThread::spawn("compat-runtime", move || {
            bring_up(module, init_symbol, user_data_symbol)
        })?;
        let shim = DllShim {
            exports: loaded.exports,
            runtime,
        };
        Ok(CompatModule::new(kind, loaded.version, Box::new(shim)))
    }
}

struct Loaded {
    exports: Exports,
    version: ApiVersion,
}

/// Load, resolve and initialize the runtime. Runs on the runtime thread.
fn bring_up(
    module: &'static str,
    init_symbol: &'static str,
    user_data_symbol: &'static str,
) -> Result<Loaded, ResolveError> {
    let library = Library::load(module).map_err(|e| ResolveError::LoadFailed {
        module,
        code: e.code().0,
    })?;
    debug!("Loaded {}", library.name());

    // Dropping the library unloads it, which is only safe before init
    let init: InitFn = resolve(&library, module, init_symbol)?;
    let exports = Exports::resolve(&library, module)?;
    let user_data = library
        .data(user_data_symbol)
        .ok_or(ResolveError::MissingSymbol {
            module,
            symbol: user_data_symbol,
        })?
        .cast::<PerProcess>();

    unsafe { init() };
    // The runtime now runs threads of its own and must stay mapped
    mem::forget(library);

    let version = exports.api_version()?;
    unsafe { write_api_version(user_data, version) }
        .map_err(|size| ResolveError::UserDataTooSmall { module, size })?;
    Ok(Loaded { exports, version })
}

fn resolve<F: Copy>(
    library: &Library,
    module: &'static str,
    symbol: &'static str,
) -> Result<F, ResolveError> {
    unsafe { library.function::<F>(symbol) }.ok_or(ResolveError::MissingSymbol { module, symbol })
}

/// The runtime's POSIX exports. Only called on the runtime thread.
#[derive(Clone, Copy)]
struct Exports {
    tcgetattr: TcgetattrFn,
    tcsetattr: TcsetattrFn,
    cfmakeraw: Option<CfmakerawFn>,
    ioctl: IoctlFn,
    open: OpenFn,
    close: CloseFn,
    errno: ErrnoFn,
    strerror: StrerrorFn,
    uname: UnameFn,
}

impl Exports {
    fn resolve(library: &Library, module: &'static str) -> Result<Self, ResolveError> {
        Ok(Self {
            tcgetattr: resolve(library, module, "tcgetattr")?,
            tcsetattr: resolve(library, module, "tcsetattr")?,
            cfmakeraw: unsafe { library.function::<CfmakerawFn>("cfmakeraw") },
            ioctl: resolve(library, module, "ioctl")?,
            open: resolve(library, module, "open")?,
            close: resolve(library, module, "close")?,
            errno: resolve(library, module, "__errno")?,
            strerror: resolve(library, module, "strerror")?,
            uname: resolve(library, module, "uname")?,
        })
    }

    fn last_errno(&self) -> Errno {
        let location = unsafe { (self.errno)() };
        if location.is_null() {
            Errno::UNKNOWN
        } else {
            Errno(unsafe { *location })
        }
    }

    fn check(&self, ret: c_int) -> Result<c_int, Errno> {
        if ret == -1 {
            Err(self.last_errno())
        } else {
            Ok(ret)
        }
    }

    /// Query `uname` and parse the API version out of the release field
    fn api_version(&self) -> Result<ApiVersion, ResolveError> {
        let mut utsname = [0u8; UTSNAME_FIELD_LEN * 5];
        if unsafe { (self.uname)(utsname.as_mut_ptr().cast()) } != 0 {
            return Err(ResolveError::IdentityQuery);
        }

        let release = &utsname[UTSNAME_FIELD_LEN * 2..UTSNAME_FIELD_LEN * 3];
        parse_api_version(release).ok_or_else(|| {
            let end = release.iter().position(|&b| b == 0).unwrap_or(release.len());
            ResolveError::UnknownVersion(String::from_utf8_lossy(&release[..end]).into_owned())
        })
    }
}

/// `PosixShim` that forwards every call to the runtime thread
struct DllShim {
    exports: Exports,
    runtime: RuntimeThread,
}

impl PosixShim for DllShim {
    fn open(&self, path: &CStr, flags: i32) -> Result<i32, Errno> {
        let exports = self.exports;
        let path = path.to_owned();
        self.runtime
            .call(move || exports.check(unsafe { (exports.open)(path.as_ptr(), flags) }))
            .unwrap_or(Err(Errno::UNKNOWN))
    }

    fn close(&self, fd: i32) -> Result<(), Errno> {
        let exports = self.exports;
        self.runtime
            .call(move || exports.check(unsafe { (exports.close)(fd) }).map(|_| ()))
            .unwrap_or(Err(Errno::UNKNOWN))
    }

    fn tcgetattr(&self, fd: i32) -> Result<Termios, Errno> {
        let exports = self.exports;
        self.runtime
            .call(move || {
                let mut termios = Termios::default();
                exports.check(unsafe { (exports.tcgetattr)(fd, &mut termios) })?;
                Ok(termios)
            })
            .unwrap_or(Err(Errno::UNKNOWN))
    }

    fn tcsetattr(&self, fd: i32, when: i32, termios: &Termios) -> Result<(), Errno> {
        let exports = self.exports;
        let termios = *termios;
        self.runtime
            .call(move || {
                exports
                    .check(unsafe { (exports.tcsetattr)(fd, when, &termios) })
                    .map(|_| ())
            })
            .unwrap_or(Err(Errno::UNKNOWN))
    }

    fn cfmakeraw(&self, termios: &mut Termios) -> bool {
        let Some(cfmakeraw) = self.exports.cfmakeraw else {
            return false;
        };
        let mut raw = *termios;
        let made = self.runtime.call(move || {
            unsafe { cfmakeraw(&mut raw) };
            raw
        });
        match made {
            Some(raw) => {
                *termios = raw;
                true
            }
            None => false,
        }
    }

    fn winsize(&self, fd: i32) -> Result<Winsize, Errno> {
        let exports = self.exports;
        self.runtime
            .call(move || {
                let mut winsize = Winsize::default();
                exports.check(unsafe {
                    (exports.ioctl)(fd, TIOCGWINSZ, &mut winsize as *mut Winsize)
                })?;
                Ok(winsize)
            })
            .unwrap_or(Err(Errno::UNKNOWN))
    }

    fn strerror(&self, errno: Errno) -> String {
        let exports = self.exports;
        self.runtime
            .call(move || {
                let message = unsafe { (exports.strerror)(errno.0) };
                if message.is_null() {
                    None
                } else {
                    Some(unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned())
                }
            })
            .flatten()
            .unwrap_or_else(|| errno.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_export_fails_before_init() {
        // kernel32 exports DebugBreak but none of the POSIX entry points.
        // Calling the "initializer" would raise a breakpoint exception.
        let err = bring_up("kernel32.dll", "DebugBreak", "__cygwin_user_data")
            .err()
            .unwrap();
        assert_eq!(
            err,
            ResolveError::MissingSymbol {
                module: "kernel32.dll",
                symbol: "tcgetattr",
            }
        );
    }

    #[test]
    fn test_missing_module_is_load_failure() {
        let err = bring_up("ptybridge-no-such-runtime.dll", "cygwin_dll_init", "__cygwin_user_data")
            .err()
            .unwrap();
        assert!(matches!(err, ResolveError::LoadFailed { .. }));
    }
}
