//! Cygwin/MSYS2 terminal bridge.
//!
//! Cygwin and MSYS2 implement their ptys as named pipes, so a descriptor
//! attached to mintty looks like a plain pipe to Windows. This module
//! recognizes those pipes by name, loads the runtime's own DLL and drives the
//! terminal through the runtime's POSIX entry points.
//!
//! - **pipe_name**: pipe name classifier (`classify`)
//! - **termios**: runtime `termios`/`winsize` layout and raw-mode toggles
//! - **shim**: `PosixShim`, the capability set a loaded runtime exposes
//! - **module**: `CompatModule` and the process-wide `CompatRegistry`
//! - **session**: `CygTerm`, one raw-mode session on a runtime pty
//!
//! # Module Hierarchy
//!
//! ```text
//! compat/
//! ├── mod.rs        - Errors and exports
//! ├── pipe_name.rs  - Classifier + HandleInspector
//! ├── termios.rs    - termios/winsize ABI, RawMode
//! ├── shim.rs       - PosixShim trait
//! ├── module.rs     - CompatModule, CompatRegistry, version parsing
//! ├── dll.rs        - DLL-backed loader (Windows)
//! ├── runtime.rs    - Runtime thread with the reserved stack block
//! ├── user_data.rs  - API version in the runtime's per-process data
//! └── session.rs    - CygTerm
//! ```

pub mod module;
pub mod pipe_name;
pub mod session;
pub mod shim;
pub mod termios;

#[cfg(windows)]
mod dll;
#[cfg_attr(not(windows), allow(dead_code))]
mod runtime;
#[cfg_attr(not(windows), allow(dead_code))]
mod user_data;

use thiserror::Error;

use crate::Fd;

pub use module::{
    acquire_module, registry, system_loader, ApiVersion, CompatModule, CompatRegistry,
    ModuleLoader,
};
pub use pipe_name::{
    classify, mintty_kind, Classification, HandleInspector, ObjectKind, OsInspector,
    PipeNameQuery,
};
pub use session::CygTerm;
pub use shim::{Errno, PosixShim};
pub use termios::RawMode;

/// Which POSIX compatibility runtime, if any, owns a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MinttyKind {
    #[default]
    None,
    Cygwin,
    Msys,
}

impl MinttyKind {
    /// File name of the runtime DLL
    pub fn dll_name(self) -> Option<&'static str> {
        match self {
            MinttyKind::None => None,
            MinttyKind::Cygwin => Some("cygwin1.dll"),
            MinttyKind::Msys => Some("msys-2.0.dll"),
        }
    }

    /// Runtime initializer exported by the DLL
    pub fn init_symbol(self) -> Option<&'static str> {
        match self {
            MinttyKind::None => None,
            MinttyKind::Cygwin => Some("cygwin_dll_init"),
            MinttyKind::Msys => Some("msys_dll_init"),
        }
    }

    /// Per-process user data export that carries the API version
    pub fn user_data_symbol(self) -> Option<&'static str> {
        match self {
            MinttyKind::None => None,
            MinttyKind::Cygwin => Some("__cygwin_user_data"),
            MinttyKind::Msys => Some("__msys_user_data"),
        }
    }

    pub fn is_mintty(self) -> bool {
        self != MinttyKind::None
    }
}

/// Failure to bring up a compatibility module.
///
/// Cloneable because a failed acquisition is cached for the process lifetime
/// and handed out to every later caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Failed to load {module}: os error {code}")]
    LoadFailed { module: &'static str, code: i32 },

    #[error("{module} does not export `{symbol}`")]
    MissingSymbol {
        module: &'static str,
        symbol: &'static str,
    },

    #[error("Unrecognized runtime release string: {0:?}")]
    UnknownVersion(String),

    #[error("Runtime identity query failed")]
    IdentityQuery,

    #[error("{module} user data is too small for the API version ({size} bytes)")]
    UserDataTooSmall { module: &'static str, size: usize },

    #[error("Runtime thread failed: {0}")]
    RuntimeThread(String),

    #[error("Compatibility modules are only available on 64-bit Windows")]
    Unsupported,
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Descriptor {0} is not a Cygwin/MSYS pty")]
    NotApplicable(Fd),

    #[error("No Cygwin/MSYS pty among the standard descriptors")]
    NoRuntime,

    #[error("Compatibility module unavailable: {0}")]
    Resolution(#[from] ResolveError),

    #[error("No pty device path for descriptor {0}")]
    NoDevicePath(Fd),

    #[error("Failed to open {path}: {message}")]
    DeviceOpen {
        path: String,
        errno: Errno,
        message: String,
    },

    #[error("Failed to query window size: {message}")]
    Winsize { errno: Errno, message: String },
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_names() {
        assert_eq!(MinttyKind::Cygwin.dll_name(), Some("cygwin1.dll"));
        assert_eq!(MinttyKind::Msys.dll_name(), Some("msys-2.0.dll"));
        assert_eq!(MinttyKind::None.dll_name(), None);
        assert_eq!(MinttyKind::Msys.init_symbol(), Some("msys_dll_init"));
        assert!(!MinttyKind::None.is_mintty());
    }

    #[test]
    fn test_cached_error_is_cloneable() {
        let err = ResolveError::MissingSymbol {
            module: "cygwin1.dll",
            symbol: "tcgetattr",
        };
        let bridge: BridgeError = err.clone().into();
        assert_eq!(
            bridge.to_string(),
            "Compatibility module unavailable: cygwin1.dll does not export `tcgetattr`"
        );
    }
}
