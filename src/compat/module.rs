//! Compatibility module loading
//!
//! The runtime DLL is loaded at most once per process. The first caller that
//! finds a Cygwin/MSYS pty loads and resolves it; a failed load is cached and
//! never retried.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, info};

use super::pipe_name::{classify_with, HandleInspector, OsInspector, PipeNameQuery};
use super::shim::PosixShim;
use super::{BridgeError, MinttyKind, ResolveError, Result};
use crate::Fd;

/// Descriptors probed to find out which runtime the process runs under
pub const PROBE_FDS: [Fd; 3] = [0, 1, 2];

/// Length of each field of the runtime's legacy `struct utsname`
pub const UTSNAME_FIELD_LEN: usize = 20;

/// Runtime API version, the `(major.minor)` part of the release string
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Parse `...(<major>.<minor>)...` out of a NUL-padded `utsname` field,
/// e.g. `3.4.9(0.341/5/3)`.
pub fn parse_api_version(field: &[u8]) -> Option<ApiVersion> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let text = std::str::from_utf8(&field[..end]).ok()?;

    let (_, rest) = text.split_once('(')?;
    let (major, rest) = leading_number(rest)?;
    let rest = rest.strip_prefix('.')?;
    let (minor, _) = leading_number(rest)?;

    Some(ApiVersion { major, minor })
}

fn leading_number(s: &str) -> Option<(u32, &str)> {
    let len = s.bytes().take_while(u8::is_ascii_digit).count();
    if len == 0 {
        return None;
    }
    let (digits, rest) = s.split_at(len);
    Some((digits.parse().ok()?, rest))
}

/// A loaded and fully resolved runtime DLL
pub struct CompatModule {
    kind: MinttyKind,
    version: ApiVersion,
    shim: Box<dyn PosixShim>,
}

impl CompatModule {
    pub fn new(kind: MinttyKind, version: ApiVersion, shim: Box<dyn PosixShim>) -> Self {
        Self {
            kind,
            version,
            shim,
        }
    }

    pub fn kind(&self) -> MinttyKind {
        self.kind
    }

    pub fn version(&self) -> ApiVersion {
        self.version
    }

    pub fn shim(&self) -> &dyn PosixShim {
        self.shim.as_ref()
    }
}

impl fmt::Debug for CompatModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompatModule")
            .field("kind", &self.kind)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Loads the runtime DLL for a given kind.
///
/// Either every required symbol resolves, or the module is released and an
/// error returned.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, kind: MinttyKind) -> std::result::Result<CompatModule, ResolveError>;
}

enum ModuleState {
    Uninitialized,
    Ready(Arc<CompatModule>),
    Failed(ResolveError),
}

/// Process-scoped holder of the compatibility module
pub struct CompatRegistry {
    state: Mutex<ModuleState>,
}

impl Default for CompatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CompatRegistry {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(ModuleState::Uninitialized),
        }
    }

    /// Return the module, loading it on first use.
    ///
    /// The standard descriptors are probed first; `hint` is used when none of
    /// them is a mintty pty. Finding no runtime at all is not cached, a failed
    /// load is.
    pub fn acquire(
        &self,
        inspector: &dyn HandleInspector,
        loader: &dyn ModuleLoader,
        hint: MinttyKind,
    ) -> Result<Arc<CompatModule>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        match &*state {
            ModuleState::Ready(module) => return Ok(Arc::clone(module)),
            ModuleState::Failed(err) => return Err(err.clone().into()),
            ModuleState::Uninitialized => {}
        }

        let kind = PROBE_FDS
            .iter()
            .map(|&fd| classify_with(inspector, fd, PipeNameQuery::EnvironmentKind).kind())
            .find(|kind| kind.is_mintty())
            .unwrap_or(hint);
        if !kind.is_mintty() {
            return Err(BridgeError::NoRuntime);
        }

        match loader.load(kind) {
            Ok(module) => {
                info!("Loaded {:?} runtime, API {}", kind, module.version());
                let module = Arc::new(module);
                *state = ModuleState::Ready(Arc::clone(&module));
                Ok(module)
            }
            Err(err) => {
                error!("Failed to initialize {:?} runtime: {}", kind, err);
                *state = ModuleState::Failed(err.clone());
                Err(err.into())
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            ModuleState::Ready(_)
        )
    }

    pub fn has_failed(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            ModuleState::Failed(_)
        )
    }
}

static REGISTRY: CompatRegistry = CompatRegistry::new();

/// The process-wide registry
pub fn registry() -> &'static CompatRegistry {
    &REGISTRY
}

/// Loader for the current platform
pub fn system_loader() -> &'static dyn ModuleLoader {
    #[cfg(windows)]
    {
        &super::dll::DllLoader
    }
    #[cfg(not(windows))]
    {
        &UnsupportedLoader
    }
}

#[cfg(not(windows))]
struct UnsupportedLoader;

#[cfg(not(windows))]
impl ModuleLoader for UnsupportedLoader {
    fn load(&self, _kind: MinttyKind) -> std::result::Result<CompatModule, ResolveError> {
        Err(ResolveError::Unsupported)
    }
}

/// Load the runtime of the current process, once.
pub fn acquire_module() -> Result<Arc<CompatModule>> {
    REGISTRY.acquire(&OsInspector, system_loader(), MinttyKind::None)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::compat::pipe_name::ObjectKind;
    use crate::compat::shim::Errno;
    use crate::compat::termios::{Termios, Winsize};
    use std::ffi::CStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct NullShim;

    impl PosixShim for NullShim {
        fn open(&self, _path: &CStr, _flags: i32) -> std::result::Result<i32, Errno> {
            Ok(3)
        }
        fn close(&self, _fd: i32) -> std::result::Result<(), Errno> {
            Ok(())
        }
        fn tcgetattr(&self, _fd: i32) -> std::result::Result<Termios, Errno> {
            Ok(Termios::default())
        }
        fn tcsetattr(&self, _fd: i32, _when: i32, _t: &Termios) -> std::result::Result<(), Errno> {
            Ok(())
        }
        fn cfmakeraw(&self, _t: &mut Termios) -> bool {
            false
        }
        fn winsize(&self, _fd: i32) -> std::result::Result<Winsize, Errno> {
            Ok(Winsize::default())
        }
        fn strerror(&self, errno: Errno) -> String {
            errno.to_string()
        }
    }

    /// Reports every descriptor as the same pipe
    pub(crate) struct PipeTable(pub Option<&'static str>);

    impl HandleInspector for PipeTable {
        fn object_kind(&self, _fd: Fd) -> ObjectKind {
            if self.0.is_some() {
                ObjectKind::Pipe
            } else {
                ObjectKind::Other
            }
        }

        fn pipe_name(&self, _fd: Fd) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    pub(crate) struct CountingLoader {
        pub attempts: AtomicUsize,
        pub fail: Option<ResolveError>,
    }

    impl CountingLoader {
        pub(crate) fn ok() -> Self {
            Self {
                attempts: AtomicUsize::new(0),
                fail: None,
            }
        }

        pub(crate) fn failing(err: ResolveError) -> Self {
            Self {
                attempts: AtomicUsize::new(0),
                fail: Some(err),
            }
        }

        pub(crate) fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl ModuleLoader for CountingLoader {
        fn load(&self, kind: MinttyKind) -> std::result::Result<CompatModule, ResolveError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match &self.fail {
                Some(err) => Err(err.clone()),
                None => Ok(CompatModule::new(
                    kind,
                    ApiVersion { major: 0, minor: 341 },
                    Box::new(NullShim),
                )),
            }
        }
    }

    const MSYS_PIPE: &str = "\\msys-dd50a72ab4668b33-pty1-to-master";

    #[test]
    fn test_parse_api_version() {
        assert_eq!(
            parse_api_version(b"3.4.9(0.341/5/3)\0\0\0\0"),
            Some(ApiVersion { major: 0, minor: 341 })
        );
        assert_eq!(
            parse_api_version(b"2.11.2(0.329/5/3)"),
            Some(ApiVersion { major: 0, minor: 329 })
        );
        assert_eq!(parse_api_version(b"3.4.9-1.x86_64\0"), None);
        assert_eq!(parse_api_version(b"3.4.9(.341/5/3)"), None);
        assert_eq!(parse_api_version(b"3.4.9(0/5/3)"), None);
        assert_eq!(parse_api_version(b""), None);
    }

    #[test]
    fn test_failed_load_is_cached() {
        let registry = CompatRegistry::new();
        let loader = CountingLoader::failing(ResolveError::MissingSymbol {
            module: "msys-2.0.dll",
            symbol: "ioctl",
        });
        let handles = PipeTable(Some(MSYS_PIPE));

        let first = registry.acquire(&handles, &loader, MinttyKind::None).unwrap_err();
        let second = registry.acquire(&handles, &loader, MinttyKind::None).unwrap_err();

        assert_eq!(loader.attempts(), 1);
        assert!(registry.has_failed());
        assert_eq!(first.to_string(), second.to_string());
        assert!(matches!(
            second,
            BridgeError::Resolution(ResolveError::MissingSymbol { symbol: "ioctl", .. })
        ));
    }

    #[test]
    fn test_successful_load_is_shared() {
        let registry = CompatRegistry::new();
        let loader = CountingLoader::ok();
        let handles = PipeTable(Some(MSYS_PIPE));

        let a = registry.acquire(&handles, &loader, MinttyKind::None).unwrap();
        let b = registry.acquire(&handles, &loader, MinttyKind::Cygwin).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.kind(), MinttyKind::Msys);
        assert_eq!(loader.attempts(), 1);
        assert!(registry.is_ready());
    }

    #[test]
    fn test_no_runtime_is_not_cached() {
        let registry = CompatRegistry::new();
        let loader = CountingLoader::ok();
        let console = PipeTable(None);

        let err = registry.acquire(&console, &loader, MinttyKind::None).unwrap_err();
        assert!(matches!(err, BridgeError::NoRuntime));
        assert_eq!(loader.attempts(), 0);
        assert!(!registry.has_failed());

        // A caller that already classified its own descriptor supplies the kind
        let module = registry.acquire(&console, &loader, MinttyKind::Cygwin).unwrap();
        assert_eq!(module.kind(), MinttyKind::Cygwin);
        assert_eq!(loader.attempts(), 1);
    }
}
