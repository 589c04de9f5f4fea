//! Raw-mode sessions on Cygwin/MSYS ptys
//!
//! The host's descriptor is useless to the runtime's own functions, so a
//! session opens the pty device again through the runtime and does all its
//! work on that second descriptor.

use std::env;
use std::ffi::CString;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::module::{registry, system_loader, CompatModule, CompatRegistry, ModuleLoader};
use super::pipe_name::{classify_with, HandleInspector, OsInspector, PipeNameQuery};
use super::termios::{RawMode, Termios, O_BINARY, O_RDWR, TCSANOW};
use super::{BridgeError, MinttyKind, Result};
use crate::Fd;

/// Environment variable naming the pty device in older runtimes' children
const TTY_ENV: &str = "TTY";

/// A Cygwin/MSYS pty in raw mode.
///
/// The attributes found at open time are restored when the session is closed
/// or dropped.
pub struct CygTerm {
    module: Arc<CompatModule>,
    /// Descriptor in the runtime's table
    fd: i32,
    device: String,
    /// Attributes captured at open, `None` if they could not be read
    restore: Option<Termios>,
    size: Option<(u16, u16)>,
    closed: bool,
}

impl CygTerm {
    /// Open a session on `fd` with the default raw mode.
    ///
    /// Fails with `BridgeError::NotApplicable` when `fd` is not a mintty pty;
    /// callers then fall back to native console handling.
    pub fn open(fd: Fd) -> Result<Self> {
        Self::open_with(fd, &OsInspector, registry(), system_loader(), &RawMode::default())
    }

    pub fn open_with(
        fd: Fd,
        inspector: &dyn HandleInspector,
        registry: &CompatRegistry,
        loader: &dyn ModuleLoader,
        mode: &RawMode,
    ) -> Result<Self> {
        let kind = classify_with(inspector, fd, PipeNameQuery::EnvironmentKind).kind();
        if !kind.is_mintty() {
            return Err(BridgeError::NotApplicable(fd));
        }

        let module = registry.acquire(inspector, loader, kind)?;
        let device = device_path(inspector, fd).ok_or(BridgeError::NoDevicePath(fd))?;
        let path = CString::new(device.as_str()).map_err(|_| BridgeError::NoDevicePath(fd))?;

        let shim = module.shim();
        let term_fd = shim.open(&path, O_RDWR | O_BINARY).map_err(|errno| {
            let message = shim.strerror(errno);
            error!("Failed to open {}: {}", device, message);
            BridgeError::DeviceOpen {
                path: device.clone(),
                errno,
                message,
            }
        })?;
        debug!("Opened {} as runtime fd {}", device, term_fd);

        let mut term = Self {
            module,
            fd: term_fd,
            device,
            restore: None,
            size: None,
            closed: false,
        };
        term.enter_raw_mode(mode);
        term.size = term.get_winsize().ok();

        Ok(term)
    }

    fn enter_raw_mode(&mut self, mode: &RawMode) {
        let shim = self.module.shim();

        let original = match shim.tcgetattr(self.fd) {
            Ok(termios) => termios,
            Err(errno) => {
                warn!("tcgetattr on {} failed: {}", self.device, shim.strerror(errno));
                return;
            }
        };
        self.restore = Some(original);

        let mut raw = original;
        if mode.is_full() && shim.cfmakeraw(&mut raw) {
            mode.apply_control_chars(&mut raw);
        } else {
            mode.apply(&mut raw);
        }

        if let Err(errno) = shim.tcsetattr(self.fd, TCSANOW, &raw) {
            warn!("tcsetattr on {} failed: {}", self.device, shim.strerror(errno));
        }
    }

    /// Current window size as `(width, height)`.
    ///
    /// Retries for as long as the runtime reports `EINTR`.
    pub fn get_winsize(&mut self) -> Result<(u16, u16)> {
        let shim = self.module.shim();
        loop {
            match shim.winsize(self.fd) {
                Ok(ws) => {
                    let size = (ws.ws_col, ws.ws_row);
                    self.size = Some(size);
                    return Ok(size);
                }
                Err(errno) if errno.is_interrupted() => continue,
                Err(errno) => {
                    return Err(BridgeError::Winsize {
                        errno,
                        message: shim.strerror(errno),
                    })
                }
            }
        }
    }

    /// Last size seen by `get_winsize`
    pub fn size(&self) -> Option<(u16, u16)> {
        self.size
    }

    pub fn kind(&self) -> MinttyKind {
        self.module.kind()
    }

    /// Device path the session opened, e.g. `/dev/pty0`
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Whether the original attributes will be restored on close
    pub fn can_restore(&self) -> bool {
        self.restore.is_some()
    }

    /// Restore the original attributes and close the device.
    ///
    /// Failures are logged, never returned. The module stays loaded.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let shim = self.module.shim();
        if let Some(original) = self.restore.take() {
            if let Err(errno) = shim.tcsetattr(self.fd, TCSANOW, &original) {
                warn!("Failed to restore {}: {}", self.device, shim.strerror(errno));
            }
        }
        if let Err(errno) = shim.close(self.fd) {
            warn!("Failed to close {}: {}", self.device, shim.strerror(errno));
        }
    }
}

impl Drop for CygTerm {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `/dev/pty<N>` from the pipe name, else the `TTY` environment value
fn device_path(inspector: &dyn HandleInspector, fd: Fd) -> Option<String> {
    if let Some(index) = classify_with(inspector, fd, PipeNameQuery::PtyIndex).pty_index() {
        return Some(format!("/dev/pty{}", index));
    }
    env::var(TTY_ENV).ok().filter(|tty| !tty.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::module::tests::PipeTable;
    use crate::compat::module::ApiVersion;
    use crate::compat::shim::{Errno, PosixShim};
    use crate::compat::termios::{LocalFlags, Winsize, EINTR, VMIN};
    use crate::compat::ResolveError;
    use std::collections::VecDeque;
    use std::ffi::CStr;
    use std::sync::Mutex;

    const CYGWIN_PIPE: &str = "\\cygwin-1888ae32e00d56aa-pty3-from-master";

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Open(String),
        Close(i32),
        Get(i32),
        Set(i32, Termios),
        Winsize(i32),
    }

    #[derive(Default)]
    struct ShimState {
        calls: Vec<Call>,
        open_error: Option<Errno>,
        get_error: Option<Errno>,
        set_error: Option<Errno>,
        winsize: VecDeque<std::result::Result<Winsize, Errno>>,
    }

    #[derive(Clone, Default)]
    struct RecordingShim(Arc<Mutex<ShimState>>);

    impl RecordingShim {
        fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().calls.clone()
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|c| pred(c)).count()
        }

        fn record(&self, call: Call) {
            self.0.lock().unwrap().calls.push(call);
        }
    }

    fn cooked() -> Termios {
        Termios {
            c_lflag: LocalFlags::all().bits(),
            ..Termios::default()
        }
    }

    impl PosixShim for RecordingShim {
        fn open(&self, path: &CStr, _flags: i32) -> std::result::Result<i32, Errno> {
            self.record(Call::Open(path.to_string_lossy().into_owned()));
            match self.0.lock().unwrap().open_error {
                Some(errno) => Err(errno),
                None => Ok(7),
            }
        }

        fn close(&self, fd: i32) -> std::result::Result<(), Errno> {
            self.record(Call::Close(fd));
            Ok(())
        }

        fn tcgetattr(&self, fd: i32) -> std::result::Result<Termios, Errno> {
            self.record(Call::Get(fd));
            match self.0.lock().unwrap().get_error {
                Some(errno) => Err(errno),
                None => Ok(cooked()),
            }
        }

        fn tcsetattr(
            &self,
            fd: i32,
            _when: i32,
            termios: &Termios,
        ) -> std::result::Result<(), Errno> {
            self.record(Call::Set(fd, *termios));
            match self.0.lock().unwrap().set_error {
                Some(errno) => Err(errno),
                None => Ok(()),
            }
        }

        fn cfmakeraw(&self, _termios: &mut Termios) -> bool {
            false
        }

        fn winsize(&self, fd: i32) -> std::result::Result<Winsize, Errno> {
            self.record(Call::Winsize(fd));
            self.0
                .lock()
                .unwrap()
                .winsize
                .pop_front()
                .unwrap_or(Ok(Winsize {
                    ws_row: 24,
                    ws_col: 80,
                    ..Winsize::default()
                }))
        }

        fn strerror(&self, errno: Errno) -> String {
            format!("error {}", errno.0)
        }
    }

    struct ShimLoader(RecordingShim);

    impl ModuleLoader for ShimLoader {
        fn load(&self, kind: MinttyKind) -> std::result::Result<CompatModule, ResolveError> {
            Ok(CompatModule::new(
                kind,
                ApiVersion { major: 0, minor: 341 },
                Box::new(self.0.clone()),
            ))
        }
    }

    fn open(shim: &RecordingShim) -> Result<CygTerm> {
        CygTerm::open_with(
            0,
            &PipeTable(Some(CYGWIN_PIPE)),
            &CompatRegistry::new(),
            &ShimLoader(shim.clone()),
            &RawMode::default(),
        )
    }

    #[test]
    fn test_open_enters_raw_mode() {
        let shim = RecordingShim::default();
        let term = open(&shim).unwrap();

        assert_eq!(term.device(), "/dev/pty3");
        assert_eq!(term.kind(), MinttyKind::Cygwin);
        assert!(term.can_restore());
        assert_eq!(term.size(), Some((80, 24)));

        let calls = shim.calls();
        assert_eq!(calls[0], Call::Open("/dev/pty3".to_string()));
        assert_eq!(calls[1], Call::Get(7));
        let Call::Set(7, raw) = calls[2] else {
            panic!("expected tcsetattr, got {:?}", calls[2]);
        };
        assert!(!raw.local_flags().intersects(LocalFlags::all()));
        assert_eq!(raw.c_cc[VMIN], 1);
        assert_eq!(calls[3], Call::Winsize(7));
    }

    #[test]
    fn test_not_applicable_allocates_nothing() {
        let shim = RecordingShim::default();
        let registry = CompatRegistry::new();
        let result = CygTerm::open_with(
            4,
            &PipeTable(None),
            &registry,
            &ShimLoader(shim.clone()),
            &RawMode::default(),
        );

        assert!(matches!(result, Err(BridgeError::NotApplicable(4))));
        assert!(shim.calls().is_empty());
        assert!(!registry.is_ready());
    }

    #[test]
    fn test_device_open_failure() {
        let shim = RecordingShim::default();
        shim.0.lock().unwrap().open_error = Some(Errno(2));

        match open(&shim) {
            Err(BridgeError::DeviceOpen { path, errno, message }) => {
                assert_eq!(path, "/dev/pty3");
                assert_eq!(errno, Errno(2));
                assert_eq!(message, "error 2");
            }
            other => panic!("unexpected result: {:?}", other.map(|t| t.device().to_string())),
        }
        assert_eq!(shim.count(|c| matches!(c, Call::Close(_))), 0);
    }

    #[test]
    fn test_close_restores_original_attributes() {
        let shim = RecordingShim::default();
        open(&shim).unwrap().close();

        let calls = shim.calls();
        let n = calls.len();
        assert_eq!(calls[n - 2], Call::Set(7, cooked()));
        assert_eq!(calls[n - 1], Call::Close(7));
    }

    #[test]
    fn test_close_once_when_restore_fails() {
        let shim = RecordingShim::default();
        let term = open(&shim).unwrap();
        shim.0.lock().unwrap().set_error = Some(Errno(5));

        term.close();
        assert_eq!(shim.count(|c| *c == Call::Close(7)), 1);
    }

    #[test]
    fn test_drop_closes_device() {
        let shim = RecordingShim::default();
        {
            let _term = open(&shim).unwrap();
        }
        assert_eq!(shim.count(|c| *c == Call::Close(7)), 1);
    }

    #[test]
    fn test_unreadable_attributes_skip_restore() {
        let shim = RecordingShim::default();
        shim.0.lock().unwrap().get_error = Some(Errno(25));

        let term = open(&shim).unwrap();
        assert!(!term.can_restore());
        term.close();

        assert_eq!(shim.count(|c| matches!(c, Call::Set(..))), 0);
        assert_eq!(shim.count(|c| *c == Call::Close(7)), 1);
    }

    #[test]
    fn test_winsize_retries_interrupted() {
        let shim = RecordingShim::default();
        let mut term = open(&shim).unwrap();
        let before = shim.count(|c| matches!(c, Call::Winsize(_)));

        {
            let mut state = shim.0.lock().unwrap();
            state.winsize.push_back(Err(Errno(EINTR)));
            state.winsize.push_back(Err(Errno(EINTR)));
            state.winsize.push_back(Ok(Winsize {
                ws_row: 50,
                ws_col: 132,
                ..Winsize::default()
            }));
        }

        assert_eq!(term.get_winsize().unwrap(), (132, 50));
        assert_eq!(shim.count(|c| matches!(c, Call::Winsize(_))) - before, 3);
        assert_eq!(term.size(), Some((132, 50)));
    }

    #[test]
    fn test_winsize_other_failure_not_retried() {
        let shim = RecordingShim::default();
        let mut term = open(&shim).unwrap();
        let before = shim.count(|c| matches!(c, Call::Winsize(_)));

        shim.0.lock().unwrap().winsize.push_back(Err(Errno(9)));

        let err = term.get_winsize().unwrap_err();
        assert!(matches!(err, BridgeError::Winsize { errno: Errno(9), .. }));
        assert_eq!(shim.count(|c| matches!(c, Call::Winsize(_))) - before, 1);
        assert_eq!(term.size(), Some((80, 24)));
    }
}
