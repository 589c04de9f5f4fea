//! Host terminal provider
//!
//! Puts the terminal the host is attached to into raw mode and reports its
//! size. A Cygwin/MSYS pty is driven through the runtime's own DLL; anything
//! else is treated as a native console and handled by crossterm.

use std::io;

use thiserror::Error;
use tracing::{debug, info};

use crate::compat::{
    registry, system_loader, BridgeError, CygTerm, MinttyKind, OsInspector, RawMode,
};
use crate::Fd;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Console error: {0}")]
    Console(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, TerminalError>;

/// Capability set of a raw-mode terminal.
///
/// Implementations restore the terminal when dropped.
pub trait TerminalProvider: Send {
    /// Current size as `(width, height)`
    fn size(&mut self) -> Result<(u16, u16)>;

    fn kind(&self) -> MinttyKind;
}

/// Native Windows console (or any terminal crossterm understands)
pub struct NativeConsole {
    raw: bool,
}

impl NativeConsole {
    pub fn enter() -> Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self { raw: true })
    }
}

impl TerminalProvider for NativeConsole {
    fn size(&mut self) -> Result<(u16, u16)> {
        Ok(crossterm::terminal::size()?)
    }

    fn kind(&self) -> MinttyKind {
        MinttyKind::None
    }
}

impl Drop for NativeConsole {
    fn drop(&mut self) {
        if self.raw {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

impl TerminalProvider for CygTerm {
    fn size(&mut self) -> Result<(u16, u16)> {
        Ok(self.get_winsize()?)
    }

    fn kind(&self) -> MinttyKind {
        CygTerm::kind(self)
    }
}

/// The terminal this process talks to, in raw mode
pub struct HostTerminal {
    provider: Box<dyn TerminalProvider>,
    last_size: Option<(u16, u16)>,
}

impl HostTerminal {
    /// Put the terminal behind `fd` into raw mode.
    ///
    /// A descriptor that is not a Cygwin/MSYS pty falls back to the native
    /// console. Any other bridge failure is returned.
    pub fn open(fd: Fd, mode: &RawMode) -> Result<Self> {
        let provider: Box<dyn TerminalProvider> =
            match CygTerm::open_with(fd, &OsInspector, registry(), system_loader(), mode) {
                Ok(term) => {
                    info!("Host terminal is a {:?} pty ({})", term.kind(), term.device());
                    Box::new(term)
                }
                Err(BridgeError::NotApplicable(_)) => {
                    debug!("Descriptor {} is not a mintty pty, using native console", fd);
                    Box::new(NativeConsole::enter()?)
                }
                Err(e) => return Err(e.into()),
            };
        Ok(Self::with_provider(provider))
    }

    pub fn with_provider(provider: Box<dyn TerminalProvider>) -> Self {
        Self {
            provider,
            last_size: None,
        }
    }

    pub fn kind(&self) -> MinttyKind {
        self.provider.kind()
    }

    pub fn size(&mut self) -> Result<(u16, u16)> {
        let size = self.provider.size()?;
        self.last_size = Some(size);
        Ok(size)
    }

    /// Size, or `fallback` when the terminal cannot report one
    pub fn size_or(&mut self, fallback: (u16, u16)) -> (u16, u16) {
        self.size().unwrap_or(fallback)
    }

    /// New size if it differs from the last one observed
    pub fn poll_resize(&mut self) -> Option<(u16, u16)> {
        let previous = self.last_size;
        match self.size() {
            Ok(size) if Some(size) != previous => Some(size),
            _ => None,
        }
    }
}
