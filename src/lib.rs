//! ptybridge - Cygwin/MSYS2 pty detection and winpty process hosting for Windows
//!
//! A terminal host on Windows can be attached to one of three terminal
//! backends: the native console, or a mintty-style pty owned by the Cygwin or
//! MSYS2 runtime. This crate lets the host find out which one it is talking
//! to, switch the terminal into raw mode through the right runtime, and run
//! child processes on a pseudo console of its own.
//!
//! # Components
//!
//! - **compat**: pipe name classifier and the Cygwin/MSYS terminal bridge
//! - **terminal**: host terminal provider (native console or `CygTerm`)
//! - **driver**: winpty-backed child processes with asynchronous exit detection
//! - **event_loop**: call contract of the host event loop, plus a threaded loop
//! - **config**: settings file for the `ptybridge` binary
//!
//! # Architecture
//!
//! ```text
//! fd ──► classify ──► CygTerm ──► CompatModule (cygwin1.dll / msys-2.0.dll)
//!            │
//!            └─(none)──► native console
//!
//! PtySession ──► PtyBackend (winpty.dll)
//! ├── conin/conout pipes ──► PipeStream endpoints (EventLoop)
//! └── ExitTracker ──► OS wait callback ──► EOF poll timer ──► on_exit
//! ```

pub mod compat;
pub mod config;
pub mod driver;
pub mod event_loop;
pub mod terminal;

#[cfg(windows)]
mod dylib;

/// A C runtime file descriptor as seen by the host process.
pub type Fd = i32;

pub use compat::{BridgeError, CygTerm, MinttyKind, PipeNameQuery};
pub use config::Config;
pub use driver::{DriverError, ExitPhase, ProcessObserver, PtySession, SpawnOptions};
pub use terminal::HostTerminal;
