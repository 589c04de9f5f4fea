//! POSIX entry points of a loaded compatibility runtime.

use std::ffi::CStr;
use std::fmt;

use super::termios::{Termios, Winsize, EINTR};

/// Error code taken from the runtime's own `errno`, not the host's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    /// The runtime returned no errno location
    pub const UNKNOWN: Errno = Errno(-1);

    pub fn is_interrupted(self) -> bool {
        self.0 == EINTR
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

/// Capability set of a compatibility runtime.
///
/// Descriptors passed in and returned belong to the runtime's descriptor
/// table, never the host's.
pub trait PosixShim: Send + Sync {
    fn open(&self, path: &CStr, flags: i32) -> Result<i32, Errno>;

    fn close(&self, fd: i32) -> Result<(), Errno>;

    fn tcgetattr(&self, fd: i32) -> Result<Termios, Errno>;

    fn tcsetattr(&self, fd: i32, when: i32, termios: &Termios) -> Result<(), Errno>;

    /// Run the runtime's `cfmakeraw`; `false` if it does not export one.
    fn cfmakeraw(&self, termios: &mut Termios) -> bool;

    /// `ioctl(fd, TIOCGWINSZ, ..)`, a single attempt
    fn winsize(&self, fd: i32) -> Result<Winsize, Errno>;

    /// Message for an errno value, from the runtime's `strerror`
    fn strerror(&self, errno: Errno) -> String;
}
