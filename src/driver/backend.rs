//! Pty-hosting backend seam
//!
//! Every backend object is an owned value released on drop, so an early
//! return from spawn frees whatever was built so far.

use std::io;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Agent configuration flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AgentFlags: u64 {
        const CONERR = 0x1;
        const PLAIN_OUTPUT = 0x2;
        const COLOR_ESCAPES = 0x4;
        /// Let the agent create its hidden desktop in the current process
        const ALLOW_CURPROC_DESKTOP_CREATION = 0x8;
    }

    /// Spawn flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpawnFlags: u64 {
        /// Terminate the child when the agent is freed
        const AUTO_SHUTDOWN = 0x1;
        const EXIT_AFTER_SHUTDOWN = 0x2;
    }
}

/// Error reported by the backend, with its numeric code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (winpty error {code}: {})", describe(*.code))]
pub struct BackendError {
    pub code: u32,
    pub message: String,
}

impl BackendError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Name of a winpty error code
pub fn describe(code: u32) -> &'static str {
    match code {
        0 => "success",
        1 => "out of memory",
        2 => "CreateProcess failed",
        3 => "lost connection",
        4 => "agent executable missing",
        5 => "unspecified",
        6 => "agent died",
        7 => "agent timeout",
        8 => "agent creation failed",
        _ => "unknown",
    }
}

/// The child's OS process
pub trait ChildProcess: Send + 'static {
    /// Registration of a one-shot exit wait. Dropping it unregisters the wait
    /// and blocks until a running callback has returned.
    type Wait: Send + 'static;

    /// Call `on_exit` once, on a thread outside the loop, when the process
    /// terminates. Must not call `on_exit` synchronously.
    fn register_exit_wait(&self, on_exit: Box<dyn FnOnce() + Send>) -> io::Result<Self::Wait>;

    fn exit_code(&self) -> io::Result<u32>;
}

/// A pty-hosting library
pub trait PtyBackend: Send + Sync + 'static {
    type Config;
    type SpawnConfig;
    type Agent: Send + 'static;
    type Process: ChildProcess;

    fn new_config(&self, flags: AgentFlags) -> Result<Self::Config, BackendError>;

    fn set_initial_size(&self, config: &mut Self::Config, cols: i32, rows: i32);

    fn open(&self, config: &Self::Config) -> Result<Self::Agent, BackendError>;

    /// Pipe name for the console input, UTF-16 without terminator
    fn conin_name(&self, agent: &Self::Agent) -> Result<Vec<u16>, BackendError>;

    /// Pipe name for the console output, UTF-16 without terminator
    fn conout_name(&self, agent: &Self::Agent) -> Result<Vec<u16>, BackendError>;

    /// `cmdline`, `cwd` and `env` are NUL-terminated UTF-16
    fn new_spawn_config(
        &self,
        flags: SpawnFlags,
        cmdline: &[u16],
        cwd: Option<&[u16]>,
        env: Option<&[u16]>,
    ) -> Result<Self::SpawnConfig, BackendError>;

    fn spawn(
        &self,
        agent: &Self::Agent,
        config: &Self::SpawnConfig,
    ) -> Result<Self::Process, BackendError>;

    fn set_size(&self, agent: &Self::Agent, cols: i32, rows: i32) -> Result<(), BackendError>;
}
