//! Pseudo-console process driver
//!
//! Spawns a child on a pty-hosting backend, connects the host's streams to
//! the backend's console pipes and reports the child's exit.
//!
//! # Module Hierarchy
//!
//! ```text
//! driver/
//! ├── mod.rs         - PtySession, SpawnOptions, DriverError
//! ├── backend.rs     - PtyBackend / ChildProcess seams, flags
//! ├── exit.rs        - Exit state machine
//! ├── cmdline.rs     - Command-line builders, UTF-16 conversion
//! ├── winpty.rs      - winpty.dll backend (Windows)
//! └── os_process.rs  - Process handle and exit wait (Windows)
//! ```

pub mod backend;
pub mod cmdline;
mod exit;

#[cfg(windows)]
pub mod os_process;
#[cfg(windows)]
pub mod winpty;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::event_loop::{ConnectRequest, EventLoop, PipeStream};
use backend::{AgentFlags, BackendError, PtyBackend, SpawnFlags};
use cmdline::{environment_block, from_wide, to_wide, CommandLine, ConversionError};
use exit::ExitTracker;

pub use exit::{ExitPhase, UNKNOWN_EXIT_STATUS};

/// Poll period of the exit timer, as initial delay and repeat
pub const DEFAULT_EOF_POLL: Duration = Duration::from_millis(200);

/// Step of the spawn sequence that the backend failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Open,
    PipeName,
    SpawnConfig,
    Spawn,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "Agent configuration",
            Stage::Open => "Agent startup",
            Stage::PipeName => "Console pipe name query",
            Stage::SpawnConfig => "Spawn configuration",
            Stage::Spawn => "Process spawn",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("{stage} failed: {source}")]
    Backend {
        stage: Stage,
        #[source]
        source: BackendError,
    },

    #[error("{0}")]
    Conversion(#[from] ConversionError),

    #[error("Failed to connect to {pipe}: {source}")]
    Connect {
        pipe: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to register exit wait: {0}")]
    WaitRegistration(#[source] io::Error),
}

impl DriverError {
    /// Numeric backend error code, if the backend failed
    pub fn backend_code(&self) -> Option<u32> {
        match self {
            DriverError::Backend { source, .. } => Some(source.code),
            _ => None,
        }
    }
}

fn at(stage: Stage) -> impl FnOnce(BackendError) -> DriverError {
    move |source| DriverError::Backend { stage, source }
}

/// Host callbacks for a spawned process
pub trait ProcessObserver: Send + Sync {
    /// The child exited and its output has drained. Called once, on the loop.
    fn on_exit(&self, status: i32);

    /// The session was closed
    fn on_closed(&self) {}
}

/// What to run and how big the pty starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    /// Replaces the child's environment when set
    pub env: Option<Vec<(String, String)>>,
    pub width: u16,
    pub height: u16,
    pub eof_poll: Duration,
}

impl SpawnOptions {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            cwd: None,
            env: None,
            width: 80,
            height: 24,
            eof_poll: DEFAULT_EOF_POLL,
        }
    }
}

/// Host streams the child's console is bridged to
#[derive(Clone)]
pub struct Streams {
    /// Written by the host, read by the child
    pub input: Arc<dyn PipeStream>,
    /// Written by the child, read by the host
    pub output: Arc<dyn PipeStream>,
}

/// A child process attached to a pty-hosting agent
pub struct PtySession<B: PtyBackend> {
    backend: Arc<B>,
    agent: Option<B::Agent>,
    width: u16,
    height: u16,
    tracker: Arc<ExitTracker<B::Process>>,
    observer: Arc<dyn ProcessObserver>,
}

impl<B: PtyBackend> PtySession<B> {
    /// Spawn `options.argv` on a new agent.
    ///
    /// Blocks running only the loop's I/O dispatch until both console pipes
    /// are connected. On failure everything built so far is released before
    /// returning.
    pub fn spawn(
        backend: Arc<B>,
        event_loop: &mut dyn EventLoop,
        options: &SpawnOptions,
        streams: &Streams,
        command_line: &dyn CommandLine,
        observer: Arc<dyn ProcessObserver>,
    ) -> Result<Self, DriverError> {
        let cmdline = command_line.build_wide(&options.argv)?;
        let cwd = options
            .cwd
            .as_deref()
            .map(|cwd| to_wide("working directory", cwd))
            .transpose()?;
        let env = options.env.as_deref().map(environment_block).transpose()?;

        let mut config = backend
            .new_config(AgentFlags::ALLOW_CURPROC_DESKTOP_CREATION)
            .map_err(at(Stage::Config))?;
        backend.set_initial_size(&mut config, i32::from(options.width), i32::from(options.height));
        let agent = backend.open(&config).map_err(at(Stage::Open))?;
        drop(config);

        let conin = from_wide(
            "console input pipe name",
            &backend.conin_name(&agent).map_err(at(Stage::PipeName))?,
        )?;
        let conout = from_wide(
            "console output pipe name",
            &backend.conout_name(&agent).map_err(at(Stage::PipeName))?,
        )?;

        let in_request = ConnectRequest::new();
        let out_request = ConnectRequest::new();
        streams.input.connect(&conin, in_request.clone());
        streams.output.connect(&conout, out_request.clone());

        let spawn_config = backend
            .new_spawn_config(SpawnFlags::AUTO_SHUTDOWN, &cmdline, cwd.as_deref(), env.as_deref())
            .map_err(at(Stage::SpawnConfig))?;
        let process = backend.spawn(&agent, &spawn_config).map_err(at(Stage::Spawn))?;
        drop(spawn_config);

        let tracker = ExitTracker::new(
            event_loop,
            process,
            streams.output.clone(),
            observer.clone(),
            options.eof_poll,
        );
        let session = Self {
            backend,
            agent: Some(agent),
            width: options.width,
            height: options.height,
            tracker,
            observer,
        };
        // From here on dropping `session` releases everything

        session.tracker.arm().map_err(DriverError::WaitRegistration)?;

        while !(in_request.is_done() && out_request.is_done()) {
            event_loop.run_io_once();
        }
        for (pipe, request) in [(conin, in_request), (conout, out_request)] {
            if let Some(Err(source)) = request.take_result() {
                return Err(DriverError::Connect { pipe, source });
            }
        }

        info!(
            "Spawned {:?} on a {}x{} pty",
            options.argv.first().map(String::as_str).unwrap_or_default(),
            options.width,
            options.height
        );
        Ok(session)
    }

    /// Forward a new size to the agent. No-op once the master is closed.
    pub fn resize(&mut self, width: u16, height: u16) {
        let Some(agent) = self.agent.as_ref() else {
            return;
        };
        match self.backend.set_size(agent, i32::from(width), i32::from(height)) {
            Ok(()) => {
                self.width = width;
                self.height = height;
            }
            Err(e) => warn!("Failed to resize pty to {}x{}: {}", width, height, e),
        }
    }

    /// Free the agent. Idempotent.
    pub fn close_master(&mut self) {
        if self.agent.take().is_some() {
            debug!("Closed pty master");
        }
    }

    /// Free the agent, release exit tracking and tell the observer.
    pub fn close(mut self) {
        self.close_master();
        self.tracker.shutdown();
        self.observer.on_closed();
    }

    pub fn phase(&self) -> ExitPhase {
        self.tracker.phase()
    }

    pub fn size(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    pub fn is_master_open(&self) -> bool {
        self.agent.is_some()
    }
}

impl<B: PtyBackend> Drop for PtySession<B> {
    fn drop(&mut self) {
        self.tracker.shutdown();
    }
}
