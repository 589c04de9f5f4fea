//! ptybridge - run a console program on a winpty pty inside the current
//! terminal.
//!
//! The current terminal is put into raw mode (through the Cygwin/MSYS runtime
//! when it is a mintty pty, natively otherwise), the program is spawned on a
//! winpty agent and its console is bridged to stdin/stdout until it exits.
//!
//! # Quick Start
//!
//! ```text
//! ptybridge cmd.exe                  # Interactive cmd.exe from mintty
//! ptybridge -s 120x40 -- python -i   # Fixed pty size
//! ptybridge -d C:\src git log        # Run in another directory
//! ```

use std::env;
use std::process;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ptybridge::Config;

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line
#[derive(Debug, Default, PartialEq)]
struct Args {
    /// Fixed pty size; follows the host terminal when unset
    size: Option<(u16, u16)>,
    /// Working directory for the child
    cwd: Option<String>,
    /// Program and its arguments
    argv: Vec<String>,
}

enum Parsed {
    Run(Args),
    Help,
    Version,
}

fn print_version() {
    eprintln!("ptybridge {}", VERSION);
}

fn print_help() {
    eprintln!("ptybridge {} - Run a console program on a winpty pty", VERSION);
    eprintln!();
    eprintln!("Usage: ptybridge [OPTIONS] [--] PROGRAM [ARGS...]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --size <COLSxROWS>  Fixed pty size (default: follow the terminal)");
    eprintln!("  -d, --dir <DIR>         Working directory for PROGRAM");
    eprintln!("  -v, --version           Show version");
    eprintln!("  -h, --help              Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.ptybridge/config.toml");
    eprintln!("Log file:      ~/.ptybridge/ptybridge.log");
}

fn parse_size(value: &str) -> Option<(u16, u16)> {
    let (cols, rows) = value.split_once(['x', 'X'])?;
    let cols: u16 = cols.parse().ok()?;
    let rows: u16 = rows.parse().ok()?;
    (cols > 0 && rows > 0).then_some((cols, rows))
}

fn parse_args(args: &[String]) -> Result<Parsed, String> {
    let mut parsed = Args::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Ok(Parsed::Help),
            "-v" | "--version" => return Ok(Parsed::Version),
            "-s" | "--size" => {
                i += 1;
                let value = args.get(i).ok_or("Missing size argument")?;
                let size = parse_size(value)
                    .ok_or_else(|| format!("Invalid size: {}. Expected COLSxROWS", value))?;
                parsed.size = Some(size);
            }
            "-d" | "--dir" => {
                i += 1;
                let value = args.get(i).ok_or("Missing directory argument")?;
                parsed.cwd = Some(value.clone());
            }
            "--" => {
                i += 1;
                break;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            _ => break,
        }
        i += 1;
    }

    parsed.argv = args[i.min(args.len())..].to_vec();
    if parsed.argv.is_empty() {
        return Err("Missing PROGRAM".to_string());
    }
    Ok(Parsed::Run(parsed))
}

/// Initialize logging to file
fn init_logging(config: &Config) {
    let log_path = config.log_path();
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let raw_args: Vec<String> = env::args().collect();
    let args = match parse_args(&raw_args) {
        Ok(Parsed::Run(args)) => args,
        Ok(Parsed::Help) => {
            print_help();
            process::exit(0);
        }
        Ok(Parsed::Version) => {
            print_version();
            process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            process::exit(2);
        }
    };

    let config = Config::load();
    init_logging(&config);
    info!("ptybridge {} starting: {:?}", VERSION, args.argv);

    #[cfg(not(windows))]
    {
        let _ = (args, config);
        eprintln!("ptybridge only supports Windows.");
        process::exit(1);
    }

    #[cfg(windows)]
    {
        let status = bridge::run(args, &config)?;
        info!("Child exited with status {}", status);
        process::exit(status);
    }
}

#[cfg(windows)]
mod bridge {
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::thread;
    use std::time::Duration;

    use anyhow::Context;
    use tracing::{debug, error, info};

    use ptybridge::driver::cmdline::MsvcQuoting;
    use ptybridge::driver::winpty::WinptyBackend;
    use ptybridge::driver::Streams;
    use ptybridge::event_loop::{NamedPipeStream, ThreadedLoop};
    use ptybridge::{Config, HostTerminal, ProcessObserver, PtySession, SpawnOptions};

    use super::Args;

    /// Upper bound on one loop turn, so resizes are noticed promptly
    const LOOP_TICK: Duration = Duration::from_millis(50);

    #[derive(Default)]
    struct ExitSlot {
        status: Mutex<Option<i32>>,
    }

    impl ExitSlot {
        fn status(&self) -> Option<i32> {
            *self.status.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl ProcessObserver for ExitSlot {
        fn on_exit(&self, status: i32) {
            *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
        }

        fn on_closed(&self) {
            debug!("Session closed");
        }
    }

    pub fn run(args: Args, config: &Config) -> anyhow::Result<i32> {
        let mut host =
            HostTerminal::open(0, &config.raw_mode).context("Failed to set up the host terminal")?;
        let (width, height) = match args.size {
            Some(size) => size,
            None => host.size_or(config.initial_size()),
        };
        info!("Host terminal {:?}, pty {}x{}", host.kind(), width, height);

        let backend = Arc::new(
            WinptyBackend::load(&config.winpty_dll)
                .with_context(|| format!("Failed to load {}", config.winpty_dll))?,
        );

        let mut event_loop = ThreadedLoop::new();
        let input = Arc::new(NamedPipeStream::writer(event_loop.handle()));
        let output = Arc::new(NamedPipeStream::reader(event_loop.handle()));
        let streams = Streams {
            input: input.clone(),
            output: output.clone(),
        };

        let mut options = SpawnOptions::new(args.argv);
        options.cwd = args.cwd;
        options.width = width;
        options.height = height;
        options.eof_poll = config.eof_poll_interval();

        let exit = Arc::new(ExitSlot::default());
        let mut session = PtySession::spawn(
            backend,
            &mut event_loop,
            &options,
            &streams,
            &MsvcQuoting,
            exit.clone(),
        )
        .context("Failed to spawn the program")?;

        // Blocking stdin reads get their own thread; it dies with the process
        let stdin_target = input.clone();
        thread::spawn(move || {
            let mut stdin = io::stdin();
            let mut buffer = [0u8; 4096];
            loop {
                match stdin.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = stdin_target.write_all(&buffer[..n]) {
                            debug!("Input pipe closed: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let mut stdout = io::stdout();
        let status = loop {
            event_loop.run_once(LOOP_TICK);

            let data = output.try_read();
            if !data.is_empty() {
                stdout.write_all(&data)?;
                stdout.flush()?;
            }

            if args.size.is_none() {
                if let Some((width, height)) = host.poll_resize() {
                    debug!("Host terminal resized to {}x{}", width, height);
                    session.resize(width, height);
                }
            }

            if let Some(status) = exit.status() {
                break status;
            }
        };

        session.close();
        Ok(status)
    }
}
