use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use probelink_wire::CompressionFormat;

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod command;
pub mod serve;
pub mod stream;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to a device service and print decoded frames.
    Stream(StreamArgs),
    /// Run a simulated device service.
    Serve(ServeArgs),
    /// Validate a session command word.
    Command(CommandArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Stream(args) => stream::run(args, format),
        Command::Serve(args) => serve::run(args, format),
        Command::Command(args) => command::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct StreamArgs {
    /// Device service socket path.
    pub path: PathBuf,
    /// Stop after N decoded frames.
    #[arg(long)]
    pub count: Option<usize>,
    /// Give up after this long (e.g. 10s, 500ms).
    #[arg(long)]
    pub timeout: Option<String>,
    /// Requested frame width.
    #[arg(long)]
    pub width: Option<u32>,
    /// Requested frame height.
    #[arg(long)]
    pub height: Option<u32>,
    /// Requested compression (raw, jpeg, png).
    #[arg(long)]
    pub compression: Option<CompressionFormat>,
    /// Requested compression quality (0-100).
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub quality: Option<u8>,
    /// Client name announced on registration.
    #[arg(long)]
    pub client_name: Option<String>,
    /// TOML settings file.
    #[arg(long, value_name = "FILE", env = "PROBELINK_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Decline every client with this reason.
    #[arg(long, value_name = "REASON")]
    pub refuse: Option<String>,
    /// Frames to push per client after configuration (default: until unregistered).
    #[arg(long)]
    pub frames: Option<usize>,
    /// Delay between frames (e.g. 50ms, 1s).
    #[arg(long, default_value = "50ms")]
    pub interval: String,
    /// Replace every Kth frame with an unreadable one.
    #[arg(long, value_name = "K")]
    pub corrupt_every: Option<usize>,
    /// Frame width (default: the size the client asked for).
    #[arg(long)]
    pub width: Option<u32>,
    /// Frame height (default: the size the client asked for).
    #[arg(long)]
    pub height: Option<u32>,
    /// Status code returned for registration requests.
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub register_status: i32,
    /// Leave unregister requests unanswered.
    #[arg(long)]
    pub ignore_unregister: bool,
    /// Exit after the first client.
    #[arg(long)]
    pub once: bool,
}

#[derive(Args, Debug)]
pub struct CommandArgs {
    /// Command word, e.g. start or stop.
    pub word: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
