use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use probelink_channel::{ConnectError, UdsConnector};
use probelink_session::{
    DecodeFailure, DecodedFrame, RawCodec, Session, SessionConfig, SessionObserver,
};
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, parse_duration, StreamArgs};
use crate::config::CliConfig;
use crate::exit::{connect_error, session_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_frame, print_stats, OutputFormat};

const POLL: Duration = Duration::from_millis(100);

enum Update {
    Connected(bool),
    Configured(bool),
    Frame(DecodedFrame),
    ConnectFailed(ConnectError),
}

/// Forwards session callbacks to the command's main thread.
struct Forwarder {
    tx: Mutex<mpsc::Sender<Update>>,
}

impl Forwarder {
    fn send(&self, update: Update) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(update);
        }
    }
}

impl SessionObserver for Forwarder {
    fn on_connection_changed(&self, connected: bool) {
        self.send(Update::Connected(connected));
    }

    fn on_configuration_changed(&self, success: bool) {
        self.send(Update::Configured(success));
    }

    fn on_frame(&self, frame: &DecodedFrame) {
        self.send(Update::Frame(frame.clone()));
    }

    fn on_decode_failed(&self, failure: &DecodeFailure) {
        warn!(ts = ?failure.timestamp_nanos, reason = %failure.reason, "frame dropped");
    }

    fn on_connect_failed(&self, error: &ConnectError) {
        self.send(Update::ConnectFailed(error.clone()));
    }
}

pub fn run(args: StreamArgs, format: OutputFormat) -> CliResult<i32> {
    let mut config = CliConfig::load(args.config.as_deref())?;
    config.channel.socket_path = args.path.clone();
    apply_overrides(&args, &mut config.session);
    let timeout = args.timeout.as_deref().map(parse_duration).transpose()?;
    let unregister_timeout = config.session.unregister_timeout;

    let connector = Arc::new(UdsConnector::new(config.channel));
    let mut session = Session::start(connector, Arc::new(RawCodec), config.session)
        .map_err(|err| session_error("session start failed", err))?;

    let (tx, rx) = mpsc::channel();
    let forwarder = Arc::new(Forwarder { tx: Mutex::new(tx) });
    session.subscribe(&forwarder);

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    session
        .connect()
        .map_err(|err| session_error("connect failed", err))?;

    let started = Instant::now();
    let mut printed = 0usize;
    let mut registered = false;
    let mut ended = false;

    let outcome = loop {
        if !running.load(Ordering::SeqCst) {
            info!("interrupted");
            break Ok(SUCCESS);
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                break Err(CliError::new(
                    TIMEOUT,
                    format!("stream timed out after {limit:?} ({printed} frames)"),
                ));
            }
        }

        let update = match rx.recv_timeout(POLL) {
            Ok(update) => update,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                break Err(CliError::new(FAILURE, "session stopped unexpectedly"))
            }
        };

        match update {
            Update::ConnectFailed(err) => break Err(connect_error("connect failed", &err)),
            Update::Connected(true) => {
                registered = true;
                info!(socket = %args.path.display(), "registered with device service");
            }
            Update::Connected(false) => {
                ended = true;
                break Err(CliError::new(
                    FAILURE,
                    if registered {
                        "device service ended the session"
                    } else {
                        "device service rejected registration"
                    },
                ));
            }
            Update::Configured(true) => {}
            Update::Configured(false) => {
                break Err(CliError::new(
                    FAILURE,
                    "device service rejected the image configuration",
                ));
            }
            Update::Frame(frame) => {
                printed = printed.saturating_add(1);
                print_frame(printed, &frame, format);
                if args.count.is_some_and(|count| printed >= count) {
                    break Ok(SUCCESS);
                }
            }
        }
    };

    if registered && !ended {
        stop_gracefully(&session, &rx, unregister_timeout);
    }
    session.shutdown();
    if outcome.is_ok() {
        print_stats(printed, session.decode_stats(), format);
    }
    outcome
}

/// Ask for an unregister and wait for the session to report the end.
fn stop_gracefully(session: &Session, rx: &mpsc::Receiver<Update>, grace: Duration) {
    if session.disconnect().is_err() {
        return;
    }
    let deadline = Instant::now() + grace + Duration::from_secs(1);
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(Update::Connected(false)) => return,
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}

fn apply_overrides(args: &StreamArgs, session: &mut SessionConfig) {
    if let Some(width) = args.width {
        session.image.width = width;
    }
    if let Some(height) = args.height {
        session.image.height = height;
    }
    if let Some(format) = args.compression {
        session.image.compression_format = format;
    }
    if let Some(quality) = args.quality {
        session.image.compression_quality = quality;
    }
    if let Some(name) = &args.client_name {
        session.client_name = name.clone();
    }
}
