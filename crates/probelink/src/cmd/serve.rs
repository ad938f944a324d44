use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use probelink_channel::{
    FrameSender, ServiceEndpoint, ServiceError, ServiceListener, TransportError,
};
use probelink_wire::{
    CompressionFormat, ControlMessage, Frame, ImageConfig, RawFrameMessage, WireError, DATA,
    STATUS_SUCCESS,
};
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, parse_duration, ServeArgs};
use crate::exit::{service_error, CliResult, SUCCESS};
use crate::output::{print_client_summary, ClientSummary, OutputFormat};

/// Status returned for a configure request the simulator cannot honour.
const STATUS_UNSUPPORTED_FORMAT: i32 = -2;

/// How the simulator pushes frames once a client is configured.
#[derive(Debug, Clone)]
struct FramePlan {
    frames: Option<usize>,
    interval: Duration,
    corrupt_every: Option<usize>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Default)]
struct PushCounters {
    frames: AtomicUsize,
    corrupt: AtomicUsize,
}

/// Frame pusher thread for one configured client.
struct Pusher {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Pusher {
    fn halt(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let plan = FramePlan {
        frames: args.frames,
        interval: parse_duration(&args.interval)?,
        corrupt_every: args.corrupt_every.filter(|k| *k > 0),
        width: args.width,
        height: args.height,
    };

    let listener =
        ServiceListener::bind(&args.path).map_err(|err| service_error("bind failed", err))?;
    info!(path = %listener.path().display(), "device service simulator listening");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        if let Some(reason) = &args.refuse {
            listener
                .refuse(reason)
                .map_err(|err| service_error("refuse failed", err))?;
        } else {
            let endpoint = listener
                .accept()
                .map_err(|err| service_error("accept failed", err))?;
            let summary = serve_client(endpoint, &plan, &args, &running)?;
            print_client_summary(&summary, format);
        }

        if args.once {
            break;
        }
    }

    Ok(SUCCESS)
}

fn serve_client(
    mut endpoint: ServiceEndpoint,
    plan: &FramePlan,
    args: &ServeArgs,
    running: &AtomicBool,
) -> CliResult<ClientSummary> {
    let counters = Arc::new(PushCounters::default());
    let mut summary = ClientSummary {
        client: String::from("?"),
        requests: 0,
        frames_sent: 0,
        corrupt_sent: 0,
    };
    let mut pusher: Option<Pusher> = None;

    endpoint
        .set_read_timeout(Some(Duration::from_millis(200)))
        .map_err(|err| service_error("socket setup failed", err))?;

    while running.load(Ordering::SeqCst) {
        let request = match endpoint.recv_request() {
            Ok(request) => request,
            Err(ServiceError::Disconnected) => break,
            Err(err) if is_timeout(&err) => continue,
            Err(err) => {
                warn!(error = %err, "client connection failed");
                break;
            }
        };
        summary.requests += 1;

        let reply = match request {
            ControlMessage::RegisterClient { tag, client } => {
                info!(%client, tag, status = args.register_status, "register");
                summary.client = client;
                Some((tag, args.register_status))
            }
            ControlMessage::ConfigureImage { tag, image } => {
                info!(
                    width = image.width,
                    height = image.height,
                    format = %image.compression_format,
                    tag,
                    "configure"
                );
                if let Some(previous) = pusher.take() {
                    previous.halt();
                }
                let status = configure_status(&image);
                if status == STATUS_SUCCESS {
                    let sender = endpoint
                        .frame_sender()
                        .map_err(|err| service_error("frame sender failed", err))?;
                    pusher = Some(spawn_pusher(sender, plan.clone(), image, counters.clone()));
                } else {
                    warn!(format = %image.compression_format, "only raw frames can be produced");
                }
                Some((tag, status))
            }
            ControlMessage::UnregisterClient { tag } => {
                info!(tag, "unregister");
                if let Some(previous) = pusher.take() {
                    previous.halt();
                }
                (!args.ignore_unregister).then_some((tag, 0))
            }
            other => {
                debug!(message = ?other, "ignoring unexpected control message");
                None
            }
        };

        if let Some((tag, status)) = reply {
            if let Err(err) = endpoint.reply(tag, status) {
                warn!(error = %err, "reply failed");
                break;
            }
        }
    }

    if let Some(pusher) = pusher.take() {
        pusher.halt();
    }
    summary.frames_sent = counters.frames.load(Ordering::SeqCst);
    summary.corrupt_sent = counters.corrupt.load(Ordering::SeqCst);
    info!(client = %summary.client, frames = summary.frames_sent, "client finished");
    Ok(summary)
}

fn spawn_pusher(
    mut sender: FrameSender,
    plan: FramePlan,
    image: ImageConfig,
    counters: Arc<PushCounters>,
) -> Pusher {
    let stop = Arc::new(AtomicBool::new(false));
    let handle = {
        let stop = stop.clone();
        thread::spawn(move || {
            let width = plan.width.unwrap_or(image.width);
            let height = plan.height.unwrap_or(image.height);
            let mut seq = 0usize;

            while !stop.load(Ordering::SeqCst) && plan.frames.is_none_or(|n| seq < n) {
                seq += 1;
                let corrupt = plan.corrupt_every.is_some_and(|k| seq % k == 0);
                let result = if corrupt {
                    sender.send_raw(&Frame::new(DATA, Bytes::from_static(b"\x01\x02\x03")))
                } else {
                    sender.send_frame(&test_pattern(width, height, seq))
                };
                if let Err(err) = result {
                    debug!(error = %err, "frame push stopped");
                    return;
                }
                if corrupt {
                    counters.corrupt.fetch_add(1, Ordering::SeqCst);
                } else {
                    counters.frames.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(plan.interval);
            }
        })
    };
    Pusher { stop, handle }
}

/// The simulator has no encoder, so only uncompressed frames are served.
fn configure_status(image: &ImageConfig) -> i32 {
    match image.compression_format {
        CompressionFormat::Raw => STATUS_SUCCESS,
        CompressionFormat::Jpeg | CompressionFormat::Png => STATUS_UNSUPPORTED_FORMAT,
    }
}

/// Uncompressed RGBA frame whose red channel walks with `seq`.
fn test_pattern(width: u32, height: u32, seq: usize) -> RawFrameMessage {
    let pixels = width as usize * height as usize;
    let mut data = Vec::with_capacity(pixels * 4);
    for i in 0..pixels {
        data.extend_from_slice(&[(i + seq) as u8, (i / width.max(1) as usize) as u8, 0x80, 0xFF]);
    }
    RawFrameMessage {
        width,
        height,
        timestamp_nanos: now_nanos(),
        compression_format: CompressionFormat::Raw,
        payload: Bytes::from(data),
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn is_timeout(err: &ServiceError) -> bool {
    let io = match err {
        ServiceError::Wire(WireError::Io(io)) => io,
        ServiceError::Transport(TransportError::Io(io)) => io,
        _ => return false,
    };
    matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
