use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use probelink_wire::{
    channel_name, Frame, FrameConfig, FrameReader, FrameWriter, InboundMessage, OutboundMessage,
    DATA,
};
use tracing::{debug, info, trace, warn};

use crate::adapter::{ChannelEvents, ChannelHandle, Connector};
use crate::config::ChannelConfig;
use crate::error::{ConnectError, SendError, TransportError};
use crate::handshake::await_service_ready;
use crate::stream::IpcStream;
use crate::uds::UnixDomainSocket;

/// Binds [`UdsChannel`]s to the service socket named in a [`ChannelConfig`].
#[derive(Debug, Clone, Default)]
pub struct UdsConnector {
    config: ChannelConfig,
}

impl UdsConnector {
    pub fn new(config: ChannelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

impl Connector for UdsConnector {
    fn connect(
        &self,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Box<dyn ChannelHandle>, ConnectError> {
        UdsChannel::open(&self.config, events).map(|channel| Box::new(channel) as _)
    }
}

/// Link flags shared between the handle and its I/O threads.
#[derive(Default)]
struct LinkState {
    /// Set by a local `disconnect`.
    released: AtomicBool,
    /// Set once the peer is known to be gone.
    dropped: AtomicBool,
}

impl LinkState {
    fn is_open(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && !self.dropped.load(Ordering::SeqCst)
    }

    /// Report a peer-side drop at most once, and never after a local release.
    fn report_drop(&self, events: &dyn ChannelEvents) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        if !self.dropped.swap(true, Ordering::SeqCst) {
            info!("device service dropped the channel");
            events.on_closed();
        }
    }
}

/// Channel over a Unix domain socket.
///
/// A reader thread parses inbound frames and hands them to [`ChannelEvents`];
/// a writer thread drains the outbound queue so `send` never waits on the
/// socket.
pub struct UdsChannel {
    stream: IpcStream,
    outbound: Option<mpsc::Sender<Frame>>,
    link: Arc<LinkState>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl UdsChannel {
    /// Connect, complete the handshake and start the I/O threads.
    pub fn open(
        config: &ChannelConfig,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Self, ConnectError> {
        let io_err = |err: TransportError| ConnectError::unavailable(err.to_string());
        let stream = UnixDomainSocket::connect(&config.socket_path).map_err(io_err)?;

        let frame_config = FrameConfig {
            max_payload_size: config.max_payload_size,
        };
        stream
            .set_read_timeout(Some(config.handshake_timeout))
            .map_err(io_err)?;
        let mut reader =
            FrameReader::with_config(stream.try_clone().map_err(io_err)?, frame_config.clone());

        await_service_ready(&mut reader)?;
        reader.get_ref().set_read_timeout(None).map_err(io_err)?;

        let writer = FrameWriter::with_config(stream.try_clone().map_err(io_err)?, frame_config);
        let link = Arc::new(LinkState::default());
        let (tx, rx) = mpsc::channel();

        let writer_handle = {
            let link = link.clone();
            let events = events.clone();
            thread::Builder::new()
                .name("probelink-chan-writer".into())
                .spawn(move || write_loop(writer, rx, &link, events.as_ref()))
                .map_err(|err| ConnectError::unavailable(err.to_string()))?
        };
        let reader_handle = {
            let link = link.clone();
            thread::Builder::new()
                .name("probelink-chan-reader".into())
                .spawn(move || read_loop(reader, &link, events.as_ref()))
                .map_err(|err| ConnectError::unavailable(err.to_string()))?
        };

        info!(path = ?config.socket_path, "channel bound");

        Ok(Self {
            stream,
            outbound: Some(tx),
            link,
            reader: Some(reader_handle),
            writer: Some(writer_handle),
        })
    }
}

impl ChannelHandle for UdsChannel {
    fn send(&mut self, message: &OutboundMessage) -> Result<(), SendError> {
        if !self.link.is_open() {
            return Err(SendError::ChannelBroken);
        }
        let frame = message
            .to_frame()
            .map_err(|err| SendError::Encoding(err.to_string()))?;
        let outbound = self.outbound.as_ref().ok_or(SendError::ChannelBroken)?;
        outbound.send(frame).map_err(|_| SendError::ChannelBroken)?;
        debug!(tag = message.tag(), "request queued");
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.link.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound = None;
        if let Err(err) = self.stream.shutdown() {
            debug!(error = %err, "socket shutdown failed");
        }
        for handle in [self.writer.take(), self.reader.take()].into_iter().flatten() {
            let _ = handle.join();
        }
        info!("channel released");
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }
}

impl Drop for UdsChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn write_loop(
    mut writer: FrameWriter<IpcStream>,
    rx: mpsc::Receiver<Frame>,
    link: &LinkState,
    events: &dyn ChannelEvents,
) {
    for frame in rx {
        if let Err(err) = writer.write_frame(&frame) {
            warn!(error = %err, "write to device service failed");
            link.report_drop(events);
            return;
        }
        trace!(
            channel = channel_name(frame.channel),
            bytes = frame.wire_size(),
            "frame written"
        );
    }
}

fn read_loop(mut reader: FrameReader<IpcStream>, link: &LinkState, events: &dyn ChannelEvents) {
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(err) => {
                if !link.released.load(Ordering::SeqCst) {
                    debug!(error = %err, "channel read ended");
                }
                link.report_drop(events);
                return;
            }
        };

        let channel = frame.channel;
        match InboundMessage::from_frame(frame) {
            Ok(InboundMessage::Status(reply)) => events.on_status_reply(reply),
            Ok(InboundMessage::Frame(raw)) => events.on_frame(raw),
            Ok(InboundMessage::Control(other)) => {
                debug!(message = ?other, "ignoring unsolicited control message");
            }
            Err(err) if channel == DATA => events.on_malformed_frame(err),
            Err(err) => {
                warn!(
                    channel = channel_name(channel),
                    error = %err,
                    "dropping unreadable message"
                );
            }
        }
    }
}
