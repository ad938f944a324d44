//! Fakes shared by the unit tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use probelink_channel::{ChannelEvents, ChannelHandle, ConnectError, Connector, SendError};
use probelink_wire::{CompressionFormat, OutboundMessage, RawFrameMessage, StatusReply};

use crate::event::{EventSink, SessionEvent};
use crate::machine::InboundGate;

pub const WAIT: Duration = Duration::from_secs(5);

/// Collects emitted events on an mpsc receiver.
pub struct RecordingSink {
    tx: mpsc::Sender<SessionEvent>,
}

impl RecordingSink {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

pub fn raw_frame(width: u32, height: u32, ts: i64) -> RawFrameMessage {
    RawFrameMessage {
        width,
        height,
        timestamp_nanos: ts,
        compression_format: CompressionFormat::Raw,
        payload: Bytes::from(vec![0u8; (width * height * 4) as usize]),
    }
}

/// What a fake channel saw.
#[derive(Debug, Default)]
pub struct ChannelLog {
    sent: Mutex<Vec<OutboundMessage>>,
    disconnects: AtomicUsize,
    broken: std::sync::atomic::AtomicBool,
}

impl ChannelLog {
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_tag(&self) -> Option<u32> {
        self.sent.lock().unwrap().last().map(OutboundMessage::tag)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn break_link(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

type Responder = dyn Fn(&OutboundMessage) -> Option<i32> + Send + Sync;

/// In-memory channel that records traffic and optionally answers requests.
pub struct FakeChannel {
    log: Arc<ChannelLog>,
    reply: Option<(Arc<dyn ChannelEvents>, Arc<Responder>)>,
}

impl FakeChannel {
    pub fn new() -> (Self, Arc<ChannelLog>) {
        let log = Arc::new(ChannelLog::default());
        (
            Self {
                log: log.clone(),
                reply: None,
            },
            log,
        )
    }
}

impl ChannelHandle for FakeChannel {
    fn send(&mut self, message: &OutboundMessage) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::ChannelBroken);
        }
        self.log.sent.lock().unwrap().push(message.clone());
        if let Some((events, responder)) = &self.reply {
            if let Some(status) = responder(message) {
                events.on_status_reply(StatusReply {
                    tag: message.tag(),
                    status,
                });
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.log.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.log.disconnects() == 0 && !self.log.broken.load(Ordering::SeqCst)
    }
}

/// Gate that only counts calls.
#[derive(Default)]
pub struct CountingGate {
    pub opened: AtomicU64,
    pub closes: AtomicUsize,
}

impl InboundGate for Arc<CountingGate> {
    fn open(&self, epoch: u64) {
        self.opened.store(epoch, Ordering::SeqCst);
    }

    fn close(&self) -> usize {
        self.opened.store(0, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        0
    }
}

/// Connector returning fake channels wired to answer through `responder`.
pub struct ScriptedConnector {
    refuse: Option<ConnectError>,
    responder: Arc<Responder>,
    live: Mutex<Option<(Arc<dyn ChannelEvents>, Arc<ChannelLog>)>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn answering(
        responder: impl Fn(&OutboundMessage) -> Option<i32> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            refuse: None,
            responder: Arc::new(responder),
            live: Mutex::new(None),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::answering(|_| Some(0))
    }

    pub fn failing(error: ConnectError) -> Arc<Self> {
        Arc::new(Self {
            refuse: Some(error),
            responder: Arc::new(|_| None),
            live: Mutex::new(None),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Option<Arc<ChannelLog>> {
        self.live.lock().unwrap().as_ref().map(|(_, log)| log.clone())
    }

    /// Push a frame as if the service sent it.
    pub fn push_frame(&self, frame: RawFrameMessage) {
        if let Some((events, _)) = self.live.lock().unwrap().as_ref() {
            events.on_frame(frame);
        }
    }

    /// Simulate the service hanging up.
    pub fn hang_up(&self) {
        if let Some((events, log)) = self.live.lock().unwrap().as_ref() {
            log.break_link();
            events.on_closed();
        }
    }
}

impl Connector for ScriptedConnector {
    fn connect(
        &self,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Box<dyn ChannelHandle>, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.refuse {
            return Err(err.clone());
        }
        let (mut channel, log) = FakeChannel::new();
        channel.reply = Some((events.clone(), self.responder.clone()));
        *self.live.lock().unwrap() = Some((events, log));
        Ok(Box::new(channel))
    }
}
