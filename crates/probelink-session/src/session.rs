use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use probelink_channel::{ChannelEvents, ChannelHandle, ConnectError, Connector};
use probelink_wire::{RawFrameMessage, StatusReply, WireError};
use tracing::{debug, error, info, trace, warn};

use crate::codec::ImageCodec;
use crate::command::SessionCommand;
use crate::config::SessionConfig;
use crate::decode::{DecodeQueue, DecodeStats, DecodeWorker};
use crate::dispatch::{Dispatcher, ObserverId, SessionObserver};
use crate::error::{Result, SessionError};
use crate::machine::{InboundGate, SessionCore, StateHandle};
use crate::state::ConnectionState;

/// Inputs to the control thread.
enum ControlMsg {
    Connect,
    Disconnect,
    BindCompleted {
        epoch: u64,
        result: std::result::Result<Box<dyn ChannelHandle>, ConnectError>,
    },
    Status {
        epoch: u64,
        reply: StatusReply,
    },
    Dropped {
        epoch: u64,
    },
    Shutdown,
}

/// Which channel epoch may currently feed the decode queue (0 = none).
struct FrameGate {
    admitted: Arc<Mutex<u64>>,
    queue: DecodeQueue,
}

impl InboundGate for FrameGate {
    fn open(&self, epoch: u64) {
        *self.admitted.lock().unwrap_or_else(PoisonError::into_inner) = epoch;
    }

    fn close(&self) -> usize {
        let mut admitted = self.admitted.lock().unwrap_or_else(PoisonError::into_inner);
        *admitted = 0;
        self.queue.discard_pending()
    }
}

/// Routes one channel's inbound traffic: replies to the control thread,
/// frames straight to the decode queue.
struct ChannelSink {
    epoch: u64,
    control: mpsc::Sender<ControlMsg>,
    admitted: Arc<Mutex<u64>>,
    queue: DecodeQueue,
}

impl ChannelSink {
    fn admit(&self, submit: impl FnOnce(&DecodeQueue)) {
        let admitted = self.admitted.lock().unwrap_or_else(PoisonError::into_inner);
        if *admitted == self.epoch {
            submit(&self.queue);
        } else {
            trace!(epoch = self.epoch, "frame outside registered session dropped");
        }
    }
}

impl ChannelEvents for ChannelSink {
    fn on_status_reply(&self, reply: StatusReply) {
        let _ = self.control.send(ControlMsg::Status {
            epoch: self.epoch,
            reply,
        });
    }

    fn on_frame(&self, frame: RawFrameMessage) {
        self.admit(|queue| queue.submit(frame));
    }

    fn on_malformed_frame(&self, error: WireError) {
        self.admit(|queue| queue.submit_malformed(error.to_string()));
    }

    fn on_closed(&self) {
        let _ = self.control.send(ControlMsg::Dropped { epoch: self.epoch });
    }
}

/// A running session: control thread, decode thread and dispatcher thread.
///
/// All methods only post work; none of them wait on the device service.
pub struct Session {
    control: mpsc::Sender<ControlMsg>,
    state: StateHandle,
    control_thread: Option<JoinHandle<()>>,
    decoder: DecodeWorker,
    dispatcher: Dispatcher,
}

impl Session {
    pub fn start(
        connector: Arc<dyn Connector>,
        codec: Arc<dyn ImageCodec>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let format = config.image.compression_format;
        if !codec.supports(format) {
            return Err(SessionError::InvalidConfig(format!(
                "the frame codec cannot decode {format} frames"
            )));
        }

        let dispatcher = Dispatcher::spawn(config.decode_queue_capacity)?;
        let decoder = DecodeWorker::spawn(
            codec,
            dispatcher.sink(),
            config.decode_queue_capacity,
            dispatcher.frame_budget(),
        )?;

        let admitted = Arc::new(Mutex::new(0));
        let gate = FrameGate {
            admitted: admitted.clone(),
            queue: decoder.queue(),
        };
        let core = SessionCore::new(config, Box::new(gate), dispatcher.sink());
        let state = core.state_handle();

        let (tx, rx) = mpsc::channel();
        let control_thread = {
            let control = ControlLoop {
                core,
                rx,
                tx: tx.clone(),
                connector,
                admitted,
                queue: decoder.queue(),
            };
            thread::Builder::new()
                .name("probelink-control".into())
                .spawn(move || control.run())
                .map_err(|source| SessionError::Spawn {
                    name: "control",
                    source,
                })?
        };

        debug!("session started");
        Ok(Self {
            control: tx,
            state,
            control_thread: Some(control_thread),
            decoder,
            dispatcher,
        })
    }

    /// Request a connection. A no-op unless the session is unbound.
    pub fn connect(&self) -> Result<()> {
        self.post(ControlMsg::Connect)
    }

    /// Request a graceful disconnect.
    pub fn disconnect(&self) -> Result<()> {
        self.post(ControlMsg::Disconnect)
    }

    /// Apply an external command word such as `"start"` or `"stop"`.
    pub fn handle_command(&self, command: &str) -> Result<SessionCommand> {
        let parsed: SessionCommand = command.parse()?;
        match parsed {
            SessionCommand::StartSession => self.connect()?,
            SessionCommand::StopSession => self.disconnect()?,
        }
        Ok(parsed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<O>(&self, observer: &Arc<O>) -> ObserverId
    where
        O: SessionObserver + 'static,
    {
        self.dispatcher.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    pub fn decode_stats(&self) -> DecodeStats {
        self.decoder.stats()
    }

    /// Disconnect (best effort), then stop every thread. Events produced
    /// before the call are still delivered.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.control_thread.take() else {
            return;
        };
        let _ = self.control.send(ControlMsg::Shutdown);
        if handle.join().is_err() {
            error!("session control thread panicked");
        }
        self.decoder.shutdown();
        self.dispatcher.shutdown();
        info!("session shut down");
    }

    fn post(&self, msg: ControlMsg) -> Result<()> {
        self.control.send(msg).map_err(|_| SessionError::Closed)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ControlLoop {
    core: SessionCore,
    rx: mpsc::Receiver<ControlMsg>,
    tx: mpsc::Sender<ControlMsg>,
    connector: Arc<dyn Connector>,
    admitted: Arc<Mutex<u64>>,
    queue: DecodeQueue,
}

impl ControlLoop {
    fn run(mut self) {
        let mut stopping = false;
        loop {
            let msg = match self.core.deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(wait) {
                        Ok(msg) => Some(msg),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.rx.recv() {
                    Ok(msg) => Some(msg),
                    Err(_) => break,
                },
            };

            match msg {
                None => self.core.poll_timeout(Instant::now()),
                Some(ControlMsg::Connect) if stopping => {
                    debug!("connect ignored, session is shutting down");
                }
                Some(ControlMsg::Connect) => {
                    if let Some(epoch) = self.core.connect_requested() {
                        self.spawn_binder(epoch);
                    }
                }
                Some(ControlMsg::Disconnect) => self.core.disconnect_requested(),
                Some(ControlMsg::BindCompleted { epoch, result }) => {
                    self.core.bind_completed(epoch, result);
                }
                Some(ControlMsg::Status { epoch, reply }) => self.core.status_reply(epoch, reply),
                Some(ControlMsg::Dropped { epoch }) => self.core.channel_dropped(epoch),
                Some(ControlMsg::Shutdown) => {
                    stopping = true;
                    self.core.disconnect_requested();
                }
            }

            if stopping && self.core.state() == ConnectionState::Unbound {
                break;
            }
        }
        self.core.abort();
        debug!("control thread stopped");
    }

    /// Bind on a short-lived thread so the control thread never blocks on
    /// the handshake.
    fn spawn_binder(&mut self, epoch: u64) {
        let events: Arc<dyn ChannelEvents> = Arc::new(ChannelSink {
            epoch,
            control: self.tx.clone(),
            admitted: self.admitted.clone(),
            queue: self.queue.clone(),
        });
        let connector = self.connector.clone();
        let tx = self.tx.clone();

        let spawned = thread::Builder::new()
            .name("probelink-binder".into())
            .spawn(move || {
                let result = connector.connect(events);
                if let Err(mpsc::SendError(ControlMsg::BindCompleted {
                    result: Ok(mut channel),
                    ..
                })) = tx.send(ControlMsg::BindCompleted { epoch, result })
                {
                    channel.disconnect();
                }
            });

        if let Err(err) = spawned {
            warn!(error = %err, "could not spawn binder thread");
            self.core.bind_completed(
                epoch,
                Err(ConnectError::unavailable(format!("binder thread: {err}"))),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use probelink_wire::{CompressionFormat, OutboundMessage};

    use super::*;
    use crate::codec::RawCodec;
    use crate::event::{DecodeFailure, DecodedFrame};
    use crate::testutil::{raw_frame, ScriptedConnector, WAIT};

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Connected(bool),
        Configured(bool),
        Frame(u32, u32),
        DecodeFailed,
        ConnectFailed(ConnectError),
    }

    struct Observer {
        tx: Mutex<mpsc::Sender<Seen>>,
    }

    impl Observer {
        fn new() -> (Arc<Self>, mpsc::Receiver<Seen>) {
            let (tx, rx) = mpsc::channel();
            (Arc::new(Self { tx: Mutex::new(tx) }), rx)
        }

        fn push(&self, seen: Seen) {
            let _ = self.tx.lock().unwrap().send(seen);
        }
    }

    impl SessionObserver for Observer {
        fn on_connection_changed(&self, connected: bool) {
            self.push(Seen::Connected(connected));
        }

        fn on_configuration_changed(&self, success: bool) {
            self.push(Seen::Configured(success));
        }

        fn on_frame(&self, frame: &DecodedFrame) {
            self.push(Seen::Frame(frame.width, frame.height));
        }

        fn on_decode_failed(&self, _failure: &DecodeFailure) {
            self.push(Seen::DecodeFailed);
        }

        fn on_connect_failed(&self, error: &ConnectError) {
            self.push(Seen::ConnectFailed(error.clone()));
        }
    }

    fn start(connector: Arc<ScriptedConnector>, config: SessionConfig) -> Session {
        Session::start(connector, Arc::new(RawCodec), config).unwrap()
    }

    fn expect(rx: &mpsc::Receiver<Seen>, want: Seen) {
        let got = rx.recv_timeout(WAIT).expect("observer event");
        assert_eq!(got, want);
    }

    fn wait_for_state(session: &Session, want: ConnectionState) {
        let deadline = Instant::now() + WAIT;
        while session.state() != want {
            assert!(Instant::now() < deadline, "state stuck at {}", session.state());
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn registered_session_delivers_frames_in_order() {
        let connector = ScriptedConnector::accepting();
        let session = start(connector.clone(), SessionConfig::default());
        let (observer, rx) = Observer::new();
        session.subscribe(&observer);

        session.connect().unwrap();
        expect(&rx, Seen::Connected(true));
        expect(&rx, Seen::Configured(true));

        connector.push_frame(raw_frame(100, 100, 1));
        connector.push_frame(raw_frame(200, 200, 2));
        connector.push_frame(raw_frame(100, 100, 3));

        expect(&rx, Seen::Frame(100, 100));
        expect(&rx, Seen::Frame(200, 200));
        expect(&rx, Seen::Frame(100, 100));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(session.state(), ConnectionState::Registered);
        assert_eq!(session.decode_stats().decoded, 3);
    }

    #[test]
    fn refused_connect_surfaces_once_without_requests() {
        let connector = ScriptedConnector::failing(ConnectError::RefusedConnection {
            reason: "not licensed".into(),
        });
        let session = start(connector.clone(), SessionConfig::default());
        let (observer, rx) = Observer::new();
        session.subscribe(&observer);

        session.connect().unwrap();

        expect(
            &rx,
            Seen::ConnectFailed(ConnectError::RefusedConnection {
                reason: "not licensed".into(),
            }),
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(session.state(), ConnectionState::Unbound);
        assert_eq!(connector.connects(), 1);
        assert!(connector.log().is_none());
    }

    #[test]
    fn silent_unregister_times_out_and_releases_once() {
        let connector = ScriptedConnector::answering(|msg| match msg {
            OutboundMessage::UnregisterClient { .. } => None,
            _ => Some(0),
        });
        let config = SessionConfig {
            unregister_timeout: Duration::from_millis(100),
            ..SessionConfig::default()
        };
        let session = start(connector.clone(), config);
        let (observer, rx) = Observer::new();
        session.subscribe(&observer);

        session.connect().unwrap();
        expect(&rx, Seen::Connected(true));
        expect(&rx, Seen::Configured(true));

        let started = Instant::now();
        session.disconnect().unwrap();
        expect(&rx, Seen::Connected(false));
        assert!(started.elapsed() >= Duration::from_millis(100));

        let log = connector.log().unwrap();
        assert_eq!(log.disconnects(), 1);
        assert_eq!(session.state(), ConnectionState::Unbound);
        assert!(matches!(
            log.sent().last(),
            Some(OutboundMessage::UnregisterClient { .. })
        ));
    }

    #[test]
    fn peer_hangup_ends_session() {
        let connector = ScriptedConnector::accepting();
        let session = start(connector.clone(), SessionConfig::default());
        let (observer, rx) = Observer::new();
        session.subscribe(&observer);

        session.connect().unwrap();
        expect(&rx, Seen::Connected(true));
        expect(&rx, Seen::Configured(true));

        connector.hang_up();
        expect(&rx, Seen::Connected(false));
        wait_for_state(&session, ConnectionState::Unbound);
        assert_eq!(connector.log().unwrap().disconnects(), 1);

        connector.push_frame(raw_frame(1, 1, 9));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn commands_drive_the_session() {
        let connector = ScriptedConnector::accepting();
        let session = start(connector.clone(), SessionConfig::default());
        let (observer, rx) = Observer::new();
        session.subscribe(&observer);

        let err = session.handle_command("reboot").unwrap_err();
        assert!(matches!(err, SessionError::InvalidCommand(_)));

        assert_eq!(
            session.handle_command("start").unwrap(),
            SessionCommand::StartSession
        );
        expect(&rx, Seen::Connected(true));
        expect(&rx, Seen::Configured(true));

        // A second start while registered changes nothing.
        session.handle_command("start").unwrap();
        assert_eq!(
            session.handle_command("stop").unwrap(),
            SessionCommand::StopSession
        );
        expect(&rx, Seen::Connected(false));
        assert_eq!(connector.connects(), 1);
    }

    #[test]
    fn shutdown_unregisters_and_releases() {
        let connector = ScriptedConnector::accepting();
        let mut session = start(connector.clone(), SessionConfig::default());
        let (observer, rx) = Observer::new();
        session.subscribe(&observer);

        session.connect().unwrap();
        expect(&rx, Seen::Connected(true));
        expect(&rx, Seen::Configured(true));

        session.shutdown();

        let log = connector.log().unwrap();
        assert_eq!(log.disconnects(), 1);
        assert!(matches!(
            log.sent().last(),
            Some(OutboundMessage::UnregisterClient { .. })
        ));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Seen::Connected(false));
        assert!(matches!(session.connect(), Err(SessionError::Closed)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SessionConfig {
            decode_queue_capacity: Some(0),
            ..SessionConfig::default()
        };
        let result = Session::start(ScriptedConnector::accepting(), Arc::new(RawCodec), config);
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[test]
    fn requested_format_must_be_decodable() {
        let mut config = SessionConfig::default();
        config.image.compression_format = CompressionFormat::Jpeg;
        let connector = ScriptedConnector::accepting();

        let result = Session::start(connector.clone(), Arc::new(RawCodec), config);
        assert!(
            matches!(&result, Err(SessionError::InvalidConfig(msg)) if msg.contains("jpeg")),
            "{:?}",
            result.err()
        );
        assert_eq!(connector.connects(), 0);
    }

    #[test]
    fn default_config_delivers_every_frame_of_a_burst() {
        let connector = ScriptedConnector::accepting();
        let session = start(connector.clone(), SessionConfig::default());
        let (observer, rx) = Observer::new();
        session.subscribe(&observer);

        session.connect().unwrap();
        expect(&rx, Seen::Connected(true));
        expect(&rx, Seen::Configured(true));

        for ts in 0..40 {
            connector.push_frame(raw_frame(400, 400, ts));
        }
        for _ in 0..40 {
            expect(&rx, Seen::Frame(400, 400));
        }
        let stats = session.decode_stats();
        assert_eq!((stats.decoded, stats.dropped, stats.failed), (40, 0, 0));
    }
}
