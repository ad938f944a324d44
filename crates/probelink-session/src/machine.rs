use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use probelink_channel::{ChannelHandle, ConnectError, SendError};
use probelink_wire::{OutboundMessage, StatusReply};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::correlator::{Correlator, RequestKind};
use crate::event::{EventSink, SessionEvent};
use crate::state::ConnectionState;

/// Admission control for inbound frames.
///
/// Opened for a channel epoch once the session is registered; closed first
/// thing on teardown.
pub trait InboundGate: Send {
    fn open(&self, epoch: u64);

    /// Stop admitting frames and discard anything waiting to be decoded.
    /// Returns how many queued frames were discarded.
    fn close(&self) -> usize;
}

/// Shared, read-only view of the current state.
pub type StateHandle = Arc<Mutex<ConnectionState>>;

/// The connection state machine, free of threads and I/O.
///
/// Every input is applied synchronously. Inputs that carry an epoch belong to
/// one channel generation; inputs from an earlier generation are ignored.
/// Epoch 0 means no channel.
pub struct SessionCore {
    config: SessionConfig,
    state: ConnectionState,
    shared: StateHandle,
    epoch: u64,
    last_epoch: u64,
    correlator: Correlator,
    channel: Option<Box<dyn ChannelHandle>>,
    gate: Box<dyn InboundGate>,
    sink: Arc<dyn EventSink>,
    deadline: Option<Instant>,
    stop_after_bind: bool,
}

impl SessionCore {
    pub fn new(config: SessionConfig, gate: Box<dyn InboundGate>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            state: ConnectionState::Unbound,
            shared: Arc::new(Mutex::new(ConnectionState::Unbound)),
            epoch: 0,
            last_epoch: 0,
            correlator: Correlator::new(),
            channel: None,
            gate,
            sink,
            deadline: None,
            stop_after_bind: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn state_handle(&self) -> StateHandle {
        self.shared.clone()
    }

    /// Current channel generation, or 0 when unbound.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// When the pending unregister gives up, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Start binding. Returns the epoch the caller must attach to the bind
    /// result, or `None` when a session is already underway.
    pub fn connect_requested(&mut self) -> Option<u64> {
        if self.state != ConnectionState::Unbound {
            debug!(state = %self.state, "connect ignored, session already active");
            return None;
        }
        self.last_epoch = self.last_epoch.wrapping_add(1).max(1);
        self.epoch = self.last_epoch;
        self.transition(ConnectionState::Binding);
        Some(self.epoch)
    }

    pub fn bind_completed(
        &mut self,
        epoch: u64,
        result: Result<Box<dyn ChannelHandle>, ConnectError>,
    ) {
        if epoch != self.epoch || self.state != ConnectionState::Binding {
            debug!(epoch, current = self.epoch, "stale bind result");
            if let Ok(mut channel) = result {
                channel.disconnect();
            }
            return;
        }

        let channel = match result {
            Ok(channel) => channel,
            Err(err) => {
                warn!(epoch, error = %err, "connect failed");
                self.teardown(false);
                self.sink.emit(SessionEvent::ConnectFailed(err));
                return;
            }
        };

        self.channel = Some(channel);
        if self.stop_after_bind {
            info!(epoch, "disconnect requested while binding, releasing channel");
            self.teardown(false);
            return;
        }
        if !self.channel.as_ref().is_some_and(|channel| channel.is_open()) {
            warn!(epoch, "channel closed before binding completed");
            self.teardown(false);
            self.sink.emit(SessionEvent::ConnectFailed(ConnectError::unavailable(
                "channel closed during handshake",
            )));
            return;
        }

        self.transition(ConnectionState::Bound);
        if self.send_request(RequestKind::Register) {
            self.transition(ConnectionState::Registering);
        }
    }

    pub fn status_reply(&mut self, epoch: u64, reply: StatusReply) {
        if epoch != self.epoch || self.epoch == 0 {
            debug!(epoch, tag = reply.tag, "status reply from a released channel");
            return;
        }
        let Some(kind) = self.correlator.resolve(reply.tag, reply.status) else {
            debug!(tag = reply.tag, status = reply.status, "ignoring unmatched status reply");
            return;
        };

        match (kind, self.state) {
            (RequestKind::Register, ConnectionState::Registering) => {
                if !reply.is_success() {
                    warn!(status = reply.status, "registration rejected");
                    self.teardown(true);
                    return;
                }
                self.transition(ConnectionState::Registered);
                self.gate.open(self.epoch);
                self.sink.emit(SessionEvent::ConnectionChanged(true));
                self.send_request(RequestKind::Configure);
            }
            (RequestKind::Configure, ConnectionState::Registered) => {
                if !reply.is_success() {
                    warn!(status = reply.status, "image configuration rejected");
                }
                self.sink
                    .emit(SessionEvent::ConfigurationChanged(reply.is_success()));
            }
            (RequestKind::Unregister, ConnectionState::Unregistering) => {
                debug!(status = reply.status, "unregister acknowledged");
                self.teardown(true);
            }
            (kind, state) => {
                debug!(%kind, %state, "reply no longer relevant");
            }
        }
    }

    pub fn disconnect_requested(&mut self) {
        match self.state {
            ConnectionState::Unbound | ConnectionState::Unregistering => {
                debug!(state = %self.state, "disconnect ignored");
            }
            ConnectionState::Binding => self.stop_after_bind = true,
            ConnectionState::Bound | ConnectionState::Registering => self.teardown(true),
            ConnectionState::Registered => {
                self.transition(ConnectionState::Unregistering);
                if self.send_request(RequestKind::Unregister) {
                    self.deadline = Some(Instant::now() + self.config.unregister_timeout);
                }
            }
        }
    }

    pub fn channel_dropped(&mut self, epoch: u64) {
        if epoch != self.epoch || self.state == ConnectionState::Unbound {
            return;
        }
        if self.state == ConnectionState::Binding {
            // The bind result will carry a closed handle.
            return;
        }
        warn!(epoch, state = %self.state, "channel dropped unexpectedly");
        self.teardown(true);
    }

    /// Fire the unregister deadline if it has passed.
    pub fn poll_timeout(&mut self, now: Instant) {
        let Some(deadline) = self.deadline else {
            return;
        };
        if now < deadline || self.state != ConnectionState::Unregistering {
            return;
        }
        warn!(
            timeout_ms = self.config.unregister_timeout.as_millis() as u64,
            "no unregister reply, releasing channel"
        );
        self.teardown(true);
    }

    /// Tear down at once from any state.
    pub fn abort(&mut self) {
        if self.state == ConnectionState::Unbound {
            return;
        }
        let notify = !matches!(self.state, ConnectionState::Binding);
        self.teardown(notify);
    }

    /// Issue and send a request. On failure the session has already been torn
    /// down and `false` is returned.
    fn send_request(&mut self, kind: RequestKind) -> bool {
        let tag = match self.correlator.issue(kind) {
            Ok(tag) => tag,
            Err(err) => {
                error!(error = %err, state = %self.state, "request contract violated");
                self.teardown(true);
                return false;
            }
        };
        let message = match kind {
            RequestKind::Register => OutboundMessage::RegisterClient {
                tag,
                client: self.config.client_name.clone(),
            },
            RequestKind::Configure => OutboundMessage::ConfigureImage {
                tag,
                image: self.config.image,
            },
            RequestKind::Unregister => OutboundMessage::UnregisterClient { tag },
        };

        let result = match self.channel.as_mut() {
            Some(channel) => channel.send(&message),
            None => Err(SendError::ChannelBroken),
        };
        match result {
            Ok(()) => {
                debug!(tag, %kind, epoch = self.epoch, "request sent");
                true
            }
            Err(err) => {
                warn!(tag, %kind, error = %err, "request send failed, treating channel as dropped");
                self.teardown(true);
                false
            }
        }
    }

    /// Return to `Unbound`: close the gate (discarding queued frames), release
    /// the channel, clear pending requests.
    fn teardown(&mut self, notify: bool) {
        let discarded = self.gate.close();
        if let Some(mut channel) = self.channel.take() {
            channel.disconnect();
        }
        let cleared = self.correlator.reset();
        self.deadline = None;
        self.stop_after_bind = false;
        debug!(epoch = self.epoch, discarded, cleared, "session torn down");
        self.epoch = 0;

        self.transition(ConnectionState::Unbound);
        if notify {
            self.sink.emit(SessionEvent::ConnectionChanged(false));
        }
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.state;
        if !from.can_transition_to(to) {
            error!(%from, %to, "illegal state transition");
            return;
        }
        self.state = to;
        *self.shared.lock().unwrap_or_else(PoisonError::into_inner) = to;
        info!(%from, %to, epoch = self.epoch, "session state changed");
        self.sink.emit(SessionEvent::StateChanged { from, to });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::testutil::{ChannelLog, CountingGate, FakeChannel, RecordingSink};
    use ConnectionState::*;

    struct Harness {
        core: SessionCore,
        events: Receiver<SessionEvent>,
        gate: Arc<CountingGate>,
    }

    impl Harness {
        fn new() -> Self {
            let (sink, events) = RecordingSink::new();
            let gate = Arc::new(CountingGate::default());
            let config = SessionConfig {
                unregister_timeout: Duration::from_millis(50),
                ..SessionConfig::default()
            };
            Self {
                core: SessionCore::new(config, Box::new(gate.clone()), sink),
                events,
                gate,
            }
        }

        fn drain(&self) -> Vec<SessionEvent> {
            self.events.try_iter().collect()
        }

        /// Connect and bind a fake channel; the register request is in flight.
        fn bind(&mut self) -> (u64, Arc<ChannelLog>) {
            let epoch = self.core.connect_requested().expect("connect from unbound");
            let (channel, log) = FakeChannel::new();
            self.core.bind_completed(epoch, Ok(Box::new(channel)));
            (epoch, log)
        }

        fn reply_last(&mut self, epoch: u64, log: &ChannelLog, status: i32) {
            let tag = log.last_tag().expect("a request was sent");
            self.core.status_reply(epoch, StatusReply { tag, status });
        }

        fn register(&mut self) -> (u64, Arc<ChannelLog>) {
            let (epoch, log) = self.bind();
            self.reply_last(epoch, &log, 0);
            self.reply_last(epoch, &log, 0);
            assert_eq!(self.core.state(), Registered);
            self.drain();
            (epoch, log)
        }
    }

    fn changed(from: ConnectionState, to: ConnectionState) -> SessionEvent {
        SessionEvent::StateChanged { from, to }
    }

    #[test]
    fn registration_then_configuration() {
        let mut h = Harness::new();
        let (epoch, log) = h.bind();
        assert_eq!(h.core.state(), Registering);
        assert!(matches!(
            &log.sent()[..],
            [OutboundMessage::RegisterClient { client, .. }] if client == "probelink"
        ));

        h.reply_last(epoch, &log, 0);
        assert_eq!(h.core.state(), Registered);
        assert_eq!(h.gate.opened.load(Ordering::SeqCst), epoch);
        let sent = log.sent();
        assert!(matches!(
            sent.last(),
            Some(OutboundMessage::ConfigureImage { image, .. }) if image.width == 400
        ));

        h.reply_last(epoch, &log, 0);
        assert_eq!(
            h.drain(),
            vec![
                changed(Unbound, Binding),
                changed(Binding, Bound),
                changed(Bound, Registering),
                changed(Registering, Registered),
                SessionEvent::ConnectionChanged(true),
                SessionEvent::ConfigurationChanged(true),
            ]
        );
        assert_eq!(h.core.pending_requests(), 0);
    }

    #[test]
    fn configuration_failure_keeps_session_registered() {
        let mut h = Harness::new();
        let (epoch, log) = h.bind();
        h.reply_last(epoch, &log, 0);
        h.reply_last(epoch, &log, 3);

        assert_eq!(h.core.state(), Registered);
        assert_eq!(
            h.drain().last(),
            Some(&SessionEvent::ConfigurationChanged(false))
        );
    }

    #[test]
    fn registration_failure_tears_down() {
        let mut h = Harness::new();
        let (epoch, log) = h.bind();
        h.drain();

        h.reply_last(epoch, &log, 7);

        assert_eq!(h.core.state(), Unbound);
        assert_eq!(log.disconnects(), 1);
        assert_eq!(h.gate.closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.drain(),
            vec![
                changed(Registering, Unbound),
                SessionEvent::ConnectionChanged(false)
            ]
        );
    }

    #[test]
    fn refused_connect_reports_once_and_sends_nothing() {
        let mut h = Harness::new();
        let epoch = h.core.connect_requested().unwrap();
        let refusal = ConnectError::RefusedConnection {
            reason: "license expired".into(),
        };
        h.core.bind_completed(epoch, Err(refusal.clone()));

        assert_eq!(h.core.state(), Unbound);
        assert_eq!(h.core.pending_requests(), 0);
        assert_eq!(
            h.drain(),
            vec![
                changed(Unbound, Binding),
                changed(Binding, Unbound),
                SessionEvent::ConnectFailed(refusal),
            ]
        );
    }

    #[test]
    fn unknown_and_repeated_tags_change_nothing() {
        let mut h = Harness::new();
        let (epoch, log) = h.bind();
        h.drain();

        let register_tag = log.last_tag().unwrap();
        h.core.status_reply(epoch, StatusReply { tag: register_tag + 40, status: 0 });
        assert_eq!(h.core.state(), Registering);
        assert!(h.drain().is_empty());

        h.core.status_reply(epoch, StatusReply { tag: register_tag, status: 0 });
        h.drain();
        h.core.status_reply(epoch, StatusReply { tag: register_tag, status: 1 });
        assert_eq!(h.core.state(), Registered);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn unregister_reply_releases_channel() {
        let mut h = Harness::new();
        let (epoch, log) = h.register();

        h.core.disconnect_requested();
        assert_eq!(h.core.state(), Unregistering);
        assert!(matches!(
            log.sent().last(),
            Some(OutboundMessage::UnregisterClient { .. })
        ));
        h.reply_last(epoch, &log, 0);

        assert_eq!(h.core.state(), Unbound);
        assert_eq!(log.disconnects(), 1);
        assert_eq!(h.core.deadline(), None);
        assert_eq!(
            h.drain(),
            vec![
                changed(Registered, Unregistering),
                changed(Unregistering, Unbound),
                SessionEvent::ConnectionChanged(false),
            ]
        );
    }

    #[test]
    fn unregister_timeout_releases_channel_exactly_once() {
        let mut h = Harness::new();
        let (epoch, log) = h.register();
        let unregister_tag = {
            h.core.disconnect_requested();
            log.last_tag().unwrap()
        };
        let deadline = h.core.deadline().expect("deadline armed");

        h.core.poll_timeout(deadline - Duration::from_millis(1));
        assert_eq!(h.core.state(), Unregistering);

        h.core.poll_timeout(deadline);
        assert_eq!(h.core.state(), Unbound);
        assert_eq!(log.disconnects(), 1);

        // Late reply and a second timeout poll are both no-ops.
        h.core.status_reply(epoch, StatusReply { tag: unregister_tag, status: 0 });
        h.core.poll_timeout(deadline + Duration::from_secs(1));
        h.core.disconnect_requested();
        assert_eq!(log.disconnects(), 1);

        let connection_events: Vec<_> = h
            .drain()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::ConnectionChanged(_)))
            .collect();
        assert_eq!(connection_events, vec![SessionEvent::ConnectionChanged(false)]);
    }

    #[test]
    fn disconnect_while_binding_releases_on_completion() {
        let mut h = Harness::new();
        let epoch = h.core.connect_requested().unwrap();
        h.core.disconnect_requested();
        assert_eq!(h.core.state(), Binding);

        let (channel, log) = FakeChannel::new();
        h.core.bind_completed(epoch, Ok(Box::new(channel)));

        assert_eq!(h.core.state(), Unbound);
        assert_eq!(log.disconnects(), 1);
        assert!(log.sent().is_empty());
        assert_eq!(
            h.drain(),
            vec![changed(Unbound, Binding), changed(Binding, Unbound)]
        );
    }

    #[test]
    fn disconnect_while_registering_tears_down_at_once() {
        let mut h = Harness::new();
        let (_, log) = h.bind();
        h.drain();

        h.core.disconnect_requested();

        assert_eq!(h.core.state(), Unbound);
        assert_eq!(log.disconnects(), 1);
        assert_eq!(h.drain().last(), Some(&SessionEvent::ConnectionChanged(false)));
    }

    #[test]
    fn second_connect_is_a_no_op() {
        let mut h = Harness::new();
        let (epoch, log) = h.register();

        assert_eq!(h.core.connect_requested(), None);
        assert_eq!(h.core.state(), Registered);
        assert_eq!(h.core.epoch(), epoch);
        assert!(h.drain().is_empty());
        assert_eq!(log.sent().len(), 2);
    }

    #[test]
    fn broken_channel_on_send_is_a_drop() {
        let mut h = Harness::new();
        let (_, log) = h.register();
        log.break_link();

        h.core.disconnect_requested();

        assert_eq!(h.core.state(), Unbound);
        assert_eq!(log.disconnects(), 1);
        assert_eq!(h.drain().last(), Some(&SessionEvent::ConnectionChanged(false)));
    }

    #[test]
    fn drop_from_previous_channel_is_ignored() {
        let mut h = Harness::new();
        let (first, first_log) = h.register();
        h.core.disconnect_requested();
        h.reply_last(first, &first_log, 0);
        let (second, second_log) = h.register();
        assert_ne!(first, second);

        h.core.channel_dropped(first);
        assert_eq!(h.core.state(), Registered);

        h.core.channel_dropped(second);
        assert_eq!(h.core.state(), Unbound);
        assert_eq!(second_log.disconnects(), 1);
        assert_eq!(
            h.drain(),
            vec![
                changed(Registered, Unbound),
                SessionEvent::ConnectionChanged(false)
            ]
        );
    }

    #[test]
    fn closed_handle_at_bind_is_a_connect_failure() {
        let mut h = Harness::new();
        let epoch = h.core.connect_requested().unwrap();
        let (channel, log) = FakeChannel::new();
        log.break_link();

        h.core.bind_completed(epoch, Ok(Box::new(channel)));

        assert_eq!(h.core.state(), Unbound);
        assert_eq!(log.disconnects(), 1);
        assert!(matches!(
            h.drain().last(),
            Some(SessionEvent::ConnectFailed(ConnectError::Unavailable { .. }))
        ));
    }

    #[test]
    fn stale_bind_result_is_released() {
        let mut h = Harness::new();
        let first = h.core.connect_requested().unwrap();
        h.core
            .bind_completed(first, Err(ConnectError::unavailable("no socket")));
        let second = h.core.connect_requested().unwrap();

        let (channel, log) = FakeChannel::new();
        h.core.bind_completed(first, Ok(Box::new(channel)));

        assert_eq!(log.disconnects(), 1);
        assert_eq!(h.core.state(), Binding);
        assert_eq!(h.core.epoch(), second);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect,
        Disconnect,
        BindOk,
        BindClosed,
        BindRefused,
        ReplyOk,
        ReplyFail,
        UnknownReply,
        Drop,
        Timeout,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Connect),
            Just(Op::Disconnect),
            Just(Op::BindOk),
            Just(Op::BindClosed),
            Just(Op::BindRefused),
            Just(Op::ReplyOk),
            Just(Op::ReplyFail),
            Just(Op::UnknownReply),
            Just(Op::Drop),
            Just(Op::Timeout),
        ]
    }

    proptest! {
        #[test]
        fn transitions_follow_lifecycle_and_channels_release_once(
            ops in proptest::collection::vec(op(), 1..80)
        ) {
            let mut h = Harness::new();
            let mut binding: Option<u64> = None;
            let mut channels: Vec<Arc<ChannelLog>> = Vec::new();
            let mut last = Unbound;

            for op in ops {
                match op {
                    Op::Connect => {
                        if let Some(epoch) = h.core.connect_requested() {
                            binding = Some(epoch);
                        }
                    }
                    Op::Disconnect => h.core.disconnect_requested(),
                    Op::BindOk | Op::BindClosed => {
                        if let Some(epoch) = binding.take() {
                            let (channel, log) = FakeChannel::new();
                            if matches!(op, Op::BindClosed) {
                                log.break_link();
                            }
                            channels.push(log);
                            h.core.bind_completed(epoch, Ok(Box::new(channel)));
                        }
                    }
                    Op::BindRefused => {
                        if let Some(epoch) = binding.take() {
                            h.core.bind_completed(
                                epoch,
                                Err(ConnectError::RefusedConnection { reason: "no".into() }),
                            );
                        }
                    }
                    Op::ReplyOk | Op::ReplyFail => {
                        let status = if matches!(op, Op::ReplyOk) { 0 } else { 1 };
                        if let Some(tag) = channels.last().and_then(|log| log.last_tag()) {
                            let epoch = h.core.epoch();
                            h.core.status_reply(epoch, StatusReply { tag, status });
                        }
                    }
                    Op::UnknownReply => {
                        let before = h.core.state();
                        let epoch = h.core.epoch();
                        h.core.status_reply(epoch, StatusReply { tag: 0xDEAD_BEEF, status: 0 });
                        prop_assert_eq!(h.core.state(), before);
                        prop_assert!(h.events.try_recv().is_err());
                    }
                    Op::Drop => {
                        let epoch = h.core.epoch();
                        h.core.channel_dropped(epoch);
                    }
                    Op::Timeout => h.core.poll_timeout(Instant::now() + Duration::from_secs(3600)),
                }

                for event in h.drain() {
                    if let SessionEvent::StateChanged { from, to } = event {
                        prop_assert_eq!(from, last);
                        prop_assert!(from.can_transition_to(to), "{} -> {}", from, to);
                        last = to;
                    }
                }
                prop_assert_eq!(last, h.core.state());
                for log in &channels {
                    prop_assert!(log.disconnects() <= 1);
                }
                if h.core.state() == Unbound {
                    for log in &channels {
                        prop_assert_eq!(log.disconnects(), 1);
                    }
                }
            }
        }
    }
}
