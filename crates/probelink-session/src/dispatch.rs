use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use async_channel::{Receiver, Sender};
use probelink_channel::ConnectError;
use tracing::{debug, error, trace};

use crate::error::{Result, SessionError};
use crate::event::{DecodeFailure, DecodedFrame, EventSink, SessionEvent};
use crate::state::ConnectionState;

/// Application callbacks. Every method defaults to doing nothing.
///
/// All callbacks run on the dispatcher thread, one at a time, so observers
/// need no locking of their own.
pub trait SessionObserver: Send + Sync {
    fn on_connection_changed(&self, _connected: bool) {}

    fn on_configuration_changed(&self, _success: bool) {}

    fn on_frame(&self, _frame: &DecodedFrame) {}

    fn on_decode_failed(&self, _failure: &DecodeFailure) {}

    fn on_connect_failed(&self, _error: &ConnectError) {}

    fn on_state_changed(&self, _from: ConnectionState, _to: ConnectionState) {}
}

/// Handle returned by [`Dispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct Registry {
    entries: Mutex<Vec<(ObserverId, Weak<dyn SessionObserver>)>>,
    next_id: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, Vec<(ObserverId, Weak<dyn SessionObserver>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upgrade live observers and forget the dead ones.
    fn live(&self) -> Vec<Arc<dyn SessionObserver>> {
        let mut entries = self.lock();
        let mut live = Vec::with_capacity(entries.len());
        entries.retain(|(id, weak)| match weak.upgrade() {
            Some(observer) => {
                live.push(observer);
                true
            }
            None => {
                debug!(?id, "pruning dropped observer");
                false
            }
        });
        live
    }
}

/// Caps how many decoded frames may wait for delivery at once.
///
/// The decode thread takes a slot before emitting a frame and the dispatcher
/// gives it back once every observer has seen that frame, so a slow observer
/// stalls decoding instead of piling up pixel buffers.
#[derive(Clone)]
pub struct FrameBudget {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl FrameBudget {
    pub fn new(frames: usize) -> Self {
        let (tx, rx) = async_channel::bounded(frames.max(1));
        Self { tx, rx }
    }

    /// Block until a slot is free. `false` once the dispatcher has stopped;
    /// the caller may then emit without a slot.
    pub fn acquire(&self) -> bool {
        self.tx.send_blocking(()).is_ok()
    }

    pub fn release(&self) {
        let _ = self.rx.try_recv();
    }

    /// Frames currently holding a slot.
    pub fn in_use(&self) -> usize {
        self.tx.len()
    }

    fn close(&self) {
        self.tx.close();
    }
}

/// Event sink feeding the dispatcher thread.
struct QueueSink {
    tx: Sender<SessionEvent>,
}

impl EventSink for QueueSink {
    fn emit(&self, event: SessionEvent) {
        if self.tx.try_send(event).is_err() {
            trace!("dispatcher stopped, event dropped");
        }
    }
}

/// Delivers [`SessionEvent`]s to observers on a single callback thread.
///
/// Observers are held weakly: the dispatcher never keeps one alive, and a
/// dropped observer is pruned on the next delivery.
///
/// Non-frame events are never held back. Frame events are limited by the
/// optional [`FrameBudget`].
pub struct Dispatcher {
    sink: Arc<QueueSink>,
    registry: Arc<Registry>,
    budget: Option<FrameBudget>,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn(frame_capacity: Option<usize>) -> Result<Self> {
        let (tx, rx) = async_channel::unbounded();
        let registry = Arc::new(Registry::default());
        let budget = frame_capacity.map(FrameBudget::new);

        let handle = {
            let registry = registry.clone();
            let budget = budget.clone();
            thread::Builder::new()
                .name("probelink-dispatch".into())
                .spawn(move || run(rx, &registry, budget.as_ref()))
                .map_err(|source| SessionError::Spawn {
                    name: "dispatch",
                    source,
                })?
        };

        Ok(Self {
            sink: Arc::new(QueueSink { tx }),
            registry,
            budget,
            handle: Some(handle),
        })
    }

    /// Producer handle for the control and decode threads.
    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }

    /// Slots the decode thread must take before emitting a frame, if frames
    /// are capped.
    pub fn frame_budget(&self) -> Option<FrameBudget> {
        self.budget.clone()
    }

    /// Register `observer`. Registering the same observer again returns its
    /// existing id.
    pub fn subscribe<O>(&self, observer: &Arc<O>) -> ObserverId
    where
        O: SessionObserver + 'static,
    {
        let target = Arc::as_ptr(observer) as *const ();
        let mut entries = self.registry.lock();
        entries.retain(|(_, weak)| weak.strong_count() > 0);

        if let Some((id, _)) = entries
            .iter()
            .find(|(_, weak)| Weak::as_ptr(weak) as *const () == target)
        {
            return *id;
        }

        let id = ObserverId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        let weak: Weak<dyn SessionObserver> = Arc::<O>::downgrade(observer);
        entries.push((id, weak));
        debug!(?id, observers = entries.len(), "observer registered");
        id
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut entries = self.registry.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        before != entries.len()
    }

    pub fn observer_count(&self) -> usize {
        self.registry
            .lock()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    /// Deliver everything already queued, stop the thread and forget all
    /// observers.
    pub fn shutdown(&mut self) {
        self.sink.tx.close();
        if let Some(budget) = &self.budget {
            budget.close();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
        self.registry.lock().clear();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(rx: Receiver<SessionEvent>, registry: &Registry, budget: Option<&FrameBudget>) {
    while let Ok(event) = rx.recv_blocking() {
        for observer in registry.live() {
            let delivered =
                panic::catch_unwind(AssertUnwindSafe(|| deliver(observer.as_ref(), &event)));
            if delivered.is_err() {
                error!(event = ?event_name(&event), "observer panicked");
            }
        }
        if let (SessionEvent::Frame(_), Some(budget)) = (&event, budget) {
            budget.release();
        }
    }
    debug!("dispatcher thread stopped");
}

fn deliver(observer: &dyn SessionObserver, event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged { from, to } => observer.on_state_changed(*from, *to),
        SessionEvent::ConnectionChanged(connected) => observer.on_connection_changed(*connected),
        SessionEvent::ConfigurationChanged(success) => {
            observer.on_configuration_changed(*success)
        }
        SessionEvent::ConnectFailed(err) => observer.on_connect_failed(err),
        SessionEvent::Frame(frame) => observer.on_frame(frame),
        SessionEvent::DecodeFailed(failure) => observer.on_decode_failed(failure),
    }
}

fn event_name(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::StateChanged { .. } => "state_changed",
        SessionEvent::ConnectionChanged(_) => "connection_changed",
        SessionEvent::ConfigurationChanged(_) => "configuration_changed",
        SessionEvent::ConnectFailed(_) => "connect_failed",
        SessionEvent::Frame(_) => "frame",
        SessionEvent::DecodeFailed(_) => "decode_failed",
    }
}
