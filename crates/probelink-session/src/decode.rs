use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use async_channel::{Receiver, Sender};
use probelink_wire::RawFrameMessage;
use tracing::{debug, error, trace, warn};

use crate::codec::ImageCodec;
use crate::dispatch::FrameBudget;
use crate::error::{Result, SessionError};
use crate::event::{DecodeFailure, DecodedFrame, EventSink, SessionEvent};

/// Work item for the decode thread.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeJob {
    Frame(RawFrameMessage),
    /// A DATA message whose header could not be read.
    Malformed(String),
}

/// Snapshot of decode pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub decoded: u64,
    pub failed: u64,
    /// Evicted by newer frames while the queue was full.
    pub dropped: u64,
    /// Thrown away on session teardown.
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    decoded: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
    /// Bumped on every discard, with `emit` held.
    generation: AtomicU64,
    /// Held while a result's generation is checked and the result emitted,
    /// so nothing submitted before a discard reaches the sink after it.
    emit: Mutex<()>,
}

struct Queued {
    generation: u64,
    job: DecodeJob,
}

/// Producer side of the decode queue.
///
/// Submitting never blocks. A bounded queue evicts its oldest pending job
/// when full.
#[derive(Clone)]
pub struct DecodeQueue {
    tx: Sender<Queued>,
    rx: Receiver<Queued>,
    counters: Arc<Counters>,
}

impl DecodeQueue {
    pub fn submit(&self, frame: RawFrameMessage) {
        self.push(DecodeJob::Frame(frame));
    }

    pub fn submit_malformed(&self, reason: impl Into<String>) {
        self.push(DecodeJob::Malformed(reason.into()));
    }

    pub fn push(&self, job: DecodeJob) {
        let queued = Queued {
            generation: self.counters.generation.load(Ordering::SeqCst),
            job,
        };
        match self.tx.force_send(queued) {
            Ok(None) => {}
            Ok(Some(_evicted)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped, "decode queue full, dropped oldest frame");
            }
            Err(_) => trace!("decode queue closed, frame ignored"),
        }
    }

    /// Throw away everything not yet emitted, including a job the decode
    /// thread is working on. Returns how many queued jobs were removed.
    pub fn discard_pending(&self) -> usize {
        {
            let _emit = self.counters.emit.lock().unwrap_or_else(PoisonError::into_inner);
            self.counters.generation.fetch_add(1, Ordering::SeqCst);
        }
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        self.counters
            .discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);
        discarded
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn stats(&self) -> DecodeStats {
        DecodeStats {
            decoded: self.counters.decoded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        self.tx.close();
    }
}

/// Dedicated decode thread.
///
/// Jobs are decoded one at a time in submission order. A codec error or panic
/// becomes a [`SessionEvent::DecodeFailed`] and the thread moves on.
///
/// `capacity` bounds the queue (`None` for unbounded). With a `budget`, each
/// decoded frame waits for a delivery slot before it is emitted.
pub struct DecodeWorker {
    queue: DecodeQueue,
    handle: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    pub fn spawn(
        codec: Arc<dyn ImageCodec>,
        sink: Arc<dyn EventSink>,
        capacity: Option<usize>,
        budget: Option<FrameBudget>,
    ) -> Result<Self> {
        let (tx, rx) = match capacity {
            Some(capacity) => async_channel::bounded(capacity.max(1)),
            None => async_channel::unbounded(),
        };
        let counters = Arc::new(Counters::default());
        let queue = DecodeQueue {
            tx,
            rx: rx.clone(),
            counters: counters.clone(),
        };

        let handle = thread::Builder::new()
            .name("probelink-decode".into())
            .spawn(move || {
                run(
                    rx,
                    codec.as_ref(),
                    sink.as_ref(),
                    budget.as_ref(),
                    &counters,
                )
            })
            .map_err(|source| SessionError::Spawn {
                name: "decode",
                source,
            })?;

        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub fn queue(&self) -> DecodeQueue {
        self.queue.clone()
    }

    pub fn stats(&self) -> DecodeStats {
        self.queue.stats()
    }

    /// Close the queue, let the thread finish what is queued, and join it.
    pub fn shutdown(&mut self) {
        self.queue.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("decode thread panicked");
            }
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    rx: Receiver<Queued>,
    codec: &dyn ImageCodec,
    sink: &dyn EventSink,
    budget: Option<&FrameBudget>,
    counters: &Counters,
) {
    debug!("decode thread started");
    while let Ok(Queued { generation, job }) = rx.recv_blocking() {
        let event = match job {
            DecodeJob::Frame(frame) => decode_frame(codec, &frame),
            DecodeJob::Malformed(reason) => SessionEvent::DecodeFailed(DecodeFailure {
                timestamp_nanos: None,
                reason,
            }),
        };

        let slot = match (&event, budget) {
            (SessionEvent::Frame(_), Some(budget)) => budget.acquire().then_some(budget),
            _ => None,
        };

        let _emit = counters.emit.lock().unwrap_or_else(PoisonError::into_inner);
        if generation != counters.generation.load(Ordering::SeqCst) {
            counters.discarded.fetch_add(1, Ordering::Relaxed);
            if let Some(budget) = slot {
                budget.release();
            }
            continue;
        }

        match &event {
            SessionEvent::Frame(_) => counters.decoded.fetch_add(1, Ordering::Relaxed),
            _ => counters.failed.fetch_add(1, Ordering::Relaxed),
        };
        sink.emit(event);
    }
    debug!("decode thread stopped");
}

fn decode_frame(codec: &dyn ImageCodec, frame: &RawFrameMessage) -> SessionEvent {
    let result = panic::catch_unwind(AssertUnwindSafe(|| codec.decode(frame)));

    let reason = match result {
        Ok(Ok(pixels)) => {
            trace!(
                width = frame.width,
                height = frame.height,
                ts = frame.timestamp_nanos,
                "frame decoded"
            );
            return SessionEvent::Frame(DecodedFrame {
                width: frame.width,
                height: frame.height,
                timestamp_nanos: frame.timestamp_nanos,
                pixels,
            });
        }
        Ok(Err(err)) => err.to_string(),
        Err(payload) => {
            let reason = format!("codec panicked: {}", panic_message(payload.as_ref()));
            error!(ts = frame.timestamp_nanos, "{reason}");
            reason
        }
    };

    warn!(
        width = frame.width,
        height = frame.height,
        ts = frame.timestamp_nanos,
        reason = %reason,
        "frame decode failed"
    );
    SessionEvent::DecodeFailed(DecodeFailure {
        timestamp_nanos: Some(frame.timestamp_nanos),
        reason,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
