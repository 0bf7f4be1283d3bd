//! Topic-based event distribution.
//!
//! Every subscriber owns a bounded queue and a dedicated dispatch thread.
//! `publish` never blocks: it `try_send`s into each matching queue and counts
//! a drop when a queue is full, so a slow subscriber only loses its own
//! events. Callbacks run on the dispatch thread; an `Err` or a panic is
//! caught there and reported on [`Topic::Error`]. Failures of `error`
//! subscribers are only logged.
//!
//! There is no replay. A subscriber sees events published after it
//! subscribed, in publish order.

use crate::data::fft::SpectralResult;
use crate::data::frame::{SampleFrame, SequenceRange};
use crate::data::reflection::ReflectionResult;
use crate::error::{AppResult, DaqError, ErrorKind};
use crate::session::{SessionId, SessionState};
use parking_lot::RwLock;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    /// Every acquired [`SampleFrame`]
    RawFrame,
    /// Per-channel spectra of each analysis block
    SpectralResult,
    /// Incident/reflected separation of each analysis block
    ReflectionResult,
    /// Session lifecycle transitions
    SessionStateChanged,
    /// Faults, warnings and subscriber failures
    Error,
}

impl Topic {
    /// Wire name (`raw-frame`, `spectral-result`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::RawFrame => "raw-frame",
            Topic::SpectralResult => "spectral-result",
            Topic::ReflectionResult => "reflection-result",
            Topic::SessionStateChanged => "session-state-changed",
            Topic::Error => "error",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `session-state-changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct StateChange {
    pub session_id: SessionId,
    pub old_state: SessionState,
    pub new_state: SessionState,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[allow(missing_docs)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    /// Absent for failures not tied to a session (e.g. a subscriber outside
    /// any session's traffic).
    pub session_id: Option<SessionId>,
}

impl ErrorEvent {
    /// Event of `kind` with a diagnostic message.
    pub fn new(kind: ErrorKind, message: impl Into<String>, session_id: Option<SessionId>) -> Self {
        Self {
            kind,
            message: message.into(),
            session_id,
        }
    }

    /// Event describing `err`.
    pub fn from_error(err: &DaqError, session_id: Option<SessionId>) -> Self {
        Self::new(err.kind(), err.to_string(), session_id)
    }
}

/// Everything that travels over the bus.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum BusEvent {
    RawFrame {
        session_id: SessionId,
        frame: Arc<SampleFrame>,
    },
    SpectralResult {
        session_id: SessionId,
        /// Frames the analysed block was assembled from
        frames: SequenceRange,
        result: Arc<SpectralResult>,
    },
    ReflectionResult {
        session_id: SessionId,
        frames: SequenceRange,
        result: Arc<ReflectionResult>,
    },
    SessionStateChanged(StateChange),
    Error(ErrorEvent),
}

impl BusEvent {
    /// Topic the event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::RawFrame { .. } => Topic::RawFrame,
            BusEvent::SpectralResult { .. } => Topic::SpectralResult,
            BusEvent::ReflectionResult { .. } => Topic::ReflectionResult,
            BusEvent::SessionStateChanged(_) => Topic::SessionStateChanged,
            BusEvent::Error(_) => Topic::Error,
        }
    }

    /// Session the event belongs to, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            BusEvent::RawFrame { session_id, .. }
            | BusEvent::SpectralResult { session_id, .. }
            | BusEvent::ReflectionResult { session_id, .. } => Some(*session_id),
            BusEvent::SessionStateChanged(change) => Some(change.session_id),
            BusEvent::Error(event) => event.session_id,
        }
    }
}

/// Subscriber callback.
pub type Handler = Box<dyn FnMut(&BusEvent) -> anyhow::Result<()> + Send>;

/// Handle returned by [`SignalBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriberId(u64);

/// Delivery counters of one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriberStats {
    /// Handle
    pub id: SubscriberId,
    /// Name given at subscription
    pub name: String,
    /// Subscribed topic
    pub topic: Topic,
    /// Events handed to the callback
    pub delivered: u64,
    /// Events discarded because the queue was full
    pub dropped: u64,
    /// Callback errors and panics
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    failures: AtomicU64,
}

struct Subscriber {
    id: SubscriberId,
    name: String,
    topic: Topic,
    sender: mpsc::Sender<BusEvent>,
    counters: Arc<Counters>,
    thread: Option<JoinHandle<()>>,
}

impl Subscriber {
    fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            id: self.id,
            name: self.name.clone(),
            topic: self.topic,
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Close the queue and wait for the dispatch thread to finish what is
    /// already queued.
    fn close(mut self) {
        let thread = self.thread.take();
        drop(self.sender);
        if let Some(handle) = thread {
            // A callback may unsubscribe itself; never join our own thread.
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!(subscriber = %self.name, "dispatch thread panicked");
            }
        }
    }
}

struct BusInner {
    queue_capacity: usize,
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl BusInner {
    fn publish(&self, event: BusEvent) -> usize {
        let topic = event.topic();
        let subscribers = self.subscribers.read();
        let mut queued = 0;
        for sub in subscribers.iter().filter(|s| s.topic == topic) {
            match sub.sender.try_send(event.clone()) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(subscriber = %sub.name, topic = %topic, "dropped event (queue full)");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = %sub.name, "subscriber queue closed");
                }
            }
        }
        queued
    }
}

/// Publish/subscribe hub.
#[derive(Clone)]
pub struct SignalBus {
    inner: Arc<BusInner>,
}

impl SignalBus {
    /// Bus whose subscriber queues hold `queue_capacity` events each.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                queue_capacity: queue_capacity.max(1),
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register `handler` for `topic`. It runs on a dedicated thread named
    /// after `name`.
    pub fn subscribe<F>(
        &self,
        topic: Topic,
        name: impl Into<String>,
        handler: F,
    ) -> AppResult<SubscriberId>
    where
        F: FnMut(&BusEvent) -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        let handler: Handler = Box::new(handler);
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.inner.queue_capacity);
        let counters = Arc::new(Counters::default());

        let thread = std::thread::Builder::new()
            .name(format!("bus-{}", name))
            .spawn({
                let name = name.clone();
                let counters = Arc::clone(&counters);
                let bus = Arc::downgrade(&self.inner);
                move || dispatch(name, topic, receiver, handler, counters, bus)
            })?;

        self.inner.subscribers.write().push(Subscriber {
            id,
            name: name.clone(),
            topic,
            sender,
            counters,
            thread: Some(thread),
        });
        debug!(subscriber = %name, topic = %topic, "subscribed");
        Ok(id)
    }

    /// Remove a subscriber. Events already queued for it are still
    /// delivered. Returns `false` for an unknown id.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = {
            let mut subscribers = self.inner.subscribers.write();
            subscribers
                .iter()
                .position(|s| s.id == id)
                .map(|index| subscribers.remove(index))
        };
        match removed {
            Some(sub) => {
                sub.close();
                true
            }
            None => false,
        }
    }

    /// Queue `event` for every subscriber of its topic. Returns how many
    /// queues accepted it.
    pub fn publish(&self, event: BusEvent) -> usize {
        self.inner.publish(event)
    }

    /// Number of subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .subscribers
            .read()
            .iter()
            .filter(|s| s.topic == topic)
            .count()
    }

    /// Counters of every subscriber.
    pub fn subscriber_stats(&self) -> Vec<SubscriberStats> {
        self.inner
            .subscribers
            .read()
            .iter()
            .map(Subscriber::stats)
            .collect()
    }

    /// Remove all subscribers, letting each drain its queue.
    pub fn shutdown(&self) {
        let subscribers = std::mem::take(&mut *self.inner.subscribers.write());
        for sub in subscribers {
            sub.close();
        }
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("queue_capacity", &self.inner.queue_capacity)
            .field("subscribers", &self.inner.subscribers.read().len())
            .finish()
    }
}

fn dispatch(
    name: String,
    topic: Topic,
    mut receiver: mpsc::Receiver<BusEvent>,
    mut handler: Handler,
    counters: Arc<Counters>,
    bus: Weak<BusInner>,
) {
    while let Some(event) = receiver.blocking_recv() {
        counters.delivered.fetch_add(1, Ordering::Relaxed);
        let failure = match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic_message(panic.as_ref()),
        };
        counters.failures.fetch_add(1, Ordering::Relaxed);

        if topic == Topic::Error {
            error!(subscriber = %name, failure = %failure, "error subscriber failed");
            continue;
        }
        warn!(subscriber = %name, topic = %topic, failure = %failure, "subscriber failed");
        if let Some(bus) = bus.upgrade() {
            bus.publish(BusEvent::Error(ErrorEvent::new(
                ErrorKind::SubscriberFailure,
                format!("subscriber '{}' failed on {}: {}", name, topic, failure),
                event.session_id(),
            )));
        }
    }
    trace!(subscriber = %name, "dispatch thread exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn frame_event(session_id: SessionId, sequence: u64) -> BusEvent {
        BusEvent::RawFrame {
            session_id,
            frame: Arc::new(SampleFrame::new(sequence, Utc::now(), 32.0, vec![vec![0.0]])),
        }
    }

    fn collector(tx: std_mpsc::Sender<BusEvent>) -> Handler {
        Box::new(move |event| {
            tx.send(event.clone())
                .map_err(|_| anyhow::anyhow!("collector closed"))
        })
    }

    #[test]
    fn test_events_arrive_in_order() {
        let bus = SignalBus::new(16);
        let (tx, rx) = std_mpsc::channel();
        bus.subscribe(Topic::RawFrame, "collector", collector(tx)).unwrap();

        let session = SessionId::new();
        for seq in 1..=5 {
            assert_eq!(bus.publish(frame_event(session, seq)), 1);
        }
        let seqs: Vec<u64> = (0..5)
            .map(|_| match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                BusEvent::RawFrame { frame, .. } => frame.sequence(),
                other => panic!("unexpected {:?}", other.topic()),
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        bus.shutdown();
    }

    #[test]
    fn test_topics_are_separate() {
        let bus = SignalBus::new(16);
        let (tx, rx) = std_mpsc::channel();
        bus.subscribe(Topic::SessionStateChanged, "states", collector(tx))
            .unwrap();
        assert_eq!(bus.publish(frame_event(SessionId::new(), 1)), 0);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_failing_subscriber_is_isolated_and_reported() {
        let bus = SignalBus::new(16);
        let (ok_tx, ok_rx) = std_mpsc::channel();
        let (err_tx, err_rx) = std_mpsc::channel();
        bus.subscribe(
            Topic::RawFrame,
            "panics",
            |_| panic!("probe plot exploded"),
        )
        .unwrap();
        bus.subscribe(
            Topic::RawFrame,
            "errors",
            |_| Err(anyhow::anyhow!("disk full")),
        )
        .unwrap();
        bus.subscribe(Topic::RawFrame, "healthy", collector(ok_tx)).unwrap();
        bus.subscribe(Topic::Error, "error-log", collector(err_tx)).unwrap();

        let session = SessionId::new();
        for seq in 1..=3 {
            bus.publish(frame_event(session, seq));
        }
        for _ in 0..3 {
            ok_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }

        let mut messages = Vec::new();
        for _ in 0..6 {
            match err_rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                BusEvent::Error(event) => {
                    assert_eq!(event.kind, ErrorKind::SubscriberFailure);
                    assert_eq!(event.session_id, Some(session));
                    messages.push(event.message);
                }
                other => panic!("unexpected {:?}", other.topic()),
            }
        }
        assert!(messages.iter().any(|m| m.contains("probe plot exploded")));
        assert!(messages.iter().any(|m| m.contains("disk full")));

        bus.shutdown();
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let bus = SignalBus::new(1);
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        let id = bus
            .subscribe(
                Topic::RawFrame,
                "slow",
                move |_| {
                    gate_rx.recv()?;
                    Ok(())
                },
            )
            .unwrap();

        let session = SessionId::new();
        for seq in 1..=5 {
            bus.publish(frame_event(session, seq));
        }
        let stats = bus.subscriber_stats();
        assert_eq!(stats[0].id, id);
        assert!(stats[0].dropped >= 3, "dropped {}", stats[0].dropped);

        for _ in 0..5 {
            let _ = gate_tx.send(());
        }
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(Topic::RawFrame), 0);
    }

    #[test]
    fn test_error_subscriber_failure_is_not_republished() {
        let bus = SignalBus::new(16);
        let (tx, rx) = std_mpsc::channel();
        bus.subscribe(Topic::Error, "broken", |_| anyhow::bail!("nope"))
            .unwrap();
        bus.subscribe(Topic::Error, "watcher", collector(tx)).unwrap();

        bus.publish(BusEvent::Error(ErrorEvent::new(
            ErrorKind::RateDrift,
            "drift",
            None,
        )));
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        bus.shutdown();
        // Stats are gone with the subscribers.
        assert!(bus.subscriber_stats().is_empty());
    }
}
