// =============================================================================
// Event Bus — bounded FIFO between I/O tasks and the engine core
// =============================================================================
//
// The core is single-threaded: broker gateway, data feed, and cloud tasks
// post immutable events here and the engine drains them between handlers.
// Priority classes (highest first):
//
//   EMERGENCY > EXIT_TRIGGER > TICK > BAR_FINALIZED > TIMER > CLOUD_CHECK
//
// Backpressure: the bus is bounded; when occupancy crosses 80%, queued tick
// events older than 500ms are shed. Non-tick events are never dropped —
// the bus grows past its bound rather than lose a fill or a halt.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::broker::{OrderId, OrderStatus};
use crate::license::LicenseState;
use crate::market_data::{Bar, Tick};

/// Timer identities dispatched by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// 20s: connection health + session-lock heartbeat.
    Heartbeat,
    /// 30s: position snapshot flush.
    PositionFlush,
    /// 60s: session snapshot flush.
    SessionFlush,
    /// 300s: license validation.
    LicenseCheck,
    /// ET-aligned minute boundary: finalize bar, run pipeline.
    MinuteBoundary,
}

/// Results arriving from the cloud I/O task.
#[derive(Debug, Clone)]
pub enum CloudEvent {
    LicenseResult(LicenseState),
    HeartbeatFailed,
}

/// Everything the engine core reacts to.
#[derive(Debug, Clone)]
pub enum Event {
    /// Highest priority: immediate flatten demanded.
    Emergency { reason: String },
    /// Session halt: drain to quiescence.
    Halt { reason: String },
    /// Broker order update (ack/fill/reject) — exit-trigger class.
    OrderUpdate { order_id: OrderId, status: OrderStatus },
    Tick(Tick),
    /// A finalized bar (posted internally by the engine's own handlers).
    BarFinalized(Bar),
    Timer(TimerKind),
    Cloud(CloudEvent),
}

/// Number of priority classes.
const CLASSES: usize = 6;

impl Event {
    fn class(&self) -> usize {
        match self {
            Event::Emergency { .. } | Event::Halt { .. } => 0,
            Event::OrderUpdate { .. } => 1,
            Event::Tick(_) => 2,
            Event::BarFinalized(_) => 3,
            Event::Timer(_) => 4,
            Event::Cloud(_) => 5,
        }
    }
}

/// Bus capacity before tick shedding engages.
const CAPACITY: usize = 1024;

/// Occupancy fraction beyond which stale ticks are shed.
const SHED_THRESHOLD: f64 = 0.80;

/// Age beyond which a queued tick is considered stale under pressure.
const STALE_TICK_AGE: Duration = Duration::from_millis(500);

struct Queues {
    by_class: [VecDeque<(Event, Duration)>; CLASSES],
    len: usize,
}

/// Multi-producer, single-consumer priority bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    queues: Mutex<Queues>,
    notify: Notify,
    shed_ticks: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                queues: Mutex::new(Queues {
                    by_class: Default::default(),
                    len: 0,
                }),
                notify: Notify::new(),
                shed_ticks: AtomicU64::new(0),
            }),
        }
    }

    /// Post an event. `enqueued_at` is the producer's monotonic clock
    /// reading, used for staleness-based shedding.
    ///
    /// Returns false only when a tick was dropped under backpressure.
    pub fn push(&self, event: Event, enqueued_at: Duration) -> bool {
        let mut q = self.inner.queues.lock();

        if q.len >= CAPACITY && matches!(event, Event::Tick(_)) {
            self.inner.shed_ticks.fetch_add(1, Ordering::Relaxed);
            debug!("bus at capacity — tick dropped");
            return false;
        }

        let class = event.class();
        q.by_class[class].push_back((event, enqueued_at));
        q.len += 1;
        drop(q);

        self.inner.notify.notify_one();
        true
    }

    /// Non-blocking pop of the highest-priority event. Sheds stale ticks
    /// first when the bus is under pressure.
    pub fn try_pop(&self, now: Duration) -> Option<Event> {
        let mut q = self.inner.queues.lock();

        if q.len as f64 > CAPACITY as f64 * SHED_THRESHOLD {
            let tick_class = 2;
            let before = q.by_class[tick_class].len();
            q.by_class[tick_class]
                .retain(|(_, at)| now.saturating_sub(*at) <= STALE_TICK_AGE);
            let shed = before - q.by_class[tick_class].len();
            if shed > 0 {
                q.len -= shed;
                self.inner
                    .shed_ticks
                    .fetch_add(shed as u64, Ordering::Relaxed);
                debug!(shed, "stale ticks shed under backpressure");
            }
        }

        for class in 0..CLASSES {
            if let Some((event, _)) = q.by_class[class].pop_front() {
                q.len -= 1;
                return Some(event);
            }
        }
        None
    }

    /// Await the next event.
    pub async fn pop(&self, now_fn: impl Fn() -> Duration) -> Event {
        loop {
            if let Some(event) = self.try_pop(now_fn()) {
                return event;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.queues.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shed_tick_count(&self) -> u64 {
        self.inner.shed_ticks.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
