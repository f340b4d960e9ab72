//! In-process publish/subscribe bus for cache events.
//!
//! Handlers subscribe per [`EventType`] and run in subscription order. A
//! failing (or panicking) handler is logged and skipped; its siblings still
//! run. Asynchronous delivery goes through a single serialized worker so
//! updates to the same node are never reordered or lost.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{CacheEvent, EventQueue, EventType};
use crate::util::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::dispatcher";
const METRIC_DISPATCH_MS: &str = "canopy_cache_dispatch_ms";
const METRIC_HANDLER_FAILURE: &str = "canopy_handler_failure_total";

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A typed subscriber. Implementations update exactly one cache.
pub trait EventHandler: Send + Sync {
    /// Stable name used in logs, metrics and [`EventDispatcher::subscriptions`].
    fn name(&self) -> &'static str;

    fn handle(&self, event: &CacheEvent) -> Result<(), HandlerError>;
}

/// Outcome of delivering one event to its subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub event_id: Uuid,
    pub handled: usize,
    pub failed: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: &'static str,
    pub message: String,
}

struct DispatcherInner {
    lane: &'static str,
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    queue: EventQueue,
    // Serializes delivery so queued and inline events are handled in FIFO order.
    delivery: Mutex<()>,
    notify: Notify,
    stopped: AtomicBool,
    batch_limit: usize,
}

impl DispatcherInner {
    fn handlers_for(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
        rw_read(&self.handlers, SOURCE, "handlers_for")
            .get(&event_type)
            .cloned()
            .unwrap_or_default()
    }

    fn drain_pending(&self) -> usize {
        let _delivery = mutex_lock(&self.delivery, SOURCE, "drain_pending");
        self.drain_locked()
    }

    fn drain_locked(&self) -> usize {
        let mut delivered = 0;
        loop {
            let batch = self.queue.drain(self.batch_limit);
            if batch.is_empty() {
                break;
            }
            for event in &batch {
                self.deliver(event, "async");
            }
            delivered += batch.len();
        }
        delivered
    }

    fn deliver(&self, event: &CacheEvent, mode: &'static str) -> DispatchReport {
        let started_at = Instant::now();
        let mut report = DispatchReport {
            event_id: event.id,
            ..Default::default()
        };

        for handler in self.handlers_for(event.event_type()) {
            let name = handler.name();
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(event)));
            let message = match outcome {
                Ok(Ok(())) => {
                    report.handled += 1;
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => "handler panicked".to_string(),
            };

            error!(
                lane = self.lane,
                handler = name,
                event_id = %event.id,
                event_epoch = event.epoch,
                event_kind = ?event.kind,
                error = %message,
                "Cache event handler failed"
            );
            counter!(METRIC_HANDLER_FAILURE, "handler" => name).increment(1);
            report.failed.push(HandlerFailure {
                handler: name,
                message,
            });
        }

        histogram!(METRIC_DISPATCH_MS, "mode" => mode)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        report
    }
}

/// Event bus for one delivery lane.
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn new(lane: &'static str, batch_limit: usize) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                lane,
                handlers: RwLock::new(HashMap::new()),
                queue: EventQueue::new(),
                delivery: Mutex::new(()),
                notify: Notify::new(),
                stopped: AtomicBool::new(false),
                batch_limit: batch_limit.max(1),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn lane(&self) -> &'static str {
        self.inner.lane
    }

    /// Register `handler` for `event_type`. Handlers run in the order they subscribed.
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        debug!(
            lane = self.inner.lane,
            event_type = %event_type,
            handler = handler.name(),
            "Handler subscribed"
        );
        rw_write(&self.inner.handlers, SOURCE, "subscribe")
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Register `handler` for several event types at once.
    pub fn subscribe_all(&self, event_types: &[EventType], handler: Arc<dyn EventHandler>) {
        for event_type in event_types {
            self.subscribe(*event_type, Arc::clone(&handler));
        }
    }

    /// Handler names for `event_type`, in delivery order.
    pub fn subscriptions(&self, event_type: EventType) -> Vec<&'static str> {
        self.inner
            .handlers_for(event_type)
            .iter()
            .map(|handler| handler.name())
            .collect()
    }

    /// Deliver `event` before returning.
    ///
    /// Events still queued for asynchronous delivery on this lane are handled
    /// first, so a synchronous dispatch never overtakes an earlier one.
    pub fn dispatch(&self, event: &CacheEvent) -> DispatchReport {
        let _delivery = mutex_lock(&self.inner.delivery, SOURCE, "dispatch");
        self.inner.drain_locked();
        self.inner.deliver(event, "sync")
    }

    /// Queue `event` and return immediately.
    ///
    /// Events queued after [`stop`](Self::stop) are dropped.
    pub fn dispatch_async(&self, event: CacheEvent) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            warn!(
                lane = self.inner.lane,
                event_id = %event.id,
                event_kind = ?event.kind,
                "Dispatcher stopped; dropping event"
            );
            return;
        }
        self.inner.queue.push(event);
        self.inner.notify.notify_one();
    }

    /// Number of events waiting for asynchronous delivery.
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Deliver every queued event on the calling thread.
    pub fn flush(&self) -> usize {
        self.inner.drain_pending()
    }

    pub fn is_running(&self) -> bool {
        mutex_lock(&self.worker, SOURCE, "is_running").is_some()
    }

    /// Spawn the serialized delivery worker on the current tokio runtime.
    pub fn start(&self) {
        let mut worker = mutex_lock(&self.worker, SOURCE, "start");
        if worker.is_some() || self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                lane = self.inner.lane,
                "No tokio runtime; async events will be delivered on flush or stop"
            );
            return;
        };

        let inner = Arc::clone(&self.inner);
        *worker = Some(runtime.spawn(async move {
            loop {
                inner.notify.notified().await;
                let delivered = inner.drain_pending();
                if delivered > 0 {
                    debug!(lane = inner.lane, delivered, "Async events delivered");
                }
                if inner.stopped.load(Ordering::SeqCst) {
                    inner.drain_pending();
                    break;
                }
            }
        }));
        info!(lane = self.inner.lane, "Dispatcher worker started");
    }

    /// Stop accepting async events, deliver everything already queued, and
    /// wait for the worker to exit.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();

        let handle = mutex_lock(&self.worker, SOURCE, "stop").take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            error!(lane = self.inner.lane, error = %err, "Dispatcher worker terminated abnormally");
        }

        // Covers a worker that never started, or one that was aborted.
        let remaining = self.inner.drain_pending();
        info!(lane = self.inner.lane, remaining, "Dispatcher stopped");
    }
}
