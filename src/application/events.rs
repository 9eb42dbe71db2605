//! Lifecycle event bus.
//!
//! Subscribers register for one [`EventType`] or for every event. Dispatch
//! order is fixed: handlers for the specific type in registration order,
//! then wildcard handlers in registration order. A handler that returns an
//! error or panics is logged and counted; the remaining handlers still run
//! and the emitter never sees the failure.

use crate::application::metrics::GovernanceMetrics;
use crate::application::ports::{Clock, Emitter};
use crate::domain::event::{EventEnvelope, EventType, Payload};
use std::any::Any;
use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[cfg(feature = "async")]
use futures::future::{BoxFuture, FutureExt};

/// Error a handler may return. Only ever logged.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

type SyncFn = Arc<dyn Fn(&EventEnvelope) -> HandlerResult + Send + Sync>;

#[cfg(feature = "async")]
type AsyncFn = Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A subscriber callback.
#[derive(Clone)]
pub enum Handler {
    /// Runs on the emitting thread.
    Sync(SyncFn),
    /// Runs as a future; awaited by `emit_async`, spawned by `emit`.
    #[cfg(feature = "async")]
    Async(AsyncFn),
}

impl Handler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&EventEnvelope) -> HandlerResult + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(f))
    }

    #[cfg(feature = "async")]
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        Handler::Async(Arc::new(move |envelope| f(envelope).boxed()))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Sync(<fn>)"),
            #[cfg(feature = "async")]
            Handler::Async(_) => f.write_str("Async(<fn>)"),
        }
    }
}

/// Which emissions a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Only(EventType),
    /// Every event type, after the type-specific handlers.
    Any,
}

impl From<EventType> for EventFilter {
    fn from(event_type: EventType) -> Self {
        EventFilter::Only(event_type)
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone)]
struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    handler: Handler,
}

/// Publish/subscribe dispatcher for lifecycle events.
///
/// # Example
/// ```
/// use request_governance::{payload, EventBus, EventFilter, EventType, Handler, SystemClock};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let bus = EventBus::new(Arc::new(SystemClock::new()));
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
/// bus.subscribe(
///     EventFilter::Only(EventType::UnhandledError),
///     Handler::sync(move |_| {
///         counter.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     }),
/// );
///
/// bus.emit(EventType::UnhandledError, payload! { "error" => "boom" });
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// ```
#[derive(Debug)]
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    metrics: GovernanceMetrics,
}

impl EventBus {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_metrics(clock, GovernanceMetrics::new())
    }

    pub fn with_metrics(clock: Arc<dyn Clock>, metrics: GovernanceMetrics) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            clock,
            metrics,
        }
    }

    pub fn subscribe(&self, filter: impl Into<EventFilter>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let filter = filter.into();
        tracing::debug!(subscription = id.0, filter = ?filter, "event handler subscribed");
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                filter,
                handler,
            });
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        let removed = subscriptions.len() != before;
        if removed {
            tracing::debug!(subscription = id.0, "event handler unsubscribed");
        }
        removed
    }

    /// Handlers that would receive `event_type`, wildcard ones included.
    pub fn listener_count(&self, event_type: EventType) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| matches_filter(s.filter, event_type))
            .count()
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn metrics(&self) -> &GovernanceMetrics {
        &self.metrics
    }

    /// Dispatch to synchronous handlers on this thread.
    ///
    /// Async handlers are spawned onto the current tokio runtime without
    /// being awaited; outside a runtime they are skipped.
    pub fn emit(&self, event_type: EventType, payload: Payload) {
        let envelope = EventEnvelope::new(event_type, payload, self.clock.now());
        let handlers = self.handlers_for(event_type);
        self.run_sync(&envelope, &handlers);

        #[cfg(feature = "async")]
        self.spawn_async(&envelope, &handlers);
    }

    /// Dispatch to synchronous handlers, then run all async handlers
    /// concurrently and wait for them.
    #[cfg(feature = "async")]
    pub async fn emit_async(&self, event_type: EventType, payload: Payload) {
        let envelope = EventEnvelope::new(event_type, payload, self.clock.now());
        let handlers = self.handlers_for(event_type);
        self.run_sync(&envelope, &handlers);

        let pending = handlers.iter().filter_map(|(id, handler)| match handler {
            Handler::Async(f) => Some(guarded(
                *id,
                event_type,
                f(envelope.clone()),
                self.metrics.clone(),
            )),
            Handler::Sync(_) => None,
        });
        futures::future::join_all(pending).await;
    }

    /// Type-specific handlers first, then wildcards, each in registration
    /// order. Cloned out so no lock is held while handlers run.
    fn handlers_for(&self, event_type: EventType) -> Vec<(SubscriptionId, Handler)> {
        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let specific = subscriptions
            .iter()
            .filter(|s| s.filter == EventFilter::Only(event_type));
        let wildcard = subscriptions
            .iter()
            .filter(|s| s.filter == EventFilter::Any);
        specific
            .chain(wildcard)
            .map(|s| (s.id, s.handler.clone()))
            .collect()
    }

    fn run_sync(&self, envelope: &EventEnvelope, handlers: &[(SubscriptionId, Handler)]) {
        for (id, handler) in handlers {
            let Handler::Sync(f) = handler else {
                continue;
            };
            let result = panic::catch_unwind(panic::AssertUnwindSafe(|| f(envelope)));
            report(*id, envelope.event_type, result, &self.metrics);
        }
    }

    #[cfg(feature = "async")]
    fn spawn_async(&self, envelope: &EventEnvelope, handlers: &[(SubscriptionId, Handler)]) {
        let mut async_handlers = handlers
            .iter()
            .filter_map(|(id, handler)| match handler {
                Handler::Async(f) => Some((*id, f)),
                Handler::Sync(_) => None,
            })
            .peekable();
        if async_handlers.peek().is_none() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(
                event = %envelope.event_type,
                "no async runtime, async handlers skipped"
            );
            return;
        };
        for (id, f) in async_handlers {
            runtime.spawn(guarded(
                id,
                envelope.event_type,
                f(envelope.clone()),
                self.metrics.clone(),
            ));
        }
    }
}

impl Emitter for EventBus {
    fn emit(&self, event_type: EventType, payload: Payload) {
        EventBus::emit(self, event_type, payload);
    }
}

fn matches_filter(filter: EventFilter, event_type: EventType) -> bool {
    match filter {
        EventFilter::Only(t) => t == event_type,
        EventFilter::Any => true,
    }
}

/// Await one async handler with the same isolation sync handlers get.
#[cfg(feature = "async")]
async fn guarded(
    id: SubscriptionId,
    event_type: EventType,
    fut: BoxFuture<'static, HandlerResult>,
    metrics: GovernanceMetrics,
) {
    let result = panic::AssertUnwindSafe(fut).catch_unwind().await;
    report(id, event_type, result, &metrics);
}

fn report(
    id: SubscriptionId,
    event_type: EventType,
    result: Result<HandlerResult, Box<dyn Any + Send>>,
    metrics: &GovernanceMetrics,
) {
    let error = match result {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
    };
    metrics.record_handler_failure();
    tracing::error!(
        event = %event_type,
        subscription = id.0,
        error = %error,
        "event handler failed"
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic>"
    }
}
