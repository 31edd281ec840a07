//! Event dispatch to application handlers.
//!
//! Each event type gets its own lane: a task draining an unbounded queue and
//! awaiting that type's handlers one record at a time. Records of one type are
//! therefore handled in arrival order, while different types proceed
//! concurrently and a slow handler never stalls frame ingestion.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::eventsub::decode::EventRecord;
use crate::eventsub::error::EventSubError;

/// Error type application handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Type-erased async event handler.
pub type EventHandler =
    Arc<dyn Fn(Arc<EventRecord>) -> BoxFuture<Result<(), HandlerError>> + Send + Sync>;

/// Single sink for every contained failure: dropped frames, failed handlers,
/// unknown subscriptions.
pub type ErrorHook = Arc<dyn Fn(&EventSubError) + Send + Sync>;

/// Handler table built by the client before it runs.
#[derive(Clone, Default)]
pub struct Handlers {
    by_type: HashMap<String, Vec<EventHandler>>,
    catch_all: Vec<EventHandler>,
    error_hook: Option<ErrorHook>,
    handler_timeout: Option<Duration>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event_type`. Handlers of one type run in
    /// registration order.
    pub fn on<F, Fut>(&mut self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(Arc<EventRecord>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.by_type
            .entry(event_type.into())
            .or_default()
            .push(erase(handler));
    }

    /// Registers a handler for records whose type has no dedicated handler,
    /// including event types the decoder does not know.
    pub fn on_any<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<EventRecord>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.catch_all.push(erase(handler));
    }

    /// Sets the error hook, replacing any previous one.
    pub fn on_error<F>(&mut self, hook: F)
    where
        F: Fn(&EventSubError) + Send + Sync + 'static,
    {
        self.error_hook = Some(Arc::new(hook));
    }

    /// Bounds each handler invocation; overruns are reported and abandoned.
    pub fn set_handler_timeout(&mut self, timeout: Option<Duration>) {
        self.handler_timeout = timeout;
    }

    /// Reports a contained failure through the error hook.
    pub fn report(&self, error: &EventSubError) {
        warn!(event = "eventsub_error_reported", error = %error);
        if let Some(hook) = self.error_hook.as_ref() {
            hook(error);
        }
    }

    fn targets(&self, event_type: &str) -> &[EventHandler] {
        match self.by_type.get(event_type) {
            Some(handlers) if !handlers.is_empty() => handlers,
            _ => &self.catch_all,
        }
    }
}

fn erase<F, Fut>(handler: F) -> EventHandler
where
    F: Fn(Arc<EventRecord>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |record| -> BoxFuture<Result<(), HandlerError>> { Box::pin(handler(record)) })
}

/// Routes records to per-type lanes. Owned by the session worker.
pub struct EventDispatcher {
    handlers: Arc<Handlers>,
    lanes: HashMap<String, mpsc::UnboundedSender<Arc<EventRecord>>>,
    tasks: JoinSet<()>,
}

impl EventDispatcher {
    pub fn new(handlers: Arc<Handlers>) -> Self {
        Self {
            handlers,
            lanes: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Queues `record` for its handlers.
    ///
    /// Returns `false` when nothing is registered for the record, in which
    /// case it is dropped.
    pub fn dispatch(&mut self, record: EventRecord) -> bool {
        if self.handlers.targets(&record.event_type).is_empty() {
            debug!(
                event = "eventsub_record_unhandled",
                event_type = %record.event_type,
                message_id = %record.message_id,
            );
            return false;
        }

        let mut record = Arc::new(record);
        loop {
            let lane = self.lane(&record.event_type);
            match lane.send(record) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(returned)) => {
                    self.lanes.remove(&returned.event_type);
                    record = returned;
                }
            }
        }
    }

    /// Reports a contained failure through the error hook.
    pub fn report(&self, error: &EventSubError) {
        self.handlers.report(error);
    }

    /// Lets queued records finish, then stops every lane.
    #[cfg(test)]
    async fn drain(mut self) {
        self.lanes.clear();
        while self.tasks.join_next().await.is_some() {}
    }

    /// Cancels every lane, including handlers currently running.
    pub async fn shutdown(mut self) {
        self.lanes.clear();
        self.tasks.shutdown().await;
    }

    fn lane(&mut self, event_type: &str) -> mpsc::UnboundedSender<Arc<EventRecord>> {
        if let Some(lane) = self.lanes.get(event_type) {
            return lane.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.tasks
            .spawn(run_lane(event_type.to_string(), Arc::clone(&self.handlers), rx));
        self.lanes.insert(event_type.to_string(), tx.clone());
        tx
    }
}

async fn run_lane(
    event_type: String,
    handlers: Arc<Handlers>,
    mut rx: mpsc::UnboundedReceiver<Arc<EventRecord>>,
) {
    while let Some(record) = rx.recv().await {
        for handler in handlers.targets(&event_type) {
            invoke(handler, Arc::clone(&record), &handlers).await;
        }
    }
}

async fn invoke(handler: &EventHandler, record: Arc<EventRecord>, handlers: &Handlers) {
    let event_type = record.event_type.clone();
    let call = AssertUnwindSafe(async move { handler(record).await }).catch_unwind();

    let message = match handlers.handler_timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => failure_message(outcome),
            Err(_) => Some(format!("timed out after {}ms", limit.as_millis())),
        },
        None => failure_message(call.await),
    };

    if let Some(message) = message {
        handlers.report(&EventSubError::Handler {
            event_type,
            message,
        });
    }
}

fn failure_message(
    outcome: Result<Result<(), HandlerError>, Box<dyn std::any::Any + Send>>,
) -> Option<String> {
    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(panic) => Some(
            panic
                .downcast_ref::<&str>()
                .map(|msg| format!("panicked: {msg}"))
                .or_else(|| {
                    panic
                        .downcast_ref::<String>()
                        .map(|msg| format!("panicked: {msg}"))
                })
                .unwrap_or_else(|| "panicked".to_string()),
        ),
    }
}
