//! EventSub client facade.
//!
//! [`EventSubClient`] collects handlers and initial subscriptions, then
//! [`EventSubClient::run`] spawns the session worker and reacts to its
//! welcomes: initial subscriptions are created before `on_ready` callbacks
//! fire, and every subscription is recreated after a hard reconnect.
//! [`ClientHandle`] is the cloneable control surface for use while running.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::eventsub::connection::{
    ConnectionSettings, SessionCommand, SessionSignal, SessionSnapshot, SessionWorker,
    WorkerChannels,
};
use crate::eventsub::decode::EventRecord;
use crate::eventsub::dispatch::{BoxFuture, EventDispatcher, HandlerError, Handlers};
use crate::eventsub::error::EventSubError;
use crate::eventsub::registry::Subscription;
use crate::eventsub::session::{SessionStatus, WelcomeKind};
use crate::helix::{SubscriptionApi, SubscriptionRequest};
use crate::retry::RetryPolicy;

/// Production EventSub websocket endpoint.
pub const EVENTSUB_ENDPOINT: &str = "wss://eventsub.wss.twitch.tv/ws";
/// Websocket endpoint of the Twitch CLI mock server.
pub const LOCAL_EVENTSUB_ENDPOINT: &str = "ws://127.0.0.1:8080/ws";

/// Default values for [`EventSubOptions`].
pub struct EventSubDefaults;

impl EventSubDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEDUPE_WINDOW: usize = 256;
}

/// Session tuning.
#[derive(Clone, Debug)]
pub struct EventSubOptions {
    /// Bound on opening the websocket, TLS included.
    pub connect_timeout: Duration,
    /// Bound on receiving `session_welcome` once connected.
    pub welcome_timeout: Duration,
    /// Backoff and attempt budget for re-establishing a failed session.
    pub reconnect_policy: RetryPolicy,
    /// Per-invocation handler bound; `None` lets handlers run indefinitely.
    pub handler_timeout: Option<Duration>,
    /// Number of recent message ids remembered for duplicate suppression.
    pub dedupe_window: usize,
}

impl Default for EventSubOptions {
    fn default() -> Self {
        Self {
            connect_timeout: EventSubDefaults::CONNECT_TIMEOUT,
            welcome_timeout: EventSubDefaults::WELCOME_TIMEOUT,
            reconnect_policy: RetryPolicy::reconnect(),
            handler_timeout: None,
            dedupe_window: EventSubDefaults::DEDUPE_WINDOW,
        }
    }
}

type ReadyHandler = Arc<dyn Fn(ClientHandle) -> BoxFuture<Result<(), HandlerError>> + Send + Sync>;

/// Composition root for one EventSub session.
pub struct EventSubClient {
    local: bool,
    endpoint_override: Option<String>,
    options: EventSubOptions,
    handlers: Handlers,
    ready: Vec<ReadyHandler>,
    initial: Vec<SubscriptionRequest>,
    handle: ClientHandle,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    snapshot: watch::Sender<SessionSnapshot>,
    close: watch::Receiver<bool>,
}

impl EventSubClient {
    /// Creates a client that manages subscriptions through `api`.
    pub fn new(api: Arc<dyn SubscriptionApi>) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(SessionSnapshot::connecting());
        let (close_tx, close) = watch::channel(false);

        Self {
            local: false,
            endpoint_override: None,
            options: EventSubOptions::default(),
            handlers: Handlers::new(),
            ready: Vec::new(),
            initial: Vec::new(),
            handle: ClientHandle {
                inner: Arc::new(HandleInner {
                    api,
                    commands: commands_tx,
                    snapshot: snapshot_rx,
                    close: close_tx,
                    credential: OnceLock::new(),
                }),
            },
            commands,
            snapshot,
            close,
        }
    }

    /// Routes to the local mock server endpoint.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit websocket endpoint.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    pub fn with_options(mut self, options: EventSubOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers a handler for one event type.
    ///
    /// Use `"revocation"` to observe subscriptions revoked by the server.
    pub fn on<F, Fut>(&mut self, event_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Arc<EventRecord>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handlers.on(event_type, handler);
        self
    }

    /// Registers a catch-all for event types without a dedicated handler.
    pub fn on_any<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Arc<EventRecord>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handlers.on_any(handler);
        self
    }

    /// Registers a callback run once, after the first welcome and after the
    /// initial subscriptions were created.
    pub fn on_ready<F, Fut>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(ClientHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.ready.push(Arc::new(
            move |handle| -> BoxFuture<Result<(), HandlerError>> { Box::pin(callback(handle)) },
        ));
        self
    }

    /// Sets the hook receiving every contained failure.
    pub fn on_error<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&EventSubError) + Send + Sync + 'static,
    {
        self.handlers.on_error(hook);
        self
    }

    /// Queues a subscription created as soon as the session is welcomed.
    pub fn subscribe(&mut self, request: SubscriptionRequest) -> &mut Self {
        self.initial.push(request);
        self
    }

    /// Returns a handle usable from handlers and other tasks.
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Runs the session until [`ClientHandle::close`] or a fatal error.
    ///
    /// Dropping the returned future cancels the session task and every
    /// in-flight handler.
    pub async fn run(self, credential: SecretString) -> Result<(), EventSubError> {
        let endpoint = self.endpoint().to_string();
        let Self {
            options,
            mut handlers,
            ready,
            initial,
            handle,
            commands,
            snapshot,
            close,
            ..
        } = self;

        let _ = handle.inner.credential.set(credential.clone());
        handlers.set_handler_timeout(options.handler_timeout);
        let handlers = Arc::new(handlers);

        let (signals_tx, mut signals) = mpsc::unbounded_channel();
        let worker = SessionWorker::new(
            ConnectionSettings {
                default_endpoint: endpoint,
                connect_timeout: options.connect_timeout,
                welcome_timeout: options.welcome_timeout,
                reconnect_policy: options.reconnect_policy,
                dedupe_window: options.dedupe_window,
            },
            credential,
            EventDispatcher::new(Arc::clone(&handlers)),
            WorkerChannels {
                commands,
                signals: signals_tx,
                snapshot,
                close,
            },
        );
        let mut session = AbortOnDrop(tokio::spawn(worker.run()));
        let mut callbacks = JoinSet::new();
        let mut initial = Some(initial);

        loop {
            tokio::select! {
                joined = &mut session.0 => {
                    return joined.unwrap_or_else(|err| {
                        Err(EventSubError::Transport(format!("session task failed: {err}")))
                    });
                }
                Some(SessionSignal::Welcomed { session_id, kind }) = signals.recv() => {
                    let outcome = match kind {
                        WelcomeKind::Initial => {
                            let requests = initial.take().unwrap_or_default();
                            let created = create_all(&handle, &handlers, requests, &session_id).await;
                            if created.is_ok() {
                                spawn_ready(&mut callbacks, &ready, &handle, &handlers);
                            }
                            created
                        }
                        WelcomeKind::Recovered => {
                            resubscribe(&handle, &handlers, &session_id).await
                        }
                        WelcomeKind::Migrated => {
                            debug!(event = "eventsub_session_migrated", session_id = %session_id);
                            Ok(())
                        }
                    };

                    if let Err(err) = outcome {
                        handle.close();
                        let worker = (&mut session.0).await.unwrap_or(Ok(()));
                        return Err(terminal_error(err, worker));
                    }
                }
            }
        }
    }

    fn endpoint(&self) -> &str {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint;
        }
        if self.local {
            LOCAL_EVENTSUB_ENDPOINT
        } else {
            EVENTSUB_ENDPOINT
        }
    }
}

/// Picks the error `run` returns when a welcome reaction failed.
///
/// `Closed` only means the worker was already gone; its own error wins.
fn terminal_error(err: EventSubError, worker: Result<(), EventSubError>) -> EventSubError {
    match (err, worker) {
        (EventSubError::Closed, Err(worker_err)) => worker_err,
        (err, _) => err,
    }
}

/// Creates each request on the new session. Only auth expiry is fatal.
async fn create_all(
    handle: &ClientHandle,
    handlers: &Handlers,
    requests: Vec<SubscriptionRequest>,
    session_id: &str,
) -> Result<(), EventSubError> {
    for request in requests {
        match handle.create_on(&request, session_id).await {
            Ok(subscription) => info!(
                event = "eventsub_subscribed",
                subscription_id = %subscription.id,
                event_type = %subscription.event_type,
            ),
            Err(EventSubError::AuthExpired) => return Err(EventSubError::AuthExpired),
            Err(err) => handlers.report(&err),
        }
    }
    Ok(())
}

/// Recreates every registered subscription after a hard reconnect.
async fn resubscribe(
    handle: &ClientHandle,
    handlers: &Handlers,
    session_id: &str,
) -> Result<(), EventSubError> {
    let previous = handle
        .request(|reply| SessionCommand::Drain { reply })
        .await?;
    info!(
        event = "eventsub_resubscribing",
        session_id = %session_id,
        count = previous.len(),
    );
    let requests = previous
        .into_iter()
        .map(|subscription| SubscriptionRequest {
            event_type: subscription.event_type,
            version: subscription.version,
            condition: subscription.condition,
        })
        .collect();
    create_all(handle, handlers, requests, session_id).await
}

fn spawn_ready(
    callbacks: &mut JoinSet<()>,
    ready: &[ReadyHandler],
    handle: &ClientHandle,
    handlers: &Arc<Handlers>,
) {
    if ready.is_empty() {
        return;
    }
    let ready = ready.to_vec();
    let handle = handle.clone();
    let handlers = Arc::clone(handlers);
    callbacks.spawn(async move {
        for callback in ready {
            if let Err(err) = callback(handle.clone()).await {
                handlers.report(&EventSubError::Handler {
                    event_type: "ready".to_string(),
                    message: err.to_string(),
                });
            }
        }
    });
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct HandleInner {
    api: Arc<dyn SubscriptionApi>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    close: watch::Sender<bool>,
    credential: OnceLock<SecretString>,
}

/// Cloneable control surface of a running [`EventSubClient`].
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<HandleInner>,
}

impl ClientHandle {
    /// Creates a subscription on the current session and registers it.
    ///
    /// Waits until the session is open. Fails with `DuplicateSubscription`
    /// if the same type, version and condition is already registered.
    pub async fn subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> Result<Subscription, EventSubError> {
        let session_id = self.wait_open().await?;
        self.create_on(&request, &session_id).await
    }

    /// Deletes a subscription remotely and drops it from the registry.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), EventSubError> {
        let credential = self.credential()?;
        self.inner
            .api
            .delete_subscription(credential, subscription_id)
            .await?;
        let subscription_id = subscription_id.to_string();
        self.request(|reply| SessionCommand::Remove {
            subscription_id,
            reply,
        })
        .await??;
        Ok(())
    }

    /// Currently registered subscriptions.
    pub async fn subscriptions(&self) -> Result<Vec<Subscription>, EventSubError> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.snapshot.borrow().status
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.snapshot.borrow().session_id.clone()
    }

    /// Latest published session state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Watches session state transitions.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.clone()
    }

    /// Requests a clean shutdown; `run` then returns `Ok(())`.
    pub fn close(&self) {
        self.inner.close.send_replace(true);
    }

    async fn create_on(
        &self,
        request: &SubscriptionRequest,
        session_id: &str,
    ) -> Result<Subscription, EventSubError> {
        let matching = request.clone();
        if let Some(existing) = self
            .request(|reply| SessionCommand::FindMatching {
                request: matching,
                reply,
            })
            .await?
        {
            return Err(EventSubError::DuplicateSubscription(existing.id));
        }

        let credential = self.credential()?;
        let subscription = self
            .inner
            .api
            .create_subscription(credential, request, session_id)
            .await?;

        let registered = subscription.clone();
        self.request(|reply| SessionCommand::Register {
            subscription: registered,
            reply,
        })
        .await??;
        Ok(subscription)
    }

    async fn wait_open(&self) -> Result<String, EventSubError> {
        let mut snapshot = self.inner.snapshot.clone();
        let current = snapshot
            .wait_for(|state| {
                matches!(state.status, SessionStatus::Open | SessionStatus::Closed)
            })
            .await
            .map_err(|_| EventSubError::Closed)?;
        match (&current.status, &current.session_id) {
            (SessionStatus::Open, Some(session_id)) => Ok(session_id.clone()),
            _ => Err(EventSubError::Closed),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, EventSubError> {
        let (reply, response) = oneshot::channel();
        self.inner
            .commands
            .send(build(reply))
            .map_err(|_| EventSubError::Closed)?;
        response.await.map_err(|_| EventSubError::Closed)
    }

    fn credential(&self) -> Result<&SecretString, EventSubError> {
        self.inner.credential.get().ok_or_else(|| {
            warn!(event = "eventsub_handle_used_before_run");
            EventSubError::Closed
        })
    }
}
