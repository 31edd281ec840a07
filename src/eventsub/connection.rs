//! EventSub websocket worker.
//!
//! A single task owns the transport, the [`SessionCore`] and the
//! [`EventDispatcher`]. It handles the initial welcome, keepalive watchdog,
//! server-driven migration and reconnects with backoff, and serves registry
//! commands from client handles so the registry never needs a lock.

use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, InvalidHeaderValue};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::eventsub::dispatch::EventDispatcher;
use crate::eventsub::error::EventSubError;
use crate::eventsub::registry::Subscription;
use crate::eventsub::session::{SessionCore, SessionStatus, Step, WelcomeKind};
use crate::helix::SubscriptionRequest;
use crate::retry::RetryPolicy;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Observable session state published on every transition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub endpoint: Option<String>,
}

impl SessionSnapshot {
    pub(crate) fn connecting() -> Self {
        Self {
            status: SessionStatus::Connecting,
            session_id: None,
            endpoint: None,
        }
    }
}

/// Registry requests served by the worker.
pub(crate) enum SessionCommand {
    Register {
        subscription: Subscription,
        reply: oneshot::Sender<Result<(), EventSubError>>,
    },
    Remove {
        subscription_id: String,
        reply: oneshot::Sender<Result<Subscription, EventSubError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Subscription>>,
    },
    Drain {
        reply: oneshot::Sender<Vec<Subscription>>,
    },
    FindMatching {
        request: SubscriptionRequest,
        reply: oneshot::Sender<Option<Subscription>>,
    },
}

/// Notifications from the worker to the client facade.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum SessionSignal {
    Welcomed {
        session_id: String,
        kind: WelcomeKind,
    },
}

#[derive(Clone, Debug)]
pub(crate) struct ConnectionSettings {
    pub default_endpoint: String,
    pub connect_timeout: Duration,
    pub welcome_timeout: Duration,
    pub reconnect_policy: RetryPolicy,
    pub dedupe_window: usize,
}

/// Worker-side ends of the channels shared with the client.
pub(crate) struct WorkerChannels {
    pub commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub signals: mpsc::UnboundedSender<SessionSignal>,
    pub snapshot: watch::Sender<SessionSnapshot>,
    pub close: watch::Receiver<bool>,
}

enum AttemptError {
    Retry(EventSubError),
    Fatal(EventSubError),
}

enum Establish {
    Connected(Socket, String),
    Failed(AttemptError),
    Closed,
}

enum ServeOutcome {
    Closed,
    Lost(EventSubError),
    Fatal(EventSubError),
}

struct Migration {
    url: String,
    task: JoinHandle<Result<(Socket, String), AttemptError>>,
}

pub(crate) struct SessionWorker {
    settings: ConnectionSettings,
    credential: SecretString,
    core: SessionCore,
    dispatcher: EventDispatcher,
    endpoint: String,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    snapshot: watch::Sender<SessionSnapshot>,
    close: watch::Receiver<bool>,
}

impl SessionWorker {
    pub(crate) fn new(
        settings: ConnectionSettings,
        credential: SecretString,
        dispatcher: EventDispatcher,
        channels: WorkerChannels,
    ) -> Self {
        Self {
            core: SessionCore::new(settings.dedupe_window),
            endpoint: settings.default_endpoint.clone(),
            settings,
            credential,
            dispatcher,
            commands: channels.commands,
            signals: channels.signals,
            snapshot: channels.snapshot,
            close: channels.close,
        }
    }

    /// Runs until close, a fatal error, or exhausted reconnects.
    pub(crate) async fn run(mut self) -> Result<(), EventSubError> {
        let result = self.drive().await;
        self.core.close();
        self.publish();
        match &result {
            Ok(()) => info!(event = "eventsub_session_closed"),
            Err(err) => warn!(event = "eventsub_session_failed", error = %err),
        }
        self.dispatcher.shutdown().await;
        result
    }

    async fn drive(&mut self) -> Result<(), EventSubError> {
        let default_endpoint = self.settings.default_endpoint.clone();
        let mut endpoint = default_endpoint.clone();
        let mut last_good: Option<String> = None;
        let mut attempt = 0usize;

        loop {
            self.core.begin_connect();
            self.endpoint = endpoint.clone();
            self.publish();
            info!(event = "eventsub_connecting", endpoint = %endpoint, attempt);

            let failure = match self.establish(&endpoint).await {
                Establish::Closed => return Ok(()),
                Establish::Failed(AttemptError::Fatal(err)) => return Err(err),
                Establish::Failed(AttemptError::Retry(err)) => err,
                Establish::Connected(socket, welcome) => {
                    let step = self.core.handle_text(&welcome);
                    if let Some(ServeOutcome::Fatal(err)) = self.apply(step, &mut None) {
                        return Err(err);
                    }
                    attempt = 0;
                    match self.serve(socket).await {
                        ServeOutcome::Closed => return Ok(()),
                        ServeOutcome::Fatal(err) => return Err(err),
                        ServeOutcome::Lost(err) => {
                            last_good = Some(self.endpoint.clone());
                            err
                        }
                    }
                }
            };

            warn!(
                event = "eventsub_connection_failed",
                endpoint = %self.endpoint,
                error = %failure,
                attempt,
            );
            self.core.connection_lost();
            self.publish();

            attempt += 1;
            let policy = &self.settings.reconnect_policy;
            if !policy.allows_attempt(attempt) {
                return Err(EventSubError::ReconnectsExhausted {
                    attempts: attempt - 1,
                });
            }
            let delay = policy.delay_for_attempt(attempt);

            endpoint = match (&last_good, attempt) {
                (Some(good), 1) => good.clone(),
                _ => default_endpoint.clone(),
            };

            debug!(
                event = "eventsub_reconnect_scheduled",
                attempt,
                delay_ms = delay.as_millis() as u64,
                endpoint = %endpoint,
            );
            if !self.wait_backoff(delay).await {
                return Ok(());
            }
        }
    }

    /// Connects and reads the first frame, serving commands meanwhile.
    async fn establish(&mut self, endpoint: &str) -> Establish {
        let attempt = open_socket(
            endpoint.to_string(),
            self.credential.clone(),
            self.settings.connect_timeout,
            self.settings.welcome_timeout,
        );
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                biased;
                changed = self.close.changed() => {
                    if changed.is_err() || *self.close.borrow() {
                        return Establish::Closed;
                    }
                }
                Some(command) = self.commands.recv() => self.handle_command(command),
                result = &mut attempt => {
                    return match result {
                        Ok((socket, first)) => Establish::Connected(socket, first),
                        Err(err) => Establish::Failed(err),
                    };
                }
            }
        }
    }

    async fn serve(&mut self, mut socket: Socket) -> ServeOutcome {
        let mut last_activity = Instant::now();
        let mut migration: Option<Migration> = None;
        // Set once the current socket ends while a migration is still pending.
        let mut current_lost: Option<EventSubError> = None;

        let outcome = loop {
            let keepalive = self
                .core
                .keepalive()
                .unwrap_or(self.settings.welcome_timeout);
            let deadline = last_activity + keepalive;

            tokio::select! {
                biased;
                changed = self.close.changed() => {
                    if changed.is_err() || *self.close.borrow() {
                        let _ = socket.close(None).await;
                        break ServeOutcome::Closed;
                    }
                }
                Some(command) = self.commands.recv() => self.handle_command(command),
                (url, result) = migration_done(&mut migration) => {
                    migration = None;
                    match result {
                        Ok((next, first)) => {
                            let drain_current = current_lost.is_none();
                            if let Some(outcome) = self
                                .swap_connection(
                                    &mut socket,
                                    next,
                                    &url,
                                    &first,
                                    drain_current,
                                    &mut migration,
                                )
                                .await
                            {
                                break outcome;
                            }
                            current_lost = None;
                            last_activity = Instant::now();
                        }
                        Err(AttemptError::Fatal(err)) => break ServeOutcome::Fatal(err),
                        Err(AttemptError::Retry(err)) => {
                            warn!(event = "eventsub_migration_failed", url = %url, error = %err);
                            self.core.abandon_migration();
                            self.publish();
                            self.dispatcher.report(&err);
                        }
                    }
                    if migration.is_none() {
                        if let Some(err) = current_lost.take() {
                            break ServeOutcome::Lost(err);
                        }
                    }
                }
                frame = socket.next(), if current_lost.is_none() => {
                    last_activity = Instant::now();
                    let ended = match frame {
                        Some(Ok(Message::Text(text))) => {
                            let step = self.core.handle_text(&text);
                            if let Some(outcome) = self.apply(step, &mut migration) {
                                break outcome;
                            }
                            None
                        }
                        Some(Ok(Message::Ping(payload))) => socket
                            .send(Message::Pong(payload))
                            .await
                            .err()
                            .map(EventSubError::from),
                        Some(Ok(Message::Close(frame))) => Some(EventSubError::Transport(format!(
                            "server closed the connection: {frame:?}"
                        ))),
                        Some(Ok(_)) => None,
                        Some(Err(err)) => Some(err.into()),
                        None => Some(EventSubError::Transport("connection ended".to_string())),
                    };
                    if let Some(err) = ended {
                        if migration.is_none() {
                            break ServeOutcome::Lost(err);
                        }
                        debug!(
                            event = "eventsub_connection_ended_during_migration",
                            endpoint = %self.endpoint,
                            error = %err,
                        );
                        current_lost = Some(err);
                    }
                }
                _ = sleep_until(deadline), if migration.is_none() => {
                    break ServeOutcome::Lost(EventSubError::Transport(format!(
                        "no traffic for {}ms",
                        keepalive.as_millis()
                    )));
                }
            }
        };

        if let Some(pending) = migration.take() {
            pending.task.abort();
        }
        outcome
    }

    /// Swaps in a migration target whose first frame has arrived.
    ///
    /// Frames already buffered on the old connection are processed first,
    /// unless `drain_current` is false because that connection has ended.
    async fn swap_connection(
        &mut self,
        current: &mut Socket,
        next: Socket,
        url: &str,
        first: &str,
        drain_current: bool,
        migration: &mut Option<Migration>,
    ) -> Option<ServeOutcome> {
        let welcome = match self.core.migration_welcome(first) {
            Ok(welcome) => welcome,
            Err(err) if err.is_fatal() => {
                close_in_background(next);
                return Some(ServeOutcome::Fatal(err));
            }
            Err(err) => {
                warn!(event = "eventsub_migration_failed", url = %url, error = %err);
                close_in_background(next);
                if !drain_current {
                    return Some(ServeOutcome::Lost(err));
                }
                self.core.abandon_migration();
                self.publish();
                self.dispatcher.report(&err);
                return None;
            }
        };

        if drain_current {
            while let Some(Some(Ok(message))) = current.next().now_or_never() {
                if let Message::Text(text) = message {
                    let step = self.core.handle_text(&text);
                    if let Some(outcome) = self.apply(step, migration) {
                        close_in_background(next);
                        return Some(outcome);
                    }
                }
            }
        }

        let previous = std::mem::replace(current, next);
        close_in_background(previous);
        self.endpoint = url.to_string();
        let step = self.core.complete_migration(welcome);
        self.apply(step, migration)
    }

    fn apply(&mut self, step: Step, migration: &mut Option<Migration>) -> Option<ServeOutcome> {
        match step {
            Step::Ignore => None,
            Step::Opened {
                session_id,
                keepalive,
                kind,
            } => {
                info!(
                    event = "eventsub_session_open",
                    session_id = %session_id,
                    keepalive_secs = keepalive.as_secs(),
                    kind = ?kind,
                );
                self.publish();
                let _ = self
                    .signals
                    .send(SessionSignal::Welcomed { session_id, kind });
                None
            }
            Step::Dispatch(record) => {
                self.dispatcher.dispatch(record);
                None
            }
            Step::Migrate { reconnect_url } => {
                if let Some(previous) = migration.take() {
                    previous.task.abort();
                }
                self.publish();
                let task = tokio::spawn(open_socket(
                    reconnect_url.clone(),
                    self.credential.clone(),
                    self.settings.connect_timeout,
                    self.settings.welcome_timeout,
                ));
                *migration = Some(Migration {
                    url: reconnect_url,
                    task,
                });
                None
            }
            Step::Report(err) => {
                self.dispatcher.report(&err);
                None
            }
            Step::Fatal(err) => Some(ServeOutcome::Fatal(err)),
        }
    }

    /// Sleeps for `delay`, serving commands. Returns `false` on close.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                changed = self.close.changed() => {
                    if changed.is_err() || *self.close.borrow() {
                        return false;
                    }
                }
                Some(command) = self.commands.recv() => self.handle_command(command),
                _ = &mut sleep => return true,
            }
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Register {
                subscription,
                reply,
            } => {
                debug!(
                    event = "eventsub_subscription_registered",
                    subscription_id = %subscription.id,
                    event_type = %subscription.event_type,
                );
                let result = self
                    .core
                    .registry_mut()
                    .register(subscription)
                    .map_err(EventSubError::from);
                let _ = reply.send(result);
            }
            SessionCommand::Remove {
                subscription_id,
                reply,
            } => {
                let result = self
                    .core
                    .registry_mut()
                    .remove(&subscription_id)
                    .map_err(EventSubError::from);
                let _ = reply.send(result);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.core.registry().all().cloned().collect());
            }
            SessionCommand::Drain { reply } => {
                let _ = reply.send(self.core.registry_mut().drain());
            }
            SessionCommand::FindMatching { request, reply } => {
                let found = self
                    .core
                    .registry()
                    .find_matching(&request.event_type, &request.version, &request.condition)
                    .cloned();
                let _ = reply.send(found);
            }
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            status: self.core.status(),
            session_id: self.core.session_id().map(str::to_string),
            endpoint: Some(self.endpoint.clone()),
        });
    }
}

async fn migration_done(
    migration: &mut Option<Migration>,
) -> (String, Result<(Socket, String), AttemptError>) {
    match migration.as_mut() {
        Some(pending) => {
            let result = match (&mut pending.task).await {
                Ok(result) => result,
                Err(err) => Err(AttemptError::Retry(EventSubError::Transport(format!(
                    "migration task failed: {err}"
                )))),
            };
            (pending.url.clone(), result)
        }
        None => std::future::pending().await,
    }
}

/// Opens a websocket and waits for its first text frame.
async fn open_socket(
    endpoint: String,
    credential: SecretString,
    connect_timeout: Duration,
    welcome_timeout: Duration,
) -> Result<(Socket, String), AttemptError> {
    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|err| AttemptError::Fatal(err.into()))?;
    let bearer: HeaderValue = format!("Bearer {}", credential.expose_secret())
        .parse()
        .map_err(|err: InvalidHeaderValue| AttemptError::Fatal(err.into()))?;
    request.headers_mut().insert("Authorization", bearer);

    let (mut socket, _) = match timeout(connect_timeout, connect_async(request)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => return Err(classify_connect_error(err)),
        Err(_) => {
            return Err(AttemptError::Retry(EventSubError::Transport(format!(
                "connect to {endpoint} timed out after {}ms",
                connect_timeout.as_millis()
            ))));
        }
    };

    match timeout(welcome_timeout, recv_first_text(&mut socket)).await {
        Ok(Ok(text)) => Ok((socket, text)),
        Ok(Err(err)) if err.is_fatal() => Err(AttemptError::Fatal(err)),
        Ok(Err(err)) => Err(AttemptError::Retry(err)),
        Err(_) => {
            close_in_background(socket);
            Err(AttemptError::Retry(EventSubError::Transport(format!(
                "no session_welcome within {}ms",
                welcome_timeout.as_millis()
            ))))
        }
    }
}

async fn recv_first_text(socket: &mut Socket) -> Result<String, EventSubError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err(EventSubError::Transport(
                    "socket closed before session_welcome".to_string(),
                ));
            }
            Some(Ok(_)) => {
                return Err(EventSubError::ProtocolViolation(
                    "received non-text frame before session_welcome".to_string(),
                ));
            }
            Some(Err(err)) => return Err(EventSubError::WebSocket(err)),
            None => {
                return Err(EventSubError::Transport(
                    "socket ended before session_welcome".to_string(),
                ));
            }
        }
    }
}

fn classify_connect_error(err: WsError) -> AttemptError {
    match &err {
        WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
            AttemptError::Fatal(EventSubError::AuthExpired)
        }
        _ => AttemptError::Retry(err.into()),
    }
}

fn close_in_background(mut socket: Socket) {
    tokio::spawn(async move {
        let _ = socket.close(None).await;
    });
}
