//! EventSub session state machine.
//!
//! [`SessionCore`] interprets decoded frames for the current connection and
//! decides what the transport worker should do next. It performs no IO and
//! owns the subscription registry, so every rule about ordering, revocation
//! and duplicate delivery can be exercised without a socket.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::eventsub::decode::{decode_frame, ControlMessage, EventRecord, Frame, FrameBody};
use crate::eventsub::error::EventSubError;
use crate::eventsub::registry::{RegistryError, SubscriptionRegistry};

/// Lifecycle status of the logical session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStatus {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

/// Why a welcome was received.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WelcomeKind {
    /// First welcome of the run.
    Initial,
    /// Welcome on a fresh session after the previous one failed. Server-side
    /// subscriptions did not survive.
    Recovered,
    /// Welcome on the endpoint named by `session_reconnect`. Subscriptions
    /// carried over.
    Migrated,
}

/// Action requested by the core after a frame.
#[derive(Debug)]
pub enum Step {
    Ignore,
    Opened {
        session_id: String,
        keepalive: Duration,
        kind: WelcomeKind,
    },
    Dispatch(EventRecord),
    Migrate {
        reconnect_url: String,
    },
    /// Contained failure; the frame was dropped.
    Report(EventSubError),
    /// Session integrity is lost.
    Fatal(EventSubError),
}

/// Welcome received on a migration target, not yet swapped in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MigrationWelcome {
    pub session_id: String,
    pub keepalive: Duration,
}

#[derive(Debug)]
pub struct SessionCore {
    status: SessionStatus,
    session_id: Option<String>,
    keepalive: Option<Duration>,
    awaiting_welcome: bool,
    welcomed_once: bool,
    registry: SubscriptionRegistry,
    seen: SeenMessages,
}

impl SessionCore {
    pub fn new(dedupe_window: usize) -> Self {
        Self {
            status: SessionStatus::Connecting,
            session_id: None,
            keepalive: None,
            awaiting_welcome: true,
            welcomed_once: false,
            registry: SubscriptionRegistry::new(),
            seen: SeenMessages::new(dedupe_window),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Keepalive announced by the current session's welcome.
    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SubscriptionRegistry {
        &mut self.registry
    }

    /// A new transport connection is being opened after none or a failed one.
    pub fn begin_connect(&mut self) {
        self.status = if self.welcomed_once {
            SessionStatus::Reconnecting
        } else {
            SessionStatus::Connecting
        };
        self.session_id = None;
        self.keepalive = None;
        self.awaiting_welcome = true;
    }

    /// The current connection failed; the session must be re-established.
    pub fn connection_lost(&mut self) {
        warn!(
            event = "eventsub_session_lost",
            session_id = ?self.session_id,
        );
        self.begin_connect();
    }

    pub fn close(&mut self) {
        self.status = SessionStatus::Closed;
    }

    /// Decodes and applies one text frame from the current connection.
    pub fn handle_text(&mut self, text: &str) -> Step {
        match decode_frame(text) {
            Ok(frame) => self.handle_frame(frame),
            Err(err) if self.awaiting_welcome => Step::Fatal(EventSubError::ProtocolViolation(
                format!("expected session_welcome, got undecodable frame: {err}"),
            )),
            Err(err) => Step::Report(err.into()),
        }
    }

    /// Applies one decoded frame from the current connection.
    pub fn handle_frame(&mut self, frame: Frame) -> Step {
        if self.awaiting_welcome {
            return self.expect_welcome(frame);
        }

        if !self.seen.insert(&frame.message_id) {
            debug!(event = "eventsub_duplicate_dropped", message_id = %frame.message_id);
            return Step::Ignore;
        }

        match frame.body {
            FrameBody::Control(ControlMessage::Welcome { session_id, .. }) => {
                Step::Fatal(EventSubError::ProtocolViolation(format!(
                    "unexpected session_welcome for {session_id} on an open session"
                )))
            }
            FrameBody::Control(ControlMessage::Keepalive) => Step::Ignore,
            FrameBody::Control(ControlMessage::Reconnect { reconnect_url, .. }) => {
                info!(event = "eventsub_reconnect_requested", reconnect_url = %reconnect_url);
                self.status = SessionStatus::Reconnecting;
                Step::Migrate { reconnect_url }
            }
            FrameBody::Control(ControlMessage::Revocation {
                subscription,
                reason,
            }) => match self.registry.revoke(&subscription.id) {
                Ok(revoked) => {
                    info!(
                        event = "eventsub_subscription_revoked",
                        subscription_id = %revoked.id,
                        reason = %reason,
                    );
                    Step::Dispatch(EventRecord::revocation(&frame.message_id, &revoked, &reason))
                }
                Err(RegistryError::NotFound(id)) => Step::Report(EventSubError::NotFound(id)),
                Err(err) => Step::Report(err.into()),
            },
            FrameBody::Event(record) => {
                if self.registry.contains(&record.subscription_id) {
                    Step::Dispatch(record)
                } else {
                    Step::Report(EventSubError::UnknownSubscription {
                        subscription_id: record.subscription_id,
                        event_type: record.event_type,
                    })
                }
            }
        }
    }

    /// Checks the first frame received on a migration target.
    pub fn migration_welcome(&mut self, text: &str) -> Result<MigrationWelcome, EventSubError> {
        let frame = decode_frame(text)?;
        match frame.body {
            FrameBody::Control(ControlMessage::Welcome {
                session_id,
                keepalive,
            }) => {
                self.seen.insert(&frame.message_id);
                Ok(MigrationWelcome {
                    session_id,
                    keepalive,
                })
            }
            other => Err(EventSubError::ProtocolViolation(format!(
                "reconnect target sent {} before session_welcome",
                describe(&other)
            ))),
        }
    }

    /// Makes the migration target the current connection.
    pub fn complete_migration(&mut self, welcome: MigrationWelcome) -> Step {
        info!(
            event = "eventsub_session_migrated",
            previous = ?self.session_id,
            session_id = %welcome.session_id,
        );
        self.open(welcome.session_id, welcome.keepalive, WelcomeKind::Migrated)
    }

    /// The migration target failed; the current connection keeps serving.
    pub fn abandon_migration(&mut self) {
        if self.status == SessionStatus::Reconnecting && !self.awaiting_welcome {
            self.status = SessionStatus::Open;
        }
    }

    fn expect_welcome(&mut self, frame: Frame) -> Step {
        match frame.body {
            FrameBody::Control(ControlMessage::Welcome {
                session_id,
                keepalive,
            }) => {
                self.seen.insert(&frame.message_id);
                let kind = if self.welcomed_once {
                    WelcomeKind::Recovered
                } else {
                    WelcomeKind::Initial
                };
                self.open(session_id, keepalive, kind)
            }
            other => Step::Fatal(EventSubError::ProtocolViolation(format!(
                "received {} before session_welcome",
                describe(&other)
            ))),
        }
    }

    fn open(&mut self, session_id: String, keepalive: Duration, kind: WelcomeKind) -> Step {
        self.status = SessionStatus::Open;
        self.session_id = Some(session_id.clone());
        self.keepalive = Some(keepalive);
        self.awaiting_welcome = false;
        self.welcomed_once = true;
        Step::Opened {
            session_id,
            keepalive,
            kind,
        }
    }
}

fn describe(body: &FrameBody) -> String {
    match body {
        FrameBody::Control(ControlMessage::Welcome { .. }) => "session_welcome".to_string(),
        FrameBody::Control(ControlMessage::Keepalive) => "session_keepalive".to_string(),
        FrameBody::Control(ControlMessage::Reconnect { .. }) => "session_reconnect".to_string(),
        FrameBody::Control(ControlMessage::Revocation { .. }) => "revocation".to_string(),
        FrameBody::Event(record) => format!("`{}` notification", record.event_type),
    }
}

/// Bounded window of recently seen message ids.
#[derive(Debug)]
struct SeenMessages {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenMessages {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Returns `false` if `id` is already in the window.
    fn insert(&mut self, id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::eventsub::decode::EventPayload;
    use crate::eventsub::proto::{Condition, SubscriptionMsg, TransportMsg, WireMessage};
    use crate::eventsub::registry::{Subscription, SubscriptionStatus};

    fn subscription_msg(id: &str, status: &str) -> SubscriptionMsg {
        SubscriptionMsg {
            id: id.to_string(),
            status: status.to_string(),
            event_type: "channel.follow".to_string(),
            version: "2".to_string(),
            condition: Condition::new(),
            transport: Some(TransportMsg::websocket("S1")),
            created_at: None,
            cost: Some(0),
        }
    }

    fn follow_notification(message_id: &str, subscription_id: &str) -> String {
        WireMessage::notification(
            message_id,
            subscription_msg(subscription_id, "enabled"),
            json!({
                "user_id": "1234",
                "user_login": "alice",
                "user_name": "alice",
                "broadcaster_user_id": "1337",
                "broadcaster_user_login": "cool_user",
                "broadcaster_user_name": "Cool_User",
                "followed_at": "2023-07-15T18:16:11.17106713Z"
            }),
        )
        .to_text()
        .expect("encode")
    }

    fn welcome(message_id: &str, session_id: &str) -> String {
        WireMessage::welcome(message_id, session_id, 10)
            .to_text()
            .expect("encode")
    }

    fn open_core_with_sub1() -> SessionCore {
        let mut core = SessionCore::new(16);
        assert!(matches!(
            core.handle_text(&welcome("w1", "S1")),
            Step::Opened {
                kind: WelcomeKind::Initial,
                ..
            }
        ));
        core.registry_mut()
            .register(Subscription::from(subscription_msg("SUB1", "enabled")))
            .expect("register");
        core
    }

    #[test]
    fn welcome_opens_session_with_keepalive() {
        let mut core = SessionCore::new(16);
        assert_eq!(core.status(), SessionStatus::Connecting);

        match core.handle_text(&welcome("w1", "S1")) {
            Step::Opened {
                session_id,
                keepalive,
                kind,
            } => {
                assert_eq!(session_id, "S1");
                assert_eq!(keepalive, Duration::from_secs(10));
                assert_eq!(kind, WelcomeKind::Initial);
            }
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(core.status(), SessionStatus::Open);
        assert_eq!(core.session_id(), Some("S1"));
    }

    #[test]
    fn notification_before_welcome_is_fatal() {
        let mut core = SessionCore::new(16);
        match core.handle_text(&follow_notification("n1", "SUB1")) {
            Step::Fatal(EventSubError::ProtocolViolation(message)) => {
                assert!(message.contains("channel.follow"));
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn keepalive_before_welcome_is_fatal() {
        let mut core = SessionCore::new(16);
        let keepalive = WireMessage::keepalive("k1").to_text().expect("encode");
        assert!(matches!(
            core.handle_text(&keepalive),
            Step::Fatal(EventSubError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn notification_for_registered_subscription_is_dispatched() {
        let mut core = open_core_with_sub1();
        match core.handle_text(&follow_notification("n1", "SUB1")) {
            Step::Dispatch(record) => {
                assert_eq!(record.subscription_id, "SUB1");
                match record.payload {
                    EventPayload::Follow(follow) => assert_eq!(follow.user.user_login, "alice"),
                    other => panic!("unexpected payload: {other:?}"),
                }
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn repeated_message_ids_are_dropped_silently() {
        let mut core = open_core_with_sub1();
        assert!(matches!(
            core.handle_text(&follow_notification("n1", "SUB1")),
            Step::Dispatch(_)
        ));
        assert!(matches!(
            core.handle_text(&follow_notification("n1", "SUB1")),
            Step::Ignore
        ));
        assert!(matches!(
            core.handle_text(&follow_notification("n2", "SUB1")),
            Step::Dispatch(_)
        ));
    }

    #[test]
    fn dedupe_window_forgets_oldest_ids() {
        let mut seen = SeenMessages::new(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("c"));
        assert!(seen.insert("a"));
    }

    #[test]
    fn notification_for_unknown_subscription_is_reported() {
        let mut core = open_core_with_sub1();
        match core.handle_text(&follow_notification("n1", "SUB9")) {
            Step::Report(EventSubError::UnknownSubscription {
                subscription_id,
                event_type,
            }) => {
                assert_eq!(subscription_id, "SUB9");
                assert_eq!(event_type, "channel.follow");
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn revocation_removes_subscription_and_dispatches_once() {
        let mut core = open_core_with_sub1();
        let revocation = WireMessage::revocation("r1", subscription_msg("SUB1", "user_removed"))
            .to_text()
            .expect("encode");

        match core.handle_text(&revocation) {
            Step::Dispatch(record) => {
                assert_eq!(record.event_type, "revocation");
                match record.payload {
                    EventPayload::Revocation(event) => {
                        assert_eq!(event.reason, "user_removed");
                        assert_eq!(event.subscription_type, "channel.follow");
                    }
                    other => panic!("unexpected payload: {other:?}"),
                }
            }
            other => panic!("unexpected step: {other:?}"),
        }
        assert!(!core.registry().contains("SUB1"));

        // Redelivery of the same message is a duplicate.
        assert!(matches!(core.handle_text(&revocation), Step::Ignore));

        // A fresh revocation for the same id is a non-fatal NotFound.
        let again = WireMessage::revocation("r2", subscription_msg("SUB1", "user_removed"))
            .to_text()
            .expect("encode");
        match core.handle_text(&again) {
            Step::Report(err) => {
                assert!(matches!(err, EventSubError::NotFound(ref id) if id == "SUB1"));
                assert!(!err.is_fatal());
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_after_welcome_is_reported_not_fatal() {
        let mut core = open_core_with_sub1();
        match core.handle_text("{not json") {
            Step::Report(err) => assert!(matches!(err, EventSubError::Decode(_))),
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(core.status(), SessionStatus::Open);
    }

    #[test]
    fn reconnect_requests_migration_and_welcome_swaps_session() {
        let mut core = open_core_with_sub1();
        let reconnect = WireMessage::reconnect("c1", "S1", "wss://next.example/ws")
            .to_text()
            .expect("encode");

        match core.handle_text(&reconnect) {
            Step::Migrate { reconnect_url } => assert_eq!(reconnect_url, "wss://next.example/ws"),
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(core.status(), SessionStatus::Reconnecting);

        // The old connection keeps dispatching until the swap.
        assert!(matches!(
            core.handle_text(&follow_notification("n1", "SUB1")),
            Step::Dispatch(_)
        ));

        let welcome = core
            .migration_welcome(&welcome("w2", "S1"))
            .expect("migration welcome");
        assert!(matches!(
            core.complete_migration(welcome),
            Step::Opened {
                kind: WelcomeKind::Migrated,
                ..
            }
        ));
        assert_eq!(core.status(), SessionStatus::Open);
        assert!(core.registry().contains("SUB1"));
    }

    #[test]
    fn migration_target_must_welcome_first() {
        let mut core = open_core_with_sub1();
        let err = core
            .migration_welcome(&follow_notification("n1", "SUB1"))
            .expect_err("notification before welcome");
        assert!(err.is_fatal());
    }

    #[test]
    fn abandoned_migration_returns_to_open() {
        let mut core = open_core_with_sub1();
        let reconnect = WireMessage::reconnect("c1", "S1", "wss://next.example/ws")
            .to_text()
            .expect("encode");
        assert!(matches!(core.handle_text(&reconnect), Step::Migrate { .. }));

        core.abandon_migration();
        assert_eq!(core.status(), SessionStatus::Open);
    }

    #[test]
    fn welcome_after_lost_connection_is_recovered() {
        let mut core = open_core_with_sub1();
        core.connection_lost();
        assert_eq!(core.status(), SessionStatus::Reconnecting);
        assert_eq!(core.session_id(), None);

        match core.handle_text(&welcome("w2", "S2")) {
            Step::Opened {
                session_id, kind, ..
            } => {
                assert_eq!(session_id, "S2");
                assert_eq!(kind, WelcomeKind::Recovered);
            }
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(
            core.registry().lookup("SUB1").map(|s| s.status),
            Ok(SubscriptionStatus::Enabled)
        );
    }

    #[test]
    fn second_welcome_on_open_session_is_fatal() {
        let mut core = open_core_with_sub1();
        assert!(matches!(
            core.handle_text(&welcome("w2", "S1")),
            Step::Fatal(EventSubError::ProtocolViolation(_))
        ));
    }
}
