use thiserror::Error;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::eventsub::decode::DecodeError;
use crate::eventsub::registry::RegistryError;
use crate::helix::HelixError;

/// Errors produced by the EventSub session, dispatcher and client.
///
/// Frame- and handler-scoped variants are reported through the error hook
/// and never end the session; see [`EventSubError::is_fatal`].
#[derive(Debug, Error)]
pub enum EventSubError {
    /// Control messages arrived out of order, e.g. a notification before
    /// `session_welcome`.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A single frame could not be decoded and was dropped.
    #[error("dropped malformed frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("subscription {0} is already registered")]
    DuplicateSubscription(String),

    #[error("subscription {0} is not registered")]
    NotFound(String),

    /// Notification for a subscription the registry does not know about.
    #[error("dropped `{event_type}` notification for unknown subscription {subscription_id}")]
    UnknownSubscription {
        subscription_id: String,
        event_type: String,
    },

    /// Connection dropped, timed out, or failed to open.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("session lost after {attempts} reconnect attempts")]
    ReconnectsExhausted { attempts: usize },

    /// The bearer credential was rejected; refresh it and run again.
    #[error("credential expired or was rejected")]
    AuthExpired,

    /// An application handler returned an error, panicked or timed out.
    #[error("`{event_type}` handler failed: {message}")]
    Handler { event_type: String, message: String },

    #[error("helix request failed: {0}")]
    Helix(HelixError),

    #[error("invalid credential header: {0}")]
    InvalidCredentialHeader(#[from] InvalidHeaderValue),

    /// The client was closed or its session task is gone.
    #[error("client is closed")]
    Closed,
}

impl EventSubError {
    /// Returns whether this error ends `run`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_) | Self::ReconnectsExhausted { .. } | Self::AuthExpired
        )
    }
}

impl From<RegistryError> for EventSubError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateSubscription(id) => Self::DuplicateSubscription(id),
            RegistryError::NotFound(id) => Self::NotFound(id),
        }
    }
}

impl From<HelixError> for EventSubError {
    fn from(err: HelixError) -> Self {
        match err {
            HelixError::Unauthorized { .. } => Self::AuthExpired,
            HelixError::Conflict { body } => Self::DuplicateSubscription(body),
            other => Self::Helix(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_session_integrity_failures_are_fatal() {
        assert!(EventSubError::ProtocolViolation("early notification".into()).is_fatal());
        assert!(EventSubError::AuthExpired.is_fatal());
        assert!(EventSubError::ReconnectsExhausted { attempts: 6 }.is_fatal());

        assert!(!EventSubError::NotFound("SUB1".into()).is_fatal());
        assert!(!EventSubError::Transport("reset".into()).is_fatal());
        assert!(!EventSubError::Handler {
            event_type: "channel.follow".into(),
            message: "boom".into(),
        }
        .is_fatal());
    }

    #[test]
    fn unauthorized_helix_response_means_auth_expired() {
        let err: EventSubError = HelixError::Unauthorized {
            body: "Invalid OAuth token".into(),
        }
        .into();
        assert!(matches!(err, EventSubError::AuthExpired));

        let err: EventSubError = HelixError::Conflict {
            body: "subscription already exists".into(),
        }
        .into();
        assert!(matches!(err, EventSubError::DuplicateSubscription(_)));

        let err: EventSubError = HelixError::Forbidden { body: String::new() }.into();
        assert!(matches!(err, EventSubError::Helix(HelixError::Forbidden { .. })));
    }

    #[test]
    fn registry_errors_keep_their_kind() {
        let err: EventSubError = RegistryError::DuplicateSubscription("SUB1".into()).into();
        assert!(matches!(err, EventSubError::DuplicateSubscription(id) if id == "SUB1"));
    }
}
