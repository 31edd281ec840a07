use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Filter attached to a subscription, e.g. `broadcaster_user_id`.
pub type Condition = BTreeMap<String, String>;

/// `metadata.message_type` values, parsed with [`MessageTypeMsg::from_wire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTypeMsg {
    SessionWelcome,
    SessionKeepalive,
    SessionReconnect,
    Notification,
    Revocation,
}

impl MessageTypeMsg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionWelcome => "session_welcome",
            Self::SessionKeepalive => "session_keepalive",
            Self::SessionReconnect => "session_reconnect",
            Self::Notification => "notification",
            Self::Revocation => "revocation",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "session_welcome" => Some(Self::SessionWelcome),
            "session_keepalive" => Some(Self::SessionKeepalive),
            "session_reconnect" => Some(Self::SessionReconnect),
            "notification" => Some(Self::Notification),
            "revocation" => Some(Self::Revocation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataMsg {
    pub message_id: String,
    /// Kept as a raw string so unknown kinds surface as a decode error on
    /// one frame instead of failing envelope parsing.
    pub message_type: String,
    pub message_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_version: Option<String>,
}

/// Envelope shared by every EventSub websocket frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    pub metadata: MetadataMsg,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMsg {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionPayloadMsg {
    pub session: SessionMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportMsg {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl TransportMsg {
    pub fn websocket(session_id: impl Into<String>) -> Self {
        Self {
            method: "websocket".to_string(),
            session_id: Some(session_id.into()),
        }
    }
}

/// Subscription object as carried by notifications, revocations and Helix
/// responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionMsg {
    pub id: String,
    pub status: String,
    /// Empty when omitted; the decoder falls back to `metadata.subscription_type`.
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportMsg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPayloadMsg {
    pub subscription: SubscriptionMsg,
    pub event: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevocationPayloadMsg {
    pub subscription: SubscriptionMsg,
}

/// Body of `POST /eventsub/subscriptions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateSubscriptionBody {
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: String,
    pub condition: Condition,
    pub transport: TransportMsg,
}

/// Envelope returned by the Helix subscription endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionListMsg {
    pub data: Vec<SubscriptionMsg>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub total_cost: u64,
    #[serde(default)]
    pub max_total_cost: u64,
}

impl WireMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Builds a `session_welcome` frame.
    pub fn welcome(message_id: &str, session_id: &str, keepalive_timeout_seconds: u64) -> Self {
        Self::session_frame(
            message_id,
            MessageTypeMsg::SessionWelcome,
            SessionMsg {
                id: session_id.to_string(),
                status: Some("connected".to_string()),
                keepalive_timeout_seconds: Some(keepalive_timeout_seconds),
                reconnect_url: None,
                connected_at: None,
            },
        )
    }

    /// Builds a `session_keepalive` frame.
    pub fn keepalive(message_id: &str) -> Self {
        Self {
            metadata: metadata(message_id, MessageTypeMsg::SessionKeepalive, None),
            payload: Value::Object(Default::default()),
        }
    }

    /// Builds a `session_reconnect` frame pointing at `reconnect_url`.
    pub fn reconnect(message_id: &str, session_id: &str, reconnect_url: &str) -> Self {
        Self::session_frame(
            message_id,
            MessageTypeMsg::SessionReconnect,
            SessionMsg {
                id: session_id.to_string(),
                status: Some("reconnecting".to_string()),
                keepalive_timeout_seconds: None,
                reconnect_url: Some(reconnect_url.to_string()),
                connected_at: None,
            },
        )
    }

    /// Builds a `notification` frame for `subscription` carrying `event`.
    pub fn notification(message_id: &str, subscription: SubscriptionMsg, event: Value) -> Self {
        let meta = metadata(
            message_id,
            MessageTypeMsg::Notification,
            Some((subscription.event_type.as_str(), subscription.version.as_str())),
        );
        Self {
            metadata: meta,
            payload: serde_json::to_value(NotificationPayloadMsg {
                subscription,
                event,
            })
            .unwrap_or(Value::Null),
        }
    }

    /// Builds a `revocation` frame; `subscription.status` carries the reason.
    pub fn revocation(message_id: &str, subscription: SubscriptionMsg) -> Self {
        let meta = metadata(
            message_id,
            MessageTypeMsg::Revocation,
            Some((subscription.event_type.as_str(), subscription.version.as_str())),
        );
        Self {
            metadata: meta,
            payload: serde_json::to_value(RevocationPayloadMsg { subscription })
                .unwrap_or(Value::Null),
        }
    }

    fn session_frame(message_id: &str, kind: MessageTypeMsg, session: SessionMsg) -> Self {
        Self {
            metadata: metadata(message_id, kind, None),
            payload: serde_json::to_value(SessionPayloadMsg { session }).unwrap_or(Value::Null),
        }
    }
}

fn metadata(message_id: &str, kind: MessageTypeMsg, subscription: Option<(&str, &str)>) -> MetadataMsg {
    MetadataMsg {
        message_id: message_id.to_string(),
        message_type: kind.as_str().to_string(),
        message_timestamp: "2024-01-01T00:00:00.000000000Z".to_string(),
        subscription_type: subscription.map(|(event_type, _)| event_type.to_string()),
        subscription_version: subscription.map(|(_, version)| version.to_string()),
    }
}
