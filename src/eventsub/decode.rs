//! Frame decoding.
//!
//! Turns one websocket text frame into either a session control message or
//! an [`EventRecord`]. Decoding is pure: it never looks at session state, so
//! the same text always decodes to the same value.
//!
//! Notification payloads are routed by event type name through a single
//! table ([`KNOWN_EVENT_TYPES`]). Names missing from the table decode to
//! [`EventPayload::Generic`] so new service-side event types never break the
//! client.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::eventsub::events::{
    ChannelUpdateEvent, CharityCampaignEvent, CharityDonationEvent, CheerEvent,
    DropEntitlementGrantEvent, FollowEvent, GoalEvent, RaidEvent, RevocationEvent,
    StreamOfflineEvent, StreamOnlineEvent, SubscribeEvent,
};
use crate::eventsub::proto::{
    MessageTypeMsg, MetadataMsg, NotificationPayloadMsg, RevocationPayloadMsg, SessionPayloadMsg,
    SubscriptionMsg, WireMessage,
};
use crate::eventsub::registry::Subscription;

/// Event type used for records synthesized from revocation messages.
pub const REVOCATION_EVENT_TYPE: &str = "revocation";

macro_rules! known_events {
    ($($name:literal => $variant:ident($ty:ty)),+ $(,)?) => {
        /// Decoded notification body.
        #[derive(Debug, Clone, PartialEq)]
        pub enum EventPayload {
            $($variant($ty),)+
            /// Server revoked the subscription the record belongs to.
            Revocation(RevocationEvent),
            /// Event type without a typed shape; holds the raw `event` JSON.
            Generic(Value),
        }

        /// Event type names with a typed decoding strategy.
        pub const KNOWN_EVENT_TYPES: &[&str] = &[$($name),+];

        fn decode_payload(event_type: &str, event: Value) -> Result<EventPayload, serde_json::Error> {
            match event_type {
                $($name => typed::<$ty>(event).map(EventPayload::$variant),)+
                _ => Ok(EventPayload::Generic(event)),
            }
        }
    };
}

known_events! {
    "channel.follow" => Follow(FollowEvent),
    "channel.subscribe" => Subscribe(SubscribeEvent),
    "channel.cheer" => Cheer(CheerEvent),
    "channel.raid" => Raid(RaidEvent),
    "channel.update" => ChannelUpdate(ChannelUpdateEvent),
    "stream.online" => StreamOnline(StreamOnlineEvent),
    "stream.offline" => StreamOffline(StreamOfflineEvent),
    "channel.charity_campaign.donate" => CharityDonation(CharityDonationEvent),
    "channel.charity_campaign.start" => CharityCampaignStart(CharityCampaignEvent),
    "channel.charity_campaign.progress" => CharityCampaignProgress(CharityCampaignEvent),
    "channel.charity_campaign.stop" => CharityCampaignStop(CharityCampaignEvent),
    "channel.goal.begin" => GoalBegin(GoalEvent),
    "channel.goal.progress" => GoalProgress(GoalEvent),
    "channel.goal.end" => GoalEnd(GoalEvent),
    "drop.entitlement.grant" => DropEntitlementGrant(DropEntitlementGrantEvent),
}

fn typed<T: DeserializeOwned>(event: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(event)
}

/// Immutable decoded notification.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_type: String,
    pub subscription_id: String,
    pub subscription_version: String,
    pub message_id: String,
    pub payload: EventPayload,
}

impl EventRecord {
    /// Builds the record delivered to `revocation` handlers.
    pub fn revocation(message_id: &str, subscription: &Subscription, reason: &str) -> Self {
        Self {
            event_type: REVOCATION_EVENT_TYPE.to_string(),
            subscription_id: subscription.id.clone(),
            subscription_version: subscription.version.clone(),
            message_id: message_id.to_string(),
            payload: EventPayload::Revocation(RevocationEvent {
                subscription_type: subscription.event_type.clone(),
                subscription_version: subscription.version.clone(),
                reason: reason.to_string(),
            }),
        }
    }

    /// Returns whether the payload fell back to the untyped variant.
    pub fn is_generic(&self) -> bool {
        matches!(self.payload, EventPayload::Generic(_))
    }
}

/// Session-management message; never handed to application handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Welcome {
        session_id: String,
        keepalive: Duration,
    },
    Keepalive,
    Reconnect {
        session_id: String,
        reconnect_url: String,
    },
    Revocation {
        subscription: Subscription,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Control(ControlMessage),
    Event(EventRecord),
}

/// One decoded websocket frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message_id: String,
    pub body: FrameBody,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not a valid message envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),

    #[error("{kind} payload is malformed: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("welcome keepalive must be a positive number of seconds")]
    InvalidKeepalive,

    #[error("session_reconnect without reconnect_url")]
    MissingReconnectUrl,

    #[error("{0} without a subscription type")]
    MissingSubscriptionType(&'static str),

    #[error("`{event_type}` event does not match its typed shape: {source}")]
    Event {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decodes one text frame.
pub fn decode_frame(text: &str) -> Result<Frame, DecodeError> {
    let message = WireMessage::from_text(text)?;
    let kind = MessageTypeMsg::from_wire(&message.metadata.message_type)
        .ok_or_else(|| DecodeError::UnknownMessageType(message.metadata.message_type.clone()))?;
    let message_id = message.metadata.message_id.clone();

    let body = match kind {
        MessageTypeMsg::SessionWelcome => {
            let session = payload::<SessionPayloadMsg>(kind, message.payload)?.session;
            let keepalive = session
                .keepalive_timeout_seconds
                .filter(|seconds| *seconds > 0)
                .ok_or(DecodeError::InvalidKeepalive)?;
            FrameBody::Control(ControlMessage::Welcome {
                session_id: session.id,
                keepalive: Duration::from_secs(keepalive),
            })
        }
        MessageTypeMsg::SessionKeepalive => FrameBody::Control(ControlMessage::Keepalive),
        MessageTypeMsg::SessionReconnect => {
            let session = payload::<SessionPayloadMsg>(kind, message.payload)?.session;
            let reconnect_url = session
                .reconnect_url
                .filter(|url| !url.is_empty())
                .ok_or(DecodeError::MissingReconnectUrl)?;
            FrameBody::Control(ControlMessage::Reconnect {
                session_id: session.id,
                reconnect_url,
            })
        }
        MessageTypeMsg::Revocation => {
            let mut subscription =
                payload::<RevocationPayloadMsg>(kind, message.payload)?.subscription;
            fill_from_metadata(&mut subscription, &message.metadata);
            if subscription.event_type.is_empty() {
                return Err(DecodeError::MissingSubscriptionType(kind.as_str()));
            }
            let reason = subscription.status.clone();
            FrameBody::Control(ControlMessage::Revocation {
                subscription: subscription.into(),
                reason,
            })
        }
        MessageTypeMsg::Notification => {
            let mut notification = payload::<NotificationPayloadMsg>(kind, message.payload)?;
            fill_from_metadata(&mut notification.subscription, &message.metadata);
            if notification.subscription.event_type.is_empty() {
                return Err(DecodeError::MissingSubscriptionType(kind.as_str()));
            }
            FrameBody::Event(decode_event(
                &message_id,
                &notification.subscription.event_type,
                &notification.subscription.version,
                &notification.subscription.id,
                notification.event,
            )?)
        }
    };

    Ok(Frame { message_id, body })
}

/// Decodes a notification body with the strategy registered for
/// `event_type`, falling back to [`EventPayload::Generic`].
pub fn decode_event(
    message_id: &str,
    event_type: &str,
    version: &str,
    subscription_id: &str,
    event: Value,
) -> Result<EventRecord, DecodeError> {
    let payload = decode_payload(event_type, event).map_err(|source| DecodeError::Event {
        event_type: event_type.to_string(),
        source,
    })?;

    Ok(EventRecord {
        event_type: event_type.to_string(),
        subscription_id: subscription_id.to_string(),
        subscription_version: version.to_string(),
        message_id: message_id.to_string(),
        payload,
    })
}

/// Uses the metadata type and version where the subscription omits them.
fn fill_from_metadata(subscription: &mut SubscriptionMsg, metadata: &MetadataMsg) {
    if subscription.event_type.is_empty() {
        if let Some(event_type) = &metadata.subscription_type {
            subscription.event_type = event_type.clone();
        }
    }
    if subscription.version.is_empty() {
        if let Some(version) = &metadata.subscription_version {
            subscription.version = version.clone();
        }
    }
}

fn payload<T: DeserializeOwned>(kind: MessageTypeMsg, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::Payload {
        kind: kind.as_str(),
        source,
    })
}
