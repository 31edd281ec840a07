//! Twitch EventSub over websocket.
//!
//! Frames flow from the connection worker through the session state machine
//! and the payload decoder into per-event-type dispatch lanes. The registry of
//! live subscriptions is owned by the session worker; applications reach it
//! through [`ClientHandle`].

/// Client facade, options and control handle.
pub mod client;
/// Websocket worker driving the session state machine.
pub mod connection;
/// Frame decoding into control messages and event records.
pub mod decode;
/// Per-event-type handler lanes and the error hook.
pub mod dispatch;
/// Error taxonomy shared by the session and client.
pub mod error;
/// Typed notification payloads.
pub mod events;
/// Wire messages of the EventSub websocket and subscription objects.
pub mod proto;
/// In-memory subscription registry.
pub mod registry;
/// Sans-IO session state machine.
pub mod session;

pub use client::{
    ClientHandle, EventSubClient, EventSubDefaults, EventSubOptions, EVENTSUB_ENDPOINT,
    LOCAL_EVENTSUB_ENDPOINT,
};
pub use connection::SessionSnapshot;
pub use decode::{EventPayload, EventRecord, KNOWN_EVENT_TYPES, REVOCATION_EVENT_TYPE};
pub use dispatch::HandlerError;
pub use error::EventSubError;
pub use registry::{Subscription, SubscriptionStatus};
pub use session::{SessionStatus, WelcomeKind};
