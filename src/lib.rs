//! Rust client for Twitch EventSub.
//!
//! The crate is organized by transport surface:
//! - `eventsub`: websocket session, payload decoding and event dispatch.
//! - `helix`: HTTP client for subscription management and token validation.
//! - `retry`: shared retry and backoff utilities.

/// EventSub websocket client, protocol types and dispatch.
pub mod eventsub;
/// Helix subscription API client and request/response types.
pub mod helix;
/// Retry and backoff helpers used across the SDK.
pub mod retry;

pub use eventsub::{ClientHandle, EventSubClient, EventSubError, EventSubOptions};
pub use helix::{HelixClient, HelixError, SubscriptionApi, SubscriptionRequest};
pub use retry::RetryPolicy;
