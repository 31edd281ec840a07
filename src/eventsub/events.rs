//! Typed notification payloads.
//!
//! Field names follow the EventSub JSON so every struct deserializes straight
//! from `payload.event`. Optional fields are ones the service omits or sends
//! as `null` for some channels.

use serde::{Deserialize, Serialize};

/// Broadcaster the event belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BroadcasterRef {
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
    pub broadcaster_user_name: String,
}

/// User that triggered the event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRef {
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FollowEvent {
    #[serde(flatten)]
    pub user: UserRef,
    #[serde(flatten)]
    pub broadcaster: BroadcasterRef,
    #[serde(default)]
    pub followed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeEvent {
    #[serde(flatten)]
    pub user: UserRef,
    #[serde(flatten)]
    pub broadcaster: BroadcasterRef,
    pub tier: String,
    #[serde(default)]
    pub is_gift: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheerEvent {
    pub is_anonymous: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_login: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(flatten)]
    pub broadcaster: BroadcasterRef,
    pub message: String,
    pub bits: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaidEvent {
    pub from_broadcaster_user_id: String,
    pub from_broadcaster_user_login: String,
    pub from_broadcaster_user_name: String,
    pub to_broadcaster_user_id: String,
    pub to_broadcaster_user_login: String,
    pub to_broadcaster_user_name: String,
    pub viewers: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelUpdateEvent {
    #[serde(flatten)]
    pub broadcaster: BroadcasterRef,
    pub title: String,
    pub language: String,
    pub category_id: String,
    pub category_name: String,
    #[serde(default)]
    pub content_classification_labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamOnlineEvent {
    pub id: String,
    #[serde(flatten)]
    pub broadcaster: BroadcasterRef,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamOfflineEvent {
    #[serde(flatten)]
    pub broadcaster: BroadcasterRef,
}

/// Monetary amount expressed as an integer plus decimal places, e.g.
/// `value: 550, decimal_places: 2, currency: "USD"` is 5.50 USD.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DonationAmount {
    pub value: i64,
    pub decimal_places: u32,
    pub currency: String,
}

impl DonationAmount {
    /// Amount as a floating point value in the currency's major unit.
    pub fn as_major_units(&self) -> f64 {
        self.value as f64 / 10f64.powi(self.decimal_places as i32)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CharityDonationEvent {
    pub id: String,
    pub campaign_id: String,
    #[serde(flatten)]
    pub broadcaster: BroadcasterRef,
    #[serde(flatten)]
    pub user: UserRef,
    pub charity_name: String,
    pub charity_description: String,
    pub charity_logo: String,
    pub charity_website: String,
    pub amount: DonationAmount,
}

/// Shared shape of the charity campaign start/progress/stop events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CharityCampaignEvent {
    pub id: String,
    #[serde(flatten)]
    pub broadcaster: BroadcasterRef,
    pub charity_name: String,
    pub charity_description: String,
    pub charity_logo: String,
    pub charity_website: String,
    pub current_amount: DonationAmount,
    pub target_amount: DonationAmount,
    /// Present on `channel.charity_campaign.start`.
    #[serde(default)]
    pub started_at: Option<String>,
    /// Present on `channel.charity_campaign.stop`.
    #[serde(default)]
    pub stopped_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    Follow,
    Subscription,
    SubscriptionCount,
    NewSubscription,
    NewSubscriptionCount,
    NewBit,
    NewCheerer,
}

/// Shared shape of the goal begin/progress/end events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GoalEvent {
    pub id: String,
    #[serde(flatten)]
    pub broadcaster: BroadcasterRef,
    #[serde(rename = "type")]
    pub goal_type: GoalType,
    pub description: String,
    #[serde(default)]
    pub is_achieved: Option<bool>,
    pub current_amount: i64,
    pub target_amount: i64,
    pub started_at: String,
    #[serde(default)]
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntitlementData {
    pub organization_id: String,
    pub category_id: String,
    pub category_name: String,
    pub campaign_id: String,
    pub user_id: String,
    pub user_name: String,
    pub user_login: String,
    pub entitlement_id: String,
    pub benefit_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropEntitlementGrantEvent {
    pub id: String,
    pub data: Vec<EntitlementData>,
}

/// Synthesized from a `revocation` control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationEvent {
    /// Type of the subscription that was revoked, e.g. `channel.follow`.
    pub subscription_type: String,
    pub subscription_version: String,
    /// Server-supplied reason such as `authorization_revoked` or
    /// `user_removed`.
    pub reason: String,
}
