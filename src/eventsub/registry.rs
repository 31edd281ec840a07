//! In-memory subscription registry.
//!
//! Owned by the session worker, which is its only writer. Nothing here is
//! persisted; after a hard reconnect the client recreates every entry
//! against the new session.

use std::collections::HashMap;

use thiserror::Error;

use crate::eventsub::proto::{Condition, SubscriptionMsg};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionStatus {
    Enabled,
    Revoked,
    Unknown,
}

impl SubscriptionStatus {
    /// Maps the status string used by the service.
    ///
    /// `webhook_callback_verification_pending` and friends never apply to a
    /// websocket transport, so anything other than `enabled` is `Unknown`
    /// until the server revokes it.
    pub fn from_wire(status: &str) -> Self {
        match status {
            "enabled" => Self::Enabled,
            "authorization_revoked" | "user_removed" | "version_removed" => Self::Revoked,
            _ => Self::Unknown,
        }
    }
}

/// One standing request to receive notifications of an event type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub event_type: String,
    pub version: String,
    pub condition: Condition,
    pub status: SubscriptionStatus,
    pub created_at: Option<String>,
    pub cost: u64,
}

impl Subscription {
    /// Returns whether this subscription was created for the same
    /// type/version/condition triple.
    pub fn matches(&self, event_type: &str, version: &str, condition: &Condition) -> bool {
        self.event_type == event_type && self.version == version && &self.condition == condition
    }
}

impl From<SubscriptionMsg> for Subscription {
    fn from(msg: SubscriptionMsg) -> Self {
        Self {
            status: SubscriptionStatus::from_wire(&msg.status),
            id: msg.id,
            event_type: msg.event_type,
            version: msg.version,
            condition: msg.condition,
            created_at: msg.created_at,
            cost: msg.cost.unwrap_or(0),
        }
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("subscription {0} is already registered")]
    DuplicateSubscription(String),

    #[error("subscription {0} is not registered")]
    NotFound(String),
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a confirmed subscription.
    pub fn register(&mut self, subscription: Subscription) -> Result<(), RegistryError> {
        if self.entries.contains_key(&subscription.id) {
            return Err(RegistryError::DuplicateSubscription(subscription.id));
        }
        self.entries.insert(subscription.id.clone(), subscription);
        Ok(())
    }

    /// Marks a subscription revoked and removes it, returning the final
    /// record.
    pub fn revoke(&mut self, id: &str) -> Result<Subscription, RegistryError> {
        let mut subscription = self
            .entries
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        subscription.status = SubscriptionStatus::Revoked;
        Ok(subscription)
    }

    /// Removes a subscription after a client-initiated unsubscribe.
    pub fn remove(&mut self, id: &str) -> Result<Subscription, RegistryError> {
        self.entries
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn lookup(&self, id: &str) -> Result<&Subscription, RegistryError> {
        self.entries
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Current subscriptions in no particular order.
    ///
    /// The iterator is `Clone`, so callers can walk it more than once.
    pub fn all(&self) -> impl Iterator<Item = &Subscription> + Clone + '_ {
        self.entries.values()
    }

    /// Finds a registered subscription for the same request, if any.
    pub fn find_matching(
        &self,
        event_type: &str,
        version: &str,
        condition: &Condition,
    ) -> Option<&Subscription> {
        self.all()
            .find(|subscription| subscription.matches(event_type, version, condition))
    }

    /// Removes and returns every entry.
    pub fn drain(&mut self) -> Vec<Subscription> {
        self.entries.drain().map(|(_, subscription)| subscription).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn follow(id: &str) -> Subscription {
        let mut condition = Condition::new();
        condition.insert("broadcaster_user_id".to_string(), "1337".to_string());
        condition.insert("moderator_user_id".to_string(), "1337".to_string());
        Subscription {
            id: id.to_string(),
            event_type: "channel.follow".to_string(),
            version: "2".to_string(),
            condition,
            status: SubscriptionStatus::Enabled,
            created_at: None,
            cost: 0,
        }
    }

    #[test]
    fn register_rejects_duplicate_ids() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(follow("SUB1")).expect("first insert");

        let err = registry.register(follow("SUB1")).expect_err("duplicate");
        assert_eq!(err, RegistryError::DuplicateSubscription("SUB1".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn revoke_marks_status_and_removes() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(follow("SUB1")).expect("insert");

        let revoked = registry.revoke("SUB1").expect("revoke");
        assert_eq!(revoked.status, SubscriptionStatus::Revoked);
        assert!(!registry.contains("SUB1"));
        assert_eq!(
            registry.revoke("SUB1"),
            Err(RegistryError::NotFound("SUB1".to_string()))
        );
    }

    #[test]
    fn lookup_reports_missing_ids() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(
            registry.lookup("nope"),
            Err(RegistryError::NotFound("nope".to_string()))
        );
    }

    #[test]
    fn all_can_be_walked_twice() {
        let mut registry = SubscriptionRegistry::new();
        registry.register(follow("SUB1")).expect("insert");
        registry.register(follow("SUB2")).expect("insert");

        let iter = registry.all();
        let first: Vec<_> = iter.clone().map(|s| s.id.clone()).collect();
        let second: Vec<_> = iter.map(|s| s.id.clone()).collect();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn find_matching_compares_condition() {
        let mut registry = SubscriptionRegistry::new();
        let subscription = follow("SUB1");
        let condition = subscription.condition.clone();
        registry.register(subscription).expect("insert");

        assert!(registry
            .find_matching("channel.follow", "2", &condition)
            .is_some());
        assert!(registry
            .find_matching("channel.follow", "2", &Condition::new())
            .is_none());
        assert!(registry
            .find_matching("channel.follow", "1", &condition)
            .is_none());
    }

    #[test]
    fn status_mapping_covers_revocation_reasons() {
        assert_eq!(SubscriptionStatus::from_wire("enabled"), SubscriptionStatus::Enabled);
        assert_eq!(
            SubscriptionStatus::from_wire("user_removed"),
            SubscriptionStatus::Revoked
        );
        assert_eq!(
            SubscriptionStatus::from_wire("websocket_disconnected"),
            SubscriptionStatus::Unknown
        );
    }
}
