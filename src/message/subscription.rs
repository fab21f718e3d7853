use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use super::index_key;

/// Lifecycle of a subscription
///
/// `Opening -> Opened -> Correlating -> Closed`, where `Opened` is the waiting
/// state. A subscription may be closed from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionState {
    Opening,
    Opened,
    Correlating,
    Closed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionState::Opening => "OPENING",
            SubscriptionState::Opened => "OPENED",
            SubscriptionState::Correlating => "CORRELATING",
            SubscriptionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// The wait of an element instance on a named message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Key of the waiting element instance
    pub element_key: u64,
    pub instance_key: u64,
    pub element_id: String,
    pub message_name: String,
    pub correlation_key: String,
    pub state: SubscriptionState,
    /// The message being correlated, once a match was chosen
    #[serde(default)]
    pub message_key: Option<u64>,
}

impl Subscription {
    pub fn new(
        element_key: u64,
        instance_key: u64,
        element_id: impl Into<String>,
        message_name: impl Into<String>,
        correlation_key: impl Into<String>,
    ) -> Self {
        Self {
            element_key,
            instance_key,
            element_id: element_id.into(),
            message_name: message_name.into(),
            correlation_key: correlation_key.into(),
            state: SubscriptionState::Opening,
            message_key: None,
        }
    }
}

/// Tracks the subscriptions of a partition
///
/// A subscription is unique per `(instance key, element id)` while it is not
/// closed. Only opened subscriptions are visible to correlation.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionRegistry {
    subscriptions: HashMap<u64, Subscription>,
    elements: HashMap<(u64, String), u64>,
    // (name, correlation key) -> element keys; keys grow with activation order
    opened: HashMap<(String, String), BTreeSet<u64>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, element_key: u64) -> Option<&Subscription> {
        self.subscriptions.get(&element_key)
    }

    /// Find the subscription of an element of a process instance
    pub fn find(&self, instance_key: u64, element_id: &str) -> Option<&Subscription> {
        self.elements
            .get(&(instance_key, element_id.to_string()))
            .and_then(|key| self.subscriptions.get(key))
    }

    /// Register a new subscription in the `Opening` state
    ///
    /// Returns false if the element already has a subscription.
    pub fn open(&mut self, subscription: Subscription) -> bool {
        let element = (subscription.instance_key, subscription.element_id.clone());
        if self.elements.contains_key(&element)
            || self.subscriptions.contains_key(&subscription.element_key)
        {
            return false;
        }

        let mut subscription = subscription;
        subscription.state = SubscriptionState::Opening;
        subscription.message_key = None;
        self.elements.insert(element, subscription.element_key);
        self.subscriptions
            .insert(subscription.element_key, subscription);
        true
    }

    /// Move an opening subscription to the waiting state
    pub fn opened(&mut self, element_key: u64) -> bool {
        let Some(sub) = self.subscriptions.get_mut(&element_key) else {
            return false;
        };
        if sub.state != SubscriptionState::Opening {
            return false;
        }
        sub.state = SubscriptionState::Opened;
        self.opened
            .entry(index_key(&sub.message_name, &sub.correlation_key))
            .or_default()
            .insert(element_key);
        true
    }

    /// Reserve a waiting subscription for the given message
    ///
    /// The subscription is no longer visible to correlation. An opening
    /// subscription may be reserved too, when the partition owning its
    /// correlation key matched it before the confirmation arrived.
    pub fn correlating(&mut self, element_key: u64, message_key: u64) -> bool {
        let Some(sub) = self.subscriptions.get_mut(&element_key) else {
            return false;
        };
        if !matches!(
            sub.state,
            SubscriptionState::Opening | SubscriptionState::Opened
        ) {
            return false;
        }
        sub.state = SubscriptionState::Correlating;
        sub.message_key = Some(message_key);
        let idx = index_key(&sub.message_name, &sub.correlation_key);
        Self::unindex(&mut self.opened, idx, element_key);
        true
    }

    /// Close a subscription in any state, returning it
    pub fn close(&mut self, element_key: u64) -> Option<Subscription> {
        let mut sub = self.subscriptions.remove(&element_key)?;
        self.elements
            .remove(&(sub.instance_key, sub.element_id.clone()));
        if sub.state == SubscriptionState::Opened {
            let idx = index_key(&sub.message_name, &sub.correlation_key);
            Self::unindex(&mut self.opened, idx, element_key);
        }
        sub.state = SubscriptionState::Closed;
        Some(sub)
    }

    fn unindex(
        opened: &mut HashMap<(String, String), BTreeSet<u64>>,
        idx: (String, String),
        element_key: u64,
    ) {
        if let Some(keys) = opened.get_mut(&idx) {
            keys.remove(&element_key);
            if keys.is_empty() {
                opened.remove(&idx);
            }
        }
    }

    /// The opened subscription of the oldest element waiting on `(name, correlation_key)`
    pub fn first_opened(&self, name: &str, correlation_key: &str) -> Option<&Subscription> {
        self.opened
            .get(&index_key(name, correlation_key))?
            .iter()
            .next()
            .and_then(|key| self.subscriptions.get(key))
    }

    /// Every opened subscription waiting on `(name, correlation_key)`, oldest element first
    pub fn opened_for(&self, name: &str, correlation_key: &str) -> Vec<&Subscription> {
        self.opened
            .get(&index_key(name, correlation_key))
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| self.subscriptions.get(key))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keys of the subscriptions of a process instance
    pub fn of_instance(&self, instance_key: u64) -> Vec<u64> {
        let mut keys: Vec<u64> = self
            .subscriptions
            .values()
            .filter(|s| s.instance_key == instance_key)
            .map(|s| s.element_key)
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(element_key: u64, instance_key: u64, key: &str) -> Subscription {
        Subscription::new(element_key, instance_key, "catch-event", "order canceled", key)
    }

    #[test]
    fn it_follows_the_subscription_lifecycle() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.open(subscription(10, 1, "o-1")));
        assert_eq!(registry.get(10).unwrap().state, SubscriptionState::Opening);
        // not visible until opened
        assert!(registry.first_opened("order canceled", "o-1").is_none());

        assert!(registry.opened(10));
        assert_eq!(
            registry.first_opened("order canceled", "o-1").map(|s| s.element_key),
            Some(10)
        );

        assert!(registry.correlating(10, 99));
        let sub = registry.get(10).unwrap();
        assert_eq!(sub.state, SubscriptionState::Correlating);
        assert_eq!(sub.message_key, Some(99));
        assert!(registry.first_opened("order canceled", "o-1").is_none());

        let closed = registry.close(10).unwrap();
        assert_eq!(closed.state, SubscriptionState::Closed);
        assert!(registry.is_empty());
        assert!(registry.find(1, "catch-event").is_none());
    }

    #[test]
    fn it_rejects_invalid_transitions() {
        let mut registry = SubscriptionRegistry::new();
        assert!(!registry.opened(10));
        assert!(!registry.correlating(10, 99));
        assert!(registry.open(subscription(10, 1, "o-1")));
        assert!(registry.opened(10));
        assert!(!registry.opened(10));
        assert!(registry.correlating(10, 99));
        assert!(!registry.correlating(10, 100));
        assert!(!registry.opened(10));
    }

    #[test]
    fn it_reserves_an_opening_subscription() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.open(subscription(10, 1, "o-1")));
        assert!(registry.correlating(10, 99));
        assert_eq!(
            registry.get(10).map(|s| s.state),
            Some(SubscriptionState::Correlating)
        );
        assert!(registry.first_opened("order canceled", "o-1").is_none());
    }

    #[test]
    fn it_keeps_one_subscription_per_element() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.open(subscription(10, 1, "o-1")));
        assert!(!registry.open(subscription(11, 1, "o-1")));
        assert!(registry.open(subscription(12, 2, "o-1")));

        registry.close(10);
        assert!(registry.open(subscription(13, 1, "o-1")));
    }

    #[test]
    fn it_orders_matches_by_element_key() {
        let mut registry = SubscriptionRegistry::new();
        for (key, instance) in [(30, 3), (20, 2), (40, 4)] {
            registry.open(subscription(key, instance, "o-1"));
        }
        registry.opened(40);
        registry.opened(20);
        registry.opened(30);

        let keys: Vec<u64> = registry
            .opened_for("order canceled", "o-1")
            .iter()
            .map(|s| s.element_key)
            .collect();
        assert_eq!(keys, vec![20, 30, 40]);
        assert_eq!(registry.of_instance(3), vec![30]);

        registry.close(20);
        assert_eq!(
            registry.first_opened("order canceled", "o-1").map(|s| s.element_key),
            Some(30)
        );
    }
}
