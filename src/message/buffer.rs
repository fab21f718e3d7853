use std::collections::{BTreeSet, HashMap};

use super::{index_key, Message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedMessage {
    pub key: u64,
    pub message: Message,
    /// Time (ms) at which the message stops being eligible for correlation
    pub deadline: u64,
}

/// Messages awaiting late correlation and the ids retained for deduplication
#[derive(Debug, Default, Clone)]
pub struct MessageBuffer {
    messages: HashMap<u64, BufferedMessage>,
    // (name, correlation key) -> message keys in publish order
    index: HashMap<(String, String), BTreeSet<u64>>,
    deadlines: BTreeSet<(u64, u64)>,
    // (name, id) -> (retained until, publishing message key)
    ids: HashMap<(String, String), (u64, u64)>,
    id_deadlines: BTreeSet<(u64, String, String)>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: u64, message: Message, deadline: u64) {
        self.index
            .entry(index_key(&message.name, &message.correlation_key))
            .or_default()
            .insert(key);
        self.deadlines.insert((deadline, key));
        self.messages.insert(
            key,
            BufferedMessage {
                key,
                message,
                deadline,
            },
        );
    }

    pub fn get(&self, key: u64) -> Option<&BufferedMessage> {
        self.messages.get(&key)
    }

    pub fn remove(&mut self, key: u64) -> Option<BufferedMessage> {
        let buffered = self.messages.remove(&key)?;
        let idx = index_key(&buffered.message.name, &buffered.message.correlation_key);
        if let Some(keys) = self.index.get_mut(&idx) {
            keys.remove(&key);
            if keys.is_empty() {
                self.index.remove(&idx);
            }
        }
        self.deadlines.remove(&(buffered.deadline, key));
        Some(buffered)
    }

    /// The earliest published message for `(name, correlation_key)` that has
    /// not reached its deadline
    pub fn first_match(
        &self,
        name: &str,
        correlation_key: &str,
        now: u64,
    ) -> Option<&BufferedMessage> {
        self.index
            .get(&index_key(name, correlation_key))?
            .iter()
            .filter_map(|key| self.messages.get(key))
            .find(|m| m.deadline > now)
    }

    /// Keys of the messages whose deadline has passed, in deadline order
    pub fn expired(&self, now: u64) -> Vec<u64> {
        self.deadlines
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|(_, key)| *key)
            .collect()
    }

    /// Retain the id of the message `key` until the given time
    pub fn retain_id(&mut self, name: &str, id: &str, until: u64, key: u64) {
        if let Some((previous, _)) = self.ids.insert(index_key(name, id), (until, key)) {
            self.id_deadlines
                .remove(&(previous, name.to_string(), id.to_string()));
        }
        self.id_deadlines
            .insert((until, name.to_string(), id.to_string()));
    }

    /// Whether the id is still retained at `now`, swept or not
    pub fn has_id(&self, name: &str, id: &str, now: u64) -> bool {
        matches!(self.ids.get(&index_key(name, id)), Some((until, _)) if *until > now)
    }

    pub fn release_id(&mut self, name: &str, id: &str) -> bool {
        match self.ids.remove(&index_key(name, id)) {
            Some((until, _)) => {
                self.id_deadlines
                    .remove(&(until, name.to_string(), id.to_string()));
                true
            }
            None => false,
        }
    }

    /// Retained ids whose retention has passed, in retention order, as
    /// `(message key, name, id)`
    pub fn expired_ids(&self, now: u64) -> Vec<(u64, String, String)> {
        self.id_deadlines
            .iter()
            .take_while(|(until, _, _)| *until <= now)
            .filter_map(|(_, name, id)| {
                let (_, key) = self.ids.get(&index_key(name, id))?;
                Some((*key, name.clone(), id.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn message(name: &str, key: &str) -> Message {
        Message {
            name: name.into(),
            correlation_key: key.into(),
            id: None,
            variables: Document::empty(),
            ttl_ms: 1000,
        }
    }

    #[test]
    fn it_matches_the_earliest_live_message() {
        let mut buffer = MessageBuffer::new();
        buffer.insert(2, message("order canceled", "o-1"), 100);
        buffer.insert(1, message("order canceled", "o-1"), 50);
        buffer.insert(3, message("order canceled", "o-2"), 100);

        assert_eq!(buffer.first_match("order canceled", "o-1", 0).map(|m| m.key), Some(1));
        // expired but not yet swept
        assert_eq!(buffer.first_match("order canceled", "o-1", 50).map(|m| m.key), Some(2));
        assert_eq!(buffer.first_match("order canceled", "o-3", 0), None);
        assert_eq!(buffer.first_match("other", "o-1", 0), None);
    }

    #[test]
    fn it_lists_expired_messages_in_deadline_order() {
        let mut buffer = MessageBuffer::new();
        buffer.insert(1, message("a", "k"), 300);
        buffer.insert(2, message("a", "k"), 100);
        buffer.insert(3, message("b", "k"), 200);

        assert_eq!(buffer.expired(99), Vec::<u64>::new());
        assert_eq!(buffer.expired(200), vec![2, 3]);

        buffer.remove(2);
        assert_eq!(buffer.expired(200), vec![3]);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn it_cleans_the_index_on_removal() {
        let mut buffer = MessageBuffer::new();
        buffer.insert(1, message("a", "k"), 100);
        assert!(buffer.remove(1).is_some());
        assert!(buffer.remove(1).is_none());
        assert!(buffer.is_empty());
        assert!(buffer.index.is_empty());
        assert!(buffer.deadlines.is_empty());
    }

    #[test]
    fn it_retains_ids_until_released() {
        let mut buffer = MessageBuffer::new();
        buffer.retain_id("a", "x", 100, 1);
        buffer.retain_id("b", "x", 50, 2);

        assert!(buffer.has_id("a", "x", 0));
        assert!(!buffer.has_id("a", "y", 0));
        assert_eq!(
            buffer.expired_ids(100),
            vec![(2, "b".to_string(), "x".to_string()), (1, "a".to_string(), "x".to_string())]
        );

        assert!(buffer.release_id("b", "x"));
        assert!(!buffer.release_id("b", "x"));
        assert_eq!(buffer.expired_ids(100), vec![(1, "a".to_string(), "x".to_string())]);
    }

    #[test]
    fn it_stops_retaining_ids_at_their_deadline_before_the_sweep() {
        let mut buffer = MessageBuffer::new();
        buffer.retain_id("a", "x", 100, 1);

        assert!(buffer.has_id("a", "x", 99));
        assert!(!buffer.has_id("a", "x", 100));

        // a new publish with the same id replaces the expired retention
        buffer.retain_id("a", "x", 300, 2);
        assert!(buffer.has_id("a", "x", 100));
        assert_eq!(buffer.expired_ids(200), Vec::new());
        assert_eq!(
            buffer.expired_ids(300),
            vec![(2, "a".to_string(), "x".to_string())]
        );
    }
}
