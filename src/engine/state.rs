use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::trace;

use super::process::Process;
use super::record::Event;
use crate::document::Document;
use crate::incident::IncidentLog;
use crate::message::{MessageBuffer, SubscriptionRegistry};
use crate::scope::Scopes;

/// Bits of a key holding the partition-local counter
pub const KEY_BITS: u32 = 51;

const COUNTER_MASK: u64 = (1 << KEY_BITS) - 1;

/// Build a key from a partition id and a local counter
pub fn encode_key(partition_id: u16, counter: u64) -> u64 {
    ((partition_id as u64) << KEY_BITS) | (counter & COUNTER_MASK)
}

/// The partition that generated a key
pub fn partition_of(key: u64) -> u16 {
    (key >> KEY_BITS) as u16
}

/// The partition owning a correlation key among `partitions`
///
/// Messages with the key are published there, and every subscription waiting
/// on the key is registered there, whichever partition runs the instance.
pub fn partition_for_key(correlation_key: &str, partitions: u16) -> u16 {
    let mut hasher = DefaultHasher::new();
    correlation_key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as u16
}

/// The element an instance is currently at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveElement {
    pub key: u64,
    pub id: String,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub key: u64,
    pub process_key: u64,
    pub process_id: String,
    pub element: Option<ActiveElement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub key: u64,
    pub element_key: u64,
    pub instance_key: u64,
    pub task_type: String,
    pub retries: u32,
    pub payload: Document,
}

/// The state of a partition
///
/// Only [`State::apply`] modifies it, so the state after a sequence of events
/// does not depend on whether they were just processed or replayed.
#[derive(Debug, Clone)]
pub struct State {
    partition_id: u16,
    next_counter: u64,
    processes: HashMap<u64, Process>,
    latest: HashMap<String, u64>,
    instances: HashMap<u64, Instance>,
    tasks: HashMap<u64, Task>,
    scopes: Scopes,
    subscriptions: SubscriptionRegistry,
    messages: MessageBuffer,
    incidents: IncidentLog,
}

impl State {
    pub fn new(partition_id: u16) -> Self {
        Self {
            partition_id,
            next_counter: 1,
            processes: HashMap::new(),
            latest: HashMap::new(),
            instances: HashMap::new(),
            tasks: HashMap::new(),
            scopes: Scopes::new(),
            subscriptions: SubscriptionRegistry::new(),
            messages: MessageBuffer::new(),
            incidents: IncidentLog::new(),
        }
    }

    pub fn partition_id(&self) -> u16 {
        self.partition_id
    }

    /// The key the next generated entity will get
    ///
    /// The counter only moves when an event carrying the key is applied.
    pub(crate) fn peek_key(&self) -> u64 {
        encode_key(self.partition_id, self.next_counter)
    }

    pub fn process(&self, key: u64) -> Option<&Process> {
        self.processes.get(&key)
    }

    /// The latest deployed version of a process
    pub fn latest_process(&self, process_id: &str) -> Option<&Process> {
        self.latest
            .get(process_id)
            .and_then(|key| self.processes.get(key))
    }

    pub fn instance(&self, key: u64) -> Option<&Instance> {
        self.instances.get(&key)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn task(&self, key: u64) -> Option<&Task> {
        self.tasks.get(&key)
    }

    /// Open tasks of a process instance, ordered by key
    pub fn tasks_of(&self, instance_key: u64) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.instance_key == instance_key)
            .collect();
        tasks.sort_by_key(|t| t.key);
        tasks
    }

    pub fn scopes(&self) -> &Scopes {
        &self.scopes
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn messages(&self) -> &MessageBuffer {
        &self.messages
    }

    pub fn incidents(&self) -> &IncidentLog {
        &self.incidents
    }

    fn track_key(&mut self, key: u64) {
        if partition_of(key) == self.partition_id {
            self.next_counter = self.next_counter.max((key & COUNTER_MASK) + 1);
        }
    }

    /// Apply an event for the entity `key`
    pub fn apply(&mut self, key: u64, event: &Event) {
        trace!(key, intent = event.intent(), "apply");
        self.track_key(key);

        match event {
            Event::ProcessDeployed { process } => {
                self.latest.insert(process.id.clone(), key);
                self.processes.insert(key, process.clone());
            }
            Event::InstanceCreated {
                process_key,
                process_id,
                variables,
            } => {
                self.instances.insert(
                    key,
                    Instance {
                        key,
                        process_key: *process_key,
                        process_id: process_id.clone(),
                        element: None,
                    },
                );
                self.scopes.create(key, None, variables.clone());
            }
            Event::InstanceCompleted { .. } | Event::InstanceCanceled { .. } => {
                self.instances.remove(&key);
                self.scopes.remove(key);
            }
            Event::ElementActivated {
                instance_key,
                element_id,
                index,
            } => {
                if let Some(instance) = self.instances.get_mut(instance_key) {
                    instance.element = Some(ActiveElement {
                        key,
                        id: element_id.clone(),
                        index: *index,
                    });
                }
            }
            Event::ElementCompleted { instance_key, .. } => {
                if let Some(instance) = self.instances.get_mut(instance_key) {
                    instance.element = None;
                }
            }
            Event::TaskCreated {
                element_key,
                instance_key,
                task_type,
                retries,
                payload,
            } => {
                self.tasks.insert(
                    key,
                    Task {
                        key,
                        element_key: *element_key,
                        instance_key: *instance_key,
                        task_type: task_type.clone(),
                        retries: *retries,
                        payload: payload.clone(),
                    },
                );
            }
            Event::TaskCompleted { .. } | Event::TaskCanceled { .. } => {
                self.tasks.remove(&key);
            }
            Event::VariableCreated {
                scope_key,
                name,
                value,
            }
            | Event::VariableUpdated {
                scope_key,
                name,
                value,
            } => {
                self.scopes
                    .set_variable(*scope_key, name.clone(), value.clone());
            }
            Event::PayloadUpdated { payload } => {
                self.scopes.replace(key, payload.clone());
            }
            Event::IncidentCreated { incident } => {
                self.incidents.open(incident.clone());
            }
            Event::IncidentResolved { .. } => {
                self.incidents.resolve(key);
            }
            Event::SubscriptionOpening { subscription } => {
                self.subscriptions.open(subscription.clone());
            }
            Event::SubscriptionOpened { .. } => {
                self.subscriptions.opened(key);
            }
            Event::SubscriptionCorrelating { subscription } => {
                if let Some(message_key) = subscription.message_key {
                    self.subscriptions.correlating(key, message_key);
                    // a message correlates at most once
                    self.messages.remove(message_key);
                }
            }
            Event::SubscriptionClosed { .. } => {
                self.subscriptions.close(key);
            }
            Event::MessagePublished {
                message,
                deadline,
                retain_id_until,
            } => {
                if let (Some(id), Some(until)) = (message.id(), retain_id_until) {
                    self.messages.retain_id(&message.name, id, *until, key);
                }
                if let Some(deadline) = deadline {
                    self.messages.insert(key, message.clone(), *deadline);
                }
            }
            Event::MessageExpired { .. } => {
                self.messages.remove(key);
            }
            Event::MessageIdReleased { name, id } => {
                self.messages.release_id(name, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn it_encodes_the_partition_in_keys() {
        let key = encode_key(3, 42);
        assert_eq!(partition_of(key), 3);
        assert_eq!(key & COUNTER_MASK, 42);
        assert_eq!(partition_of(encode_key(0, 1)), 0);
    }

    #[test]
    fn it_assigns_correlation_keys_to_partitions() {
        assert_eq!(partition_for_key("order-1", 1), 0);
        assert_eq!(partition_for_key("order-1", 0), 0);

        let owner = partition_for_key("order-1", 4);
        assert!(owner < 4);
        assert_eq!(partition_for_key("order-1", 4), owner);
    }

    #[test]
    fn it_advances_the_key_counter_on_apply() {
        let mut state = State::new(2);
        let first = state.peek_key();
        assert_eq!(first, encode_key(2, 1));

        state.apply(
            first,
            &Event::InstanceCreated {
                process_key: 0,
                process_id: "p".into(),
                variables: Document::new(json!({"a": 1})),
            },
        );
        assert_eq!(state.peek_key(), encode_key(2, 2));
        assert!(state.instance(first).is_some());
        assert_eq!(state.scopes().variable(first, "a"), Some(&json!(1)));

        // keys of other partitions do not move the counter
        state.apply(
            encode_key(5, 100),
            &Event::MessageIdReleased {
                name: "m".into(),
                id: "x".into(),
            },
        );
        assert_eq!(state.peek_key(), encode_key(2, 2));
    }

    #[test]
    fn it_removes_the_scope_of_a_finished_instance() {
        let mut state = State::new(0);
        let key = state.peek_key();
        state.apply(
            key,
            &Event::InstanceCreated {
                process_key: 0,
                process_id: "p".into(),
                variables: Document::empty(),
            },
        );
        state.apply(
            key,
            &Event::InstanceCompleted {
                process_id: "p".into(),
            },
        );
        assert!(state.instance(key).is_none());
        assert!(!state.scopes().contains(key));
    }
}
