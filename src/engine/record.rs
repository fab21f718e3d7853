use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::process::Process;
use crate::document::Document;
use crate::incident::Incident;
use crate::message::{Message, Subscription};

/// An entry of the partition log
///
/// `key` identifies the entity the event applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub position: u64,
    pub key: u64,
    pub event: Event,
}

/// A state change of the partition
///
/// Applying the events of a log in order rebuilds the partition state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    ProcessDeployed {
        process: Process,
    },

    InstanceCreated {
        process_key: u64,
        process_id: String,
        variables: Document,
    },
    InstanceCompleted {
        process_id: String,
    },
    InstanceCanceled {
        process_id: String,
    },

    ElementActivated {
        instance_key: u64,
        element_id: String,
        index: usize,
    },
    ElementCompleted {
        instance_key: u64,
        element_id: String,
    },

    /// The task payload is the result of the input mappings
    TaskCreated {
        element_key: u64,
        instance_key: u64,
        task_type: String,
        retries: u32,
        payload: Document,
    },
    /// The task payload is the one supplied by the worker
    TaskCompleted {
        element_key: u64,
        payload: Document,
    },
    TaskCanceled {
        element_key: u64,
    },

    VariableCreated {
        scope_key: u64,
        name: String,
        value: Value,
    },
    VariableUpdated {
        scope_key: u64,
        name: String,
        value: Value,
    },
    PayloadUpdated {
        payload: Document,
    },

    IncidentCreated {
        incident: Incident,
    },
    IncidentResolved {
        subject_key: u64,
    },

    SubscriptionOpening {
        subscription: Subscription,
    },
    SubscriptionOpened {
        subscription: Subscription,
    },
    SubscriptionCorrelating {
        subscription: Subscription,
    },
    SubscriptionClosed {
        subscription: Subscription,
    },

    /// A message was accepted
    ///
    /// `deadline` is set only when the message is buffered for a later match.
    MessagePublished {
        message: Message,
        #[serde(default)]
        deadline: Option<u64>,
        #[serde(default)]
        retain_id_until: Option<u64>,
    },
    MessageExpired {
        name: String,
        correlation_key: String,
    },
    MessageIdReleased {
        name: String,
        id: String,
    },
}

impl Event {
    /// The name of the event, as written to the log
    pub fn intent(&self) -> &'static str {
        match self {
            Event::ProcessDeployed { .. } => "PROCESS_DEPLOYED",
            Event::InstanceCreated { .. } => "INSTANCE_CREATED",
            Event::InstanceCompleted { .. } => "INSTANCE_COMPLETED",
            Event::InstanceCanceled { .. } => "INSTANCE_CANCELED",
            Event::ElementActivated { .. } => "ELEMENT_ACTIVATED",
            Event::ElementCompleted { .. } => "ELEMENT_COMPLETED",
            Event::TaskCreated { .. } => "TASK_CREATED",
            Event::TaskCompleted { .. } => "TASK_COMPLETED",
            Event::TaskCanceled { .. } => "TASK_CANCELED",
            Event::VariableCreated { .. } => "VARIABLE_CREATED",
            Event::VariableUpdated { .. } => "VARIABLE_UPDATED",
            Event::PayloadUpdated { .. } => "PAYLOAD_UPDATED",
            Event::IncidentCreated { .. } => "INCIDENT_CREATED",
            Event::IncidentResolved { .. } => "INCIDENT_RESOLVED",
            Event::SubscriptionOpening { .. } => "SUBSCRIPTION_OPENING",
            Event::SubscriptionOpened { .. } => "SUBSCRIPTION_OPENED",
            Event::SubscriptionCorrelating { .. } => "SUBSCRIPTION_CORRELATING",
            Event::SubscriptionClosed { .. } => "SUBSCRIPTION_CLOSED",
            Event::MessagePublished { .. } => "MESSAGE_PUBLISHED",
            Event::MessageExpired { .. } => "MESSAGE_EXPIRED",
            Event::MessageIdReleased { .. } => "MESSAGE_ID_RELEASED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn it_tags_events_with_their_intent() {
        let record = Record {
            position: 3,
            key: 10,
            event: Event::VariableCreated {
                scope_key: 1,
                name: "foo".into(),
                value: json!("bar"),
            },
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "position": 3,
                "key": 10,
                "event": {"intent": "VARIABLE_CREATED", "scope_key": 1, "name": "foo", "value": "bar"}
            })
        );
        assert_eq!(record.event.intent(), "VARIABLE_CREATED");

        let read: Record = serde_json::from_value(value).unwrap();
        assert_eq!(read, record);
    }
}
