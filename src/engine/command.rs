use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::process::{DeploymentError, ProcessDefinition};
use crate::document::Document;
use crate::message::Subscription;

/// A request to the partition
///
/// Every accepted command answers with the key of the entity it applied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Deploy {
        definition: ProcessDefinition,
    },
    CreateInstance {
        process_id: String,
        #[serde(default)]
        variables: Option<Document>,
    },
    CompleteTask {
        task_key: u64,
        #[serde(default)]
        payload: Option<Document>,
    },
    UpdatePayload {
        scope_key: u64,
        payload: Document,
    },
    PublishMessage(PublishMessage),
    CancelInstance {
        instance_key: u64,
    },
    CloseSubscription {
        instance_key: u64,
        element_id: String,
    },
    /// Register the subscription of an element running on another partition
    /// with the partition owning its correlation key
    OpenMessageSubscription {
        subscription: Subscription,
    },
    /// The owning partition registered the subscription
    ConfirmSubscription {
        element_key: u64,
    },
    /// The owning partition chose a message for the subscription
    CorrelateSubscription {
        element_key: u64,
        message_key: u64,
        variables: Document,
    },
    /// Drop the registration kept by the owning partition
    CloseMessageSubscription {
        element_key: u64,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Deploy { .. } => "deploy",
            Command::CreateInstance { .. } => "create_instance",
            Command::CompleteTask { .. } => "complete_task",
            Command::UpdatePayload { .. } => "update_payload",
            Command::PublishMessage(_) => "publish_message",
            Command::CancelInstance { .. } => "cancel_instance",
            Command::CloseSubscription { .. } => "close_subscription",
            Command::OpenMessageSubscription { .. } => "open_message_subscription",
            Command::ConfirmSubscription { .. } => "confirm_subscription",
            Command::CorrelateSubscription { .. } => "correlate_subscription",
            Command::CloseMessageSubscription { .. } => "close_message_subscription",
        }
    }
}

/// A command addressed to another partition, written while processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub partition: u16,
    pub command: Command,
}

/// Publish a message to the subscriptions waiting on its name and correlation key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub name: String,
    pub correlation_key: String,
    #[serde(default)]
    pub variables: Option<Document>,
    #[serde(default)]
    pub id: Option<String>,
    /// Time to live in milliseconds. The partition default is used if not set
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

impl PublishMessage {
    pub fn new(name: impl Into<String>, correlation_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            correlation_key: correlation_key.into(),
            variables: None,
            id: None,
            ttl_ms: None,
        }
    }

    pub fn variables(self, variables: Document) -> Self {
        let mut cmd = self;
        cmd.variables = Some(variables);
        cmd
    }

    pub fn id(self, id: impl Into<String>) -> Self {
        let mut cmd = self;
        cmd.id = Some(id.into());
        cmd
    }

    pub fn time_to_live(self, ttl: Duration) -> Self {
        let mut cmd = self;
        cmd.ttl_ms = Some(ttl.as_millis().try_into().unwrap_or(u64::MAX));
        cmd
    }
}

impl From<PublishMessage> for Command {
    fn from(cmd: PublishMessage) -> Self {
        Command::PublishMessage(cmd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionType {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    InvalidState,
}

impl RejectionType {
    pub fn as_str(&self) -> &'static str {
        match *self {
            RejectionType::InvalidArgument => "INVALID_ARGUMENT",
            RejectionType::NotFound => "NOT_FOUND",
            RejectionType::AlreadyExists => "ALREADY_EXISTS",
            RejectionType::InvalidState => "INVALID_STATE",
        }
    }
}

/// A command the partition refused to apply
///
/// A rejected command leaves no trace in the partition log.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("Expected to deploy process '{process_id}', but {reason}")]
    InvalidDeployment {
        process_id: String,
        reason: DeploymentError,
    },

    #[error("Expected to create an instance of process '{0}', but no such process is deployed")]
    ProcessNotFound(String),

    #[error("Expected to complete task with key '{0}', but no such task is open")]
    TaskNotFound(u64),

    #[error("Expected to update the payload of scope with key '{0}', but no such scope exists")]
    ScopeNotFound(u64),

    #[error("Expected to cancel process instance with key '{0}', but no such instance is active")]
    InstanceNotFound(u64),

    #[error("Expected to close the subscription of element '{element_id}' of instance '{instance_key}', but no such subscription is open")]
    SubscriptionNotFound { instance_key: u64, element_id: String },

    #[error("Expected to close the subscription of element '{element_id}' of instance '{instance_key}', but it is already correlating a message")]
    SubscriptionCorrelating { instance_key: u64, element_id: String },

    #[error("Expected to find the subscription of element instance '{0}', but no such subscription is open")]
    UnknownSubscription(u64),

    #[error("Expected to open a subscription for element instance '{0}', but it is already open")]
    SubscriptionExists(u64),

    #[error("Expected to correlate a message with the subscription of element instance '{0}', but it is not waiting for a message")]
    SubscriptionNotWaiting(u64),

    #[error("Expected to publish a message with correlation key '{correlation_key}' on partition {owner}, but it was sent to partition {partition}")]
    WrongPartition {
        correlation_key: String,
        owner: u16,
        partition: u16,
    },

    #[error("Expected to publish a message with a name, but the name is empty")]
    EmptyMessageName,

    #[error("Expected to publish a message with variables of type map (json object), but got a non map document")]
    InvalidMessageVariables,

    #[error("Expected to publish a new message with id '{0}', but a message with that id was already published.")]
    DuplicateMessageId(String),
}

impl Rejection {
    pub fn rejection_type(&self) -> RejectionType {
        use Rejection::*;
        match self {
            InvalidDeployment { .. }
            | EmptyMessageName
            | InvalidMessageVariables
            | WrongPartition { .. } => RejectionType::InvalidArgument,
            ProcessNotFound(_)
            | TaskNotFound(_)
            | ScopeNotFound(_)
            | InstanceNotFound(_)
            | SubscriptionNotFound { .. }
            | UnknownSubscription(_) => RejectionType::NotFound,
            SubscriptionCorrelating { .. } | SubscriptionNotWaiting(_) => {
                RejectionType::InvalidState
            }
            DuplicateMessageId(_) | SubscriptionExists(_) => RejectionType::AlreadyExists,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn it_builds_publish_commands() {
        let cmd = PublishMessage::new("order canceled", "o-1")
            .id("x")
            .time_to_live(Duration::from_secs(2));
        assert_eq!(cmd.id.as_deref(), Some("x"));
        assert_eq!(cmd.ttl_ms, Some(2000));
        assert_eq!(cmd.variables, None);
        assert_eq!(Command::from(cmd).name(), "publish_message");
    }

    #[test]
    fn it_formats_the_duplicate_id_rejection() {
        let rejection = Rejection::DuplicateMessageId("foo".into());
        assert_eq!(
            rejection.to_string(),
            "Expected to publish a new message with id 'foo', but a message with that id was already published."
        );
        assert_eq!(rejection.rejection_type(), RejectionType::AlreadyExists);
    }
}
