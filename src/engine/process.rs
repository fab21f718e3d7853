use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::mapping::{validate, IoMapping, ValidIoMapping, ValidationCode, ValidationError};

/// An element of a process definition
///
/// Elements run one after the other, between an implicit start and end event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Element {
    /// Work handed to an external worker
    ServiceTask {
        id: String,
        task_type: String,
        #[serde(default)]
        retries: u32,
        #[serde(default)]
        io_mapping: IoMapping,
    },
    /// Wait for a message correlated by the value of a scope variable
    MessageCatch {
        id: String,
        message_name: String,
        /// Name of the variable holding the correlation key
        correlation_key: String,
    },
}

impl Element {
    pub fn id(&self) -> &str {
        match self {
            Element::ServiceTask { id, .. } => id,
            Element::MessageCatch { id, .. } => id,
        }
    }
}

/// A process definition as submitted for deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    #[serde(default)]
    pub elements: Vec<Element>,
}

impl ProcessDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            elements: Vec::new(),
        }
    }

    /// Append a service task
    pub fn service_task(
        self,
        id: impl Into<String>,
        task_type: impl Into<String>,
        io_mapping: IoMapping,
    ) -> Self {
        self.element(Element::ServiceTask {
            id: id.into(),
            task_type: task_type.into(),
            retries: 3,
            io_mapping,
        })
    }

    /// Append a message catch event
    pub fn message_catch(
        self,
        id: impl Into<String>,
        message_name: impl Into<String>,
        correlation_key: impl Into<String>,
    ) -> Self {
        self.element(Element::MessageCatch {
            id: id.into(),
            message_name: message_name.into(),
            correlation_key: correlation_key.into(),
        })
    }

    pub fn element(self, element: Element) -> Self {
        let mut def = self;
        def.elements.push(element);
        def
    }

    /// Check the definition and compile it into an executable process.
    ///
    /// Elements are checked in order and the first failure rejects the whole
    /// definition.
    pub fn validate(&self) -> Result<Process, DeploymentError> {
        if self.id.is_empty() {
            return Err(DeploymentError::EmptyProcessId);
        }

        let mut seen = HashSet::new();
        let mut activities = Vec::with_capacity(self.elements.len());
        for element in self.elements.iter() {
            if element.id().is_empty() {
                return Err(DeploymentError::EmptyElementId);
            }
            if !seen.insert(element.id()) {
                return Err(DeploymentError::DuplicateElement(element.id().to_string()));
            }

            let activity = match element {
                Element::ServiceTask {
                    id,
                    task_type,
                    retries,
                    io_mapping,
                } => {
                    let mappings =
                        validate(io_mapping).map_err(|source| DeploymentError::InvalidMapping {
                            element_id: id.clone(),
                            source,
                        })?;
                    Activity::Task(TaskActivity {
                        id: id.clone(),
                        task_type: task_type.clone(),
                        retries: *retries,
                        mappings,
                    })
                }
                Element::MessageCatch {
                    id,
                    message_name,
                    correlation_key,
                } => {
                    if message_name.is_empty() {
                        return Err(DeploymentError::EmptyMessageName(id.clone()));
                    }
                    if correlation_key.is_empty() {
                        return Err(DeploymentError::EmptyCorrelationKey(id.clone()));
                    }
                    Activity::MessageCatch(CatchActivity {
                        id: id.clone(),
                        message_name: message_name.clone(),
                        correlation_key: correlation_key.clone(),
                    })
                }
            };
            activities.push(activity);
        }

        Ok(Process {
            key: 0,
            id: self.id.clone(),
            version: 0,
            activities,
        })
    }
}

/// Reason for rejecting a deployment
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeploymentError {
    #[error("the process id must not be empty")]
    EmptyProcessId,

    #[error("every element must have an id")]
    EmptyElementId,

    #[error("the element id '{0}' is used more than once")]
    DuplicateElement(String),

    #[error("the message catch element '{0}' must name a message")]
    EmptyMessageName(String),

    #[error("the message catch element '{0}' must name a correlation key variable")]
    EmptyCorrelationKey(String),

    #[error("the element '{element_id}' has an invalid io mapping: {source}")]
    InvalidMapping {
        element_id: String,
        source: ValidationError,
    },
}

impl DeploymentError {
    /// The validation code, if the deployment was rejected for its mappings
    pub fn code(&self) -> Option<ValidationCode> {
        match self {
            DeploymentError::InvalidMapping { source, .. } => Some(source.code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskActivity {
    pub id: String,
    pub task_type: String,
    pub retries: u32,
    pub mappings: ValidIoMapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchActivity {
    pub id: String,
    pub message_name: String,
    pub correlation_key: String,
}

/// A validated element, ready to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activity {
    Task(TaskActivity),
    MessageCatch(CatchActivity),
}

impl Activity {
    pub fn id(&self) -> &str {
        match self {
            Activity::Task(task) => &task.id,
            Activity::MessageCatch(catch) => &catch.id,
        }
    }
}

/// A deployed process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub key: u64,
    pub id: String,
    pub version: u32,
    pub activities: Vec<Activity>,
}

impl Process {
    pub fn activity(&self, index: usize) -> Option<&Activity> {
        self.activities.get(index)
    }

    /// Names of the correlation variables of the message catch elements, in order
    pub fn correlation_variables(&self) -> impl Iterator<Item = &str> {
        self.activities.iter().filter_map(|a| match a {
            Activity::MessageCatch(catch) => Some(catch.correlation_key.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn it_compiles_a_valid_definition() {
        let def = ProcessDefinition::new("process")
            .service_task("service", "external", IoMapping::new().input("$.a", "$.b"))
            .message_catch("catch-event", "order canceled", "orderId");

        let process = def.validate().unwrap();
        assert_eq!(process.id, "process");
        let ids: Vec<&str> = process.activities.iter().map(|a| a.id()).collect();
        assert_eq!(ids, vec!["service", "catch-event"]);
        assert_eq!(
            process.correlation_variables().collect::<Vec<_>>(),
            vec!["orderId"]
        );
    }

    #[test]
    fn it_rejects_invalid_mappings_with_their_code() {
        let def = ProcessDefinition::new("process").service_task(
            "service",
            "external",
            IoMapping::new().input("$.*", "$"),
        );

        let err = def.validate().unwrap_err();
        assert_eq!(err.code(), Some(ValidationCode::ProhibitedJsonPathExpression));
        assert!(err
            .to_string()
            .contains("PROHIBITED_JSON_PATH_EXPRESSION (1)"));
    }

    #[test]
    fn it_rejects_duplicate_element_ids() {
        let def = ProcessDefinition::new("process")
            .service_task("a", "external", IoMapping::new())
            .message_catch("a", "msg", "key");
        assert_eq!(
            def.validate(),
            Err(DeploymentError::DuplicateElement("a".into()))
        );
    }

    #[test]
    fn it_rejects_catch_events_without_message() {
        let def = ProcessDefinition::new("process").message_catch("catch", "", "key");
        assert_eq!(
            def.validate(),
            Err(DeploymentError::EmptyMessageName("catch".into()))
        );
        assert_eq!(
            ProcessDefinition::new("").validate(),
            Err(DeploymentError::EmptyProcessId)
        );
    }

    #[test]
    fn it_reads_definitions_from_json() {
        let def: ProcessDefinition = serde_json::from_value(serde_json::json!({
            "id": "process",
            "elements": [
                {"type": "service_task", "id": "service", "task_type": "external",
                 "io_mapping": {"inputs": [{"source": "$.a", "target": "$.b"}]}},
                {"type": "message_catch", "id": "catch", "message_name": "m",
                 "correlation_key": "key"}
            ]
        }))
        .unwrap();

        assert_eq!(
            def,
            ProcessDefinition::new("process")
                .element(Element::ServiceTask {
                    id: "service".into(),
                    task_type: "external".into(),
                    retries: 0,
                    io_mapping: IoMapping::new().input("$.a", "$.b"),
                })
                .message_catch("catch", "m", "key")
        );
    }
}
