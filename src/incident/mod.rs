//! Recoverable runtime faults
//!
//! An [`Incident`] blocks the progress of one element instance. It never stops
//! the partition, and at most one incident is open per element instance.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::mapping::MappingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    /// An input or output mapping could not be applied
    IoMappingError,
    /// A value needed by the element (e.g. a correlation key) could not be read
    ExtractValueError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ErrorType::IoMappingError => "IO_MAPPING_ERROR",
            ErrorType::ExtractValueError => "EXTRACT_VALUE_ERROR",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub key: u64,
    pub error_type: ErrorType,
    pub error_message: String,
    /// The blocked element instance
    pub subject_key: u64,
    pub instance_key: u64,
    pub element_id: String,
}

impl Incident {
    pub fn new(
        key: u64,
        error_type: ErrorType,
        error_message: impl Into<String>,
        subject_key: u64,
        instance_key: u64,
        element_id: impl Into<String>,
    ) -> Self {
        Self {
            key,
            error_type,
            error_message: error_message.into(),
            subject_key,
            instance_key,
            element_id: element_id.into(),
        }
    }

    /// Report a failed input or output mapping
    pub fn io_mapping(
        key: u64,
        err: &MappingError,
        subject_key: u64,
        instance_key: u64,
        element_id: impl Into<String>,
    ) -> Self {
        Self::new(
            key,
            ErrorType::IoMappingError,
            err.to_string(),
            subject_key,
            instance_key,
            element_id,
        )
    }
}

/// The open incidents of a partition, indexed by the blocked element instance
#[derive(Debug, Default, Clone)]
pub struct IncidentLog {
    open: HashMap<u64, Incident>,
    subjects: HashMap<u64, u64>,
}

impl IncidentLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, subject_key: u64) -> bool {
        self.open.contains_key(&subject_key)
    }

    pub fn get(&self, subject_key: u64) -> Option<&Incident> {
        self.open.get(&subject_key)
    }

    pub fn by_key(&self, key: u64) -> Option<&Incident> {
        self.subjects.get(&key).and_then(|s| self.open.get(s))
    }

    /// Record an incident
    ///
    /// Returns false, leaving the log unchanged, if the subject already has an
    /// open incident.
    pub fn open(&mut self, incident: Incident) -> bool {
        if self.is_open(incident.subject_key) {
            return false;
        }
        self.subjects.insert(incident.key, incident.subject_key);
        self.open.insert(incident.subject_key, incident);
        true
    }

    pub fn resolve(&mut self, key: u64) -> Option<Incident> {
        let subject = self.subjects.remove(&key)?;
        self.open.remove(&subject)
    }

    /// Open incidents of a process instance, ordered by key
    pub fn of_instance(&self, instance_key: u64) -> Vec<&Incident> {
        let mut incidents: Vec<&Incident> = self
            .open
            .values()
            .filter(|i| i.instance_key == instance_key)
            .collect();
        incidents.sort_by_key(|i| i.key);
        incidents
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_uses_the_mapping_error_as_message() {
        let incident = Incident::io_mapping(
            7,
            &MappingError::NoDataFound {
                query: "$.missing".into(),
            },
            3,
            1,
            "service",
        );
        assert_eq!(incident.error_type.as_str(), "IO_MAPPING_ERROR");
        assert_eq!(incident.error_message, "No data found for query $.missing.");
        assert_eq!(incident.subject_key, 3);
    }

    #[test]
    fn it_keeps_one_open_incident_per_element() {
        let mut log = IncidentLog::new();
        let first = Incident::io_mapping(10, &MappingError::SourceNotAMap, 3, 1, "service");
        let second = Incident::io_mapping(11, &MappingError::TargetNotAMap, 3, 1, "service");

        assert!(log.open(first.clone()));
        assert!(!log.open(second.clone()));
        assert_eq!(log.get(3), Some(&first));
        assert_eq!(log.len(), 1);

        assert_eq!(log.resolve(10), Some(first));
        assert!(log.is_empty());
        assert!(log.open(second));
        assert!(log.by_key(11).is_some());
    }

    #[test]
    fn it_lists_incidents_of_an_instance() {
        let mut log = IncidentLog::new();
        log.open(Incident::io_mapping(12, &MappingError::SourceNotAMap, 5, 1, "b"));
        log.open(Incident::io_mapping(11, &MappingError::SourceNotAMap, 4, 1, "a"));
        log.open(Incident::io_mapping(13, &MappingError::SourceNotAMap, 6, 2, "c"));

        let keys: Vec<u64> = log.of_instance(1).iter().map(|i| i.key).collect();
        assert_eq!(keys, vec![11, 12]);
    }
}
