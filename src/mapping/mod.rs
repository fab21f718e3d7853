//! Input/output mappings between variable scopes and task payloads
//!
//! Mappings are declared on a task as `(source, target)` path pairs. They are
//! validated once at deployment ([`validate`]) and the resulting [`Mappings`]
//! are applied at runtime, when a task is created (scope to payload) and when it
//! completes (payload to scope).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::trace;

use crate::document::Document;
use crate::path::PathExpression;

mod extract;
mod merge;
mod validate;

pub use extract::extract;
pub use merge::merge;
pub use validate::*;

/// A runtime mapping fault
///
/// The display text of each variant is the message reported on the incident.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("No data found for query {query}.")]
    NoDataFound { query: String },

    #[error("Can't extract from source document, since it is not a map (json object).")]
    SourceNotAMap,

    #[error("Can't merge into the target document, since it is not a map (json object).")]
    TargetNotAMap,

    #[error("Processing failed, since mapping will result in a non map object (json object).")]
    ResultNotAMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// A mapping rule as declared on the task definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub source: String,
    pub target: Option<String>,
}

impl Mapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: Some(target.into()),
        }
    }
}

/// The declared mappings of a task
///
/// A direction that is absent (or empty) uses the default root-to-root mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoMapping {
    #[serde(default)]
    pub inputs: Option<Vec<Mapping>>,
    #[serde(default)]
    pub outputs: Option<Vec<Mapping>>,
}

impl IoMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        let mut io = self;
        io.inputs
            .get_or_insert_with(Vec::new)
            .push(Mapping::new(source, target));
        io
    }

    pub fn output(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        let mut io = self;
        io.outputs
            .get_or_insert_with(Vec::new)
            .push(Mapping::new(source, target));
        io
    }

    pub fn with_inputs(self, inputs: Option<Vec<Mapping>>) -> Self {
        let mut io = self;
        io.inputs = inputs;
        io
    }

    pub fn with_outputs(self, outputs: Option<Vec<Mapping>>) -> Self {
        let mut io = self;
        io.outputs = outputs;
        io
    }
}

/// A validated mapping rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidMapping {
    pub source: PathExpression,
    pub target: PathExpression,
}

impl ValidMapping {
    pub fn root() -> Self {
        Self {
            source: PathExpression::root(),
            target: PathExpression::root(),
        }
    }
}

/// The validated mappings of one direction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mappings(Vec<ValidMapping>);

impl Mappings {
    pub(crate) fn new(mappings: Vec<ValidMapping>) -> Self {
        Self(mappings)
    }

    /// Mappings are empty when the direction uses the default root mapping
    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidMapping> {
        self.0.iter()
    }

    /// Apply every mapping in declaration order, extracting from `source` and
    /// merging into `target`.
    ///
    /// The first failing mapping aborts the whole evaluation and `target` is
    /// left untouched.
    pub fn apply(&self, source: &Document, target: &Document) -> Result<Document, MappingError> {
        let default = [ValidMapping::root()];
        let mappings = if self.0.is_empty() {
            &default[..]
        } else {
            &self.0[..]
        };

        let mut result = target.clone();
        for mapping in mappings {
            let value = extract(source, &mapping.source)?;
            result = merge(value, &mapping.target, result)?;
            trace!(source = %mapping.source, target = %mapping.target, "mapping applied");
        }
        Ok(result)
    }
}

/// The validated mappings of a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidIoMapping {
    pub inputs: Mappings,
    pub outputs: Mappings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::new(value)
    }

    fn mappings(pairs: &[(&str, &str)]) -> Mappings {
        Mappings::new(
            pairs
                .iter()
                .map(|(s, t)| ValidMapping {
                    source: PathExpression::parse(*s).unwrap(),
                    target: PathExpression::parse(*t).unwrap(),
                })
                .collect(),
        )
    }

    fn scope() -> Document {
        doc(json!({"string": "value", "jsonObject": {"testAttr": "test"}}))
    }

    #[test]
    fn it_copies_the_whole_document_by_default() {
        let result = Mappings::default().apply(&scope(), &Document::empty());
        assert_eq!(result, Ok(scope()));
    }

    #[test]
    fn it_uses_an_empty_map_for_a_missing_payload() {
        let result = Mappings::default().apply(&Document::or_empty(None), &Document::empty());
        assert_eq!(result, Ok(Document::empty()));
    }

    #[test]
    fn it_accumulates_independent_mappings() {
        let m = mappings(&[("$.string", "$.newFoo"), ("$.jsonObject", "$.newObj")]);
        let result = m.apply(&scope(), &Document::empty()).unwrap();
        assert_eq!(
            result,
            doc(json!({"newFoo": "value", "newObj": {"testAttr": "test"}}))
        );
    }

    #[test]
    fn it_preserves_existing_target_keys() {
        let m = mappings(&[("$.string", "$.newFoo")]);
        let result = m.apply(&scope(), &scope()).unwrap();
        assert_eq!(
            result,
            doc(json!({
                "string": "value",
                "jsonObject": {"testAttr": "test"},
                "newFoo": "value"
            }))
        );
    }

    #[test]
    fn it_aborts_on_the_first_failing_mapping() {
        let m = mappings(&[("$.notExisting", "$.nullVal"), ("$.string", "$.existing")]);
        assert_eq!(
            m.apply(&scope(), &Document::empty()),
            Err(MappingError::NoDataFound {
                query: "$.notExisting".into()
            })
        );
    }

    #[test]
    fn it_rejects_a_non_map_source_even_with_the_default_mapping() {
        assert_eq!(
            Mappings::default().apply(&doc(json!("foo")), &scope()),
            Err(MappingError::SourceNotAMap)
        );
    }

    #[test]
    fn it_rejects_a_non_map_target() {
        assert_eq!(
            Mappings::default().apply(&Document::empty(), &doc(json!("foo"))),
            Err(MappingError::TargetNotAMap)
        );
    }

    #[test]
    fn it_rejects_a_non_map_root_result() {
        let m = mappings(&[("$.string", "$")]);
        assert_eq!(
            m.apply(&scope(), &Document::empty()),
            Err(MappingError::ResultNotAMap)
        );
    }

    #[test]
    fn it_formats_incident_messages() {
        assert_eq!(
            MappingError::NoDataFound {
                query: "$.missing".into()
            }
            .to_string(),
            "No data found for query $.missing."
        );
        assert_eq!(
            MappingError::TargetNotAMap.to_string(),
            "Can't merge into the target document, since it is not a map (json object)."
        );
    }

    #[test]
    fn it_builds_io_mappings() {
        let io = IoMapping::new()
            .input("$.a", "$.b")
            .output("$.c", "$");
        assert_eq!(io.inputs, Some(vec![Mapping::new("$.a", "$.b")]));
        assert_eq!(io.outputs, Some(vec![Mapping::new("$.c", "$")]));
    }
}
