use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::{Direction, IoMapping, Mapping, Mappings, ValidIoMapping, ValidMapping};
use crate::path::{PathExpression, Segment};

pub const PROHIBITED_EXPRESSION_MSG: &str =
    "Mapping uses a prohibited JSON path expression, wildcards, recursive descent and filters are not supported";

pub const REDUNDANT_MAPPING_MSG: &str =
    "A root mapping ('$') cannot be combined with other mappings of the same direction";

pub const INVALID_EXPRESSION_MSG: &str = "Mapping uses an invalid JSON path expression";

/// Reason codes for rejected mapping declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    ProhibitedJsonPathExpression,
    RedundantMapping,
    InvalidJsonPathExpression,
}

impl ValidationCode {
    /// Numeric code reported to the client
    pub fn code(&self) -> u16 {
        use ValidationCode::*;
        match *self {
            ProhibitedJsonPathExpression => 1,
            RedundantMapping => 2,
            InvalidJsonPathExpression => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use ValidationCode::*;
        match *self {
            ProhibitedJsonPathExpression => "PROHIBITED_JSON_PATH_EXPRESSION",
            RedundantMapping => "REDUNDANT_MAPPING",
            InvalidJsonPathExpression => "INVALID_JSON_PATH_EXPRESSION",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ValidationError {
    pub code: ValidationCode,
    pub message: String,
}

impl ValidationError {
    fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Validate the declared mappings of a task
///
/// Each direction is checked independently, inputs first. Every mapping must
/// consist of valid expressions without wildcard steps, and a mapping from or to
/// the document root must be the only mapping of its direction.
pub fn validate(io: &IoMapping) -> Result<ValidIoMapping, ValidationError> {
    let inputs = validate_direction(Direction::Input, io.inputs.as_deref())?;
    let outputs = validate_direction(Direction::Output, io.outputs.as_deref())?;
    Ok(ValidIoMapping { inputs, outputs })
}

fn validate_direction(
    direction: Direction,
    mappings: Option<&[Mapping]>,
) -> Result<Mappings, ValidationError> {
    let mappings = mappings.unwrap_or_default();

    let valid = mappings
        .iter()
        .map(|m| validate_mapping(direction, m))
        .collect::<Result<Vec<_>, _>>()?;

    if valid.len() > 1
        && valid
            .iter()
            .any(|m| m.source.is_root() || m.target.is_root())
    {
        return Err(ValidationError::new(
            ValidationCode::RedundantMapping,
            format!("{REDUNDANT_MAPPING_MSG} ({direction} mappings)"),
        ));
    }

    Ok(Mappings::new(valid))
}

fn validate_mapping(direction: Direction, mapping: &Mapping) -> Result<ValidMapping, ValidationError> {
    let source = parse(direction, "source", Some(mapping.source.as_str()))?;
    let target = parse(direction, "target", mapping.target.as_deref())?;

    // targets are navigated as maps
    if target
        .segments()
        .iter()
        .any(|s| matches!(s, Segment::Index(_)))
    {
        return Err(ValidationError::new(
            ValidationCode::InvalidJsonPathExpression,
            format!(
                "{INVALID_EXPRESSION_MSG}: {direction} target '{target}' may only use member steps"
            ),
        ));
    }

    Ok(ValidMapping { source, target })
}

fn parse(
    direction: Direction,
    side: &str,
    expr: Option<&str>,
) -> Result<PathExpression, ValidationError> {
    let expr = expr.ok_or_else(|| {
        ValidationError::new(
            ValidationCode::InvalidJsonPathExpression,
            format!("{INVALID_EXPRESSION_MSG}: {direction} {side} is missing"),
        )
    })?;

    let path = PathExpression::parse(expr).map_err(|e| {
        ValidationError::new(
            ValidationCode::InvalidJsonPathExpression,
            format!("{INVALID_EXPRESSION_MSG}: {e}"),
        )
    })?;

    if path.prohibited_segment().is_some() {
        return Err(ValidationError::new(
            ValidationCode::ProhibitedJsonPathExpression,
            format!("{PROHIBITED_EXPRESSION_MSG}: {direction} {side} '{expr}'"),
        ));
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn code_of(io: IoMapping) -> Option<ValidationCode> {
        validate(&io).err().map(|e| e.code)
    }

    #[test]
    fn it_accepts_absent_and_empty_mappings() {
        let valid = validate(&IoMapping::new()).unwrap();
        assert!(valid.inputs.is_default());
        assert!(valid.outputs.is_default());

        let io = IoMapping::new()
            .with_inputs(Some(vec![]))
            .with_outputs(None);
        assert_eq!(validate(&io), Ok(ValidIoMapping::default()));
    }

    #[test]
    fn it_accepts_a_single_root_mapping() {
        let io = IoMapping::new().input("$", "$").output("$.result", "$");
        let valid = validate(&io).unwrap();
        assert_eq!(valid.inputs.iter().count(), 1);
        assert_eq!(valid.outputs.iter().count(), 1);
    }

    #[test]
    fn it_rejects_wildcards() {
        let err = validate(&IoMapping::new().input("$.*", "$")).unwrap_err();
        assert_eq!(err.code, ValidationCode::ProhibitedJsonPathExpression);
        assert!(err.message.contains(PROHIBITED_EXPRESSION_MSG));
        assert!(err.message.contains("'$.*'"));
        assert!(err.to_string().starts_with("PROHIBITED_JSON_PATH_EXPRESSION (1)"));

        assert_eq!(
            code_of(IoMapping::new().output("$.a", "$.b[*]")),
            Some(ValidationCode::ProhibitedJsonPathExpression)
        );
        assert_eq!(
            code_of(IoMapping::new().input("$..a", "$.a")),
            Some(ValidationCode::ProhibitedJsonPathExpression)
        );
    }

    #[test]
    fn it_rejects_root_mappings_combined_with_others() {
        let err = validate(
            &IoMapping::new()
                .input("$.string", "$")
                .input("$.jsonObject", "$.jsonObject"),
        )
        .unwrap_err();
        assert_eq!(err.code, ValidationCode::RedundantMapping);
        assert!(err.message.contains(REDUNDANT_MAPPING_MSG));
        assert_eq!(
            err.to_string(),
            format!("REDUNDANT_MAPPING (2): {REDUNDANT_MAPPING_MSG} (input mappings)")
        );

        assert_eq!(
            code_of(IoMapping::new().output("$", "$.all").output("$.a", "$.b")),
            Some(ValidationCode::RedundantMapping)
        );
    }

    #[test]
    fn it_checks_directions_independently() {
        let io = IoMapping::new().input("$", "$").output("$.a", "$.b").output("$.c", "$.d");
        assert!(validate(&io).is_ok());
    }

    #[test]
    fn it_rejects_missing_or_malformed_expressions() {
        let io = IoMapping::new().with_outputs(Some(vec![Mapping {
            source: "$.string".into(),
            target: None,
        }]));
        assert_eq!(code_of(io), Some(ValidationCode::InvalidJsonPathExpression));

        assert_eq!(
            code_of(IoMapping::new().input("string", "$.a")),
            Some(ValidationCode::InvalidJsonPathExpression)
        );
        assert_eq!(
            code_of(IoMapping::new().input("$.a", "$.list[0]")),
            Some(ValidationCode::InvalidJsonPathExpression)
        );
    }
}
