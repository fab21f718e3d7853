use serde_json::{Map, Value};

use super::MappingError;
use crate::document::Document;
use crate::path::{PathExpression, Segment};

fn member_key(segment: &Segment) -> String {
    match segment {
        Segment::Member(name) => name.clone(),
        Segment::Index(index) => index.to_string(),
        // validated targets only contain member steps
        other => format!("{other:?}"),
    }
}

/// Merge `value` into `target` at `path`, returning the updated document
///
/// At the root the value must be a map and its entries are merged shallowly
/// into the target: new keys are added and existing keys overwritten. Below the
/// root, missing intermediate members are created as maps and the leaf member
/// is set to the value.
pub fn merge(
    value: Document,
    path: &PathExpression,
    target: Document,
) -> Result<Document, MappingError> {
    let mut target = target;
    let root = target.as_map_mut().ok_or(MappingError::TargetNotAMap)?;

    let Some((leaf, parents)) = path.segments().split_last() else {
        let Value::Object(entries) = value.into_value() else {
            return Err(MappingError::ResultNotAMap);
        };
        root.extend(entries);
        return Ok(target);
    };

    let mut current: &mut Map<String, Value> = root;
    for segment in parents {
        current = current
            .entry(member_key(segment))
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or(MappingError::TargetNotAMap)?;
    }
    current.insert(member_key(leaf), value.into_value());

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn path(expr: &str) -> PathExpression {
        PathExpression::parse(expr).unwrap()
    }

    fn doc(value: Value) -> Document {
        Document::new(value)
    }

    #[test]
    fn it_merges_maps_at_the_root_shallowly() {
        let target = doc(json!({"a": 1, "b": {"x": 1}}));
        let result = merge(doc(json!({"b": {"y": 2}, "c": 3})), &path("$"), target);
        assert_eq!(result, Ok(doc(json!({"a": 1, "b": {"y": 2}, "c": 3}))));
    }

    #[test]
    fn it_rejects_non_map_values_at_the_root() {
        let result = merge(doc(json!("value")), &path("$"), Document::empty());
        assert_eq!(result, Err(MappingError::ResultNotAMap));
    }

    #[test]
    fn it_creates_intermediate_members() {
        let result = merge(doc(json!(123)), &path("$.a.b.c"), doc(json!({"z": 0})));
        assert_eq!(result, Ok(doc(json!({"z": 0, "a": {"b": {"c": 123}}}))));
    }

    #[test]
    fn it_overwrites_the_leaf() {
        let result = merge(
            doc(json!([1, 2])),
            &path("$.a.b"),
            doc(json!({"a": {"b": "old", "c": true}})),
        );
        assert_eq!(result, Ok(doc(json!({"a": {"b": [1, 2], "c": true}}))));
    }

    #[test]
    fn it_fails_to_merge_into_scalars() {
        assert_eq!(
            merge(doc(json!(1)), &path("$.a.b"), doc(json!({"a": "scalar"}))),
            Err(MappingError::TargetNotAMap)
        );
        assert_eq!(
            merge(doc(json!({})), &path("$"), doc(json!("foo"))),
            Err(MappingError::TargetNotAMap)
        );
    }
}
