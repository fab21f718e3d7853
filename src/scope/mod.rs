//! Variable scopes
//!
//! Scopes form a tree stored as an arena of records addressed by key, each
//! record pointing to its parent by key. A variable lookup that misses on a
//! scope falls back to its ancestors.

use json_patch::{diff, AddOperation, Patch, PatchOperation, ReplaceOperation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::document::Document;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRecord {
    pub key: u64,
    pub parent: Option<u64>,
    pub document: Document,
}

/// A change to a top level variable of a scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableChange {
    pub name: String,
    pub value: Value,
    /// Whether the variable did not exist before
    pub created: bool,
}

#[derive(Debug, Default, Clone)]
pub struct Scopes {
    records: HashMap<u64, ScopeRecord>,
}

impl Scopes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, key: u64, parent: Option<u64>, document: Document) {
        self.records.insert(
            key,
            ScopeRecord {
                key,
                parent,
                document,
            },
        );
    }

    pub fn get(&self, key: u64) -> Option<&ScopeRecord> {
        self.records.get(&key)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.records.contains_key(&key)
    }

    pub fn document(&self, key: u64) -> Option<&Document> {
        self.records.get(&key).map(|r| &r.document)
    }

    /// Look up a variable, falling back to the parent scopes on a miss
    pub fn variable(&self, key: u64, name: &str) -> Option<&Value> {
        let mut next = Some(key);
        while let Some(key) = next {
            let record = self.records.get(&key)?;
            if let Some(value) = record.document.get(name) {
                return Some(value);
            }
            next = record.parent;
        }
        None
    }

    /// Set a top level variable
    ///
    /// Returns false if the scope does not exist or its document is not a map.
    pub fn set_variable(&mut self, key: u64, name: impl Into<String>, value: Value) -> bool {
        match self
            .records
            .get_mut(&key)
            .and_then(|r| r.document.as_map_mut())
        {
            Some(map) => {
                map.insert(name.into(), value);
                true
            }
            None => false,
        }
    }

    /// Replace the whole document of a scope
    pub fn replace(&mut self, key: u64, document: Document) -> bool {
        match self.records.get_mut(&key) {
            Some(record) => {
                record.document = document;
                true
            }
            None => false,
        }
    }

    /// Remove a scope together with all of its descendants
    pub fn remove(&mut self, key: u64) -> Vec<u64> {
        let mut removed = Vec::new();
        let mut pending = vec![key];
        while let Some(key) = pending.pop() {
            if self.records.remove(&key).is_none() {
                continue;
            }
            removed.push(key);
            pending.extend(
                self.records
                    .values()
                    .filter(|r| r.parent == Some(key))
                    .map(|r| r.key),
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Compute the top level variables that differ between two map documents
///
/// Each variable is reported once, in the order of the first change affecting it,
/// with its whole new value. Removed members are not reported.
pub fn changes(old: &Document, new: &Document) -> Vec<VariableChange> {
    let Patch(operations) = diff(old.as_value(), new.as_value());

    let mut result: Vec<VariableChange> = Vec::new();
    for op in operations {
        let path = match op {
            PatchOperation::Add(AddOperation { path, .. }) => path,
            PatchOperation::Replace(ReplaceOperation { path, .. }) => path,
            _ => continue,
        };

        let Some(name) = path.tokens().next().map(|t| t.decoded().into_owned()) else {
            continue;
        };

        if result.iter().any(|c| c.name == name) {
            continue;
        }

        if let Some(value) = new.get(&name) {
            result.push(VariableChange {
                created: old.get(&name).is_none(),
                value: value.clone(),
                name,
            });
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::new(value)
    }

    #[test]
    fn it_falls_back_to_parent_scopes() {
        let mut scopes = Scopes::new();
        scopes.create(1, None, doc(json!({"orderId": "o-1", "shared": "root"})));
        scopes.create(2, Some(1), doc(json!({"shared": "child"})));
        scopes.create(3, Some(2), Document::empty());

        assert_eq!(scopes.variable(3, "shared"), Some(&json!("child")));
        assert_eq!(scopes.variable(3, "orderId"), Some(&json!("o-1")));
        assert_eq!(scopes.variable(1, "shared"), Some(&json!("root")));
        assert_eq!(scopes.variable(3, "missing"), None);
        assert_eq!(scopes.variable(9, "orderId"), None);
    }

    #[test]
    fn it_sets_variables_on_map_scopes_only() {
        let mut scopes = Scopes::new();
        scopes.create(1, None, Document::empty());
        scopes.create(2, None, doc(json!("foo")));

        assert!(scopes.set_variable(1, "a", json!(1)));
        assert!(!scopes.set_variable(2, "a", json!(1)));
        assert!(!scopes.set_variable(3, "a", json!(1)));
        assert_eq!(scopes.document(1), Some(&doc(json!({"a": 1}))));

        assert!(scopes.replace(2, doc(json!({"b": 2}))));
        assert_eq!(scopes.variable(2, "b"), Some(&json!(2)));
    }

    #[test]
    fn it_removes_descendant_scopes() {
        let mut scopes = Scopes::new();
        scopes.create(1, None, Document::empty());
        scopes.create(2, Some(1), Document::empty());
        scopes.create(3, Some(2), Document::empty());
        scopes.create(4, None, Document::empty());

        let mut removed = scopes.remove(1);
        removed.sort();
        assert_eq!(removed, vec![1, 2, 3]);
        assert_eq!(scopes.len(), 1);
        assert!(scopes.contains(4));
    }

    #[test]
    fn it_reports_top_level_changes() {
        let old = doc(json!({"string": "value", "obj": {"a": 1}, "same": true}));
        let new = doc(json!({"string": "other", "obj": {"a": 1, "b": 2}, "same": true, "newFoo": "x"}));

        let mut changed = changes(&old, &new);
        changed.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            changed,
            vec![
                VariableChange {
                    name: "newFoo".into(),
                    value: json!("x"),
                    created: true
                },
                VariableChange {
                    name: "obj".into(),
                    value: json!({"a": 1, "b": 2}),
                    created: false
                },
                VariableChange {
                    name: "string".into(),
                    value: json!("other"),
                    created: false
                },
            ]
        );
    }

    #[test]
    fn it_reports_nothing_for_equal_documents() {
        let d = doc(json!({"a": [1, 2]}));
        assert!(changes(&d, &d.clone()).is_empty());
    }
}
