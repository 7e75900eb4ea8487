//! In-memory statement store
//!
//! Statements live in a vector kept sorted by (subject, predicate, object),
//! so lookups return rows in the store's natural subject order. `from_json`
//! loads a JSON document the way applications usually create test data:
//! each top-level object becomes a resource, nested objects become
//! anonymous resources referenced from their parent, array values become
//! one statement per element (multi-valued properties), and a string of
//! the form `"@id"` is stored as a reference to that id.

use serde_json::Value as Json;
use tern_core::{
    Error, JsonSerializer, MatchHints, ObjectType, Result, Serializer, Statement, StatementIter,
    Store, TriplePattern, Value, ANON_ID_PREFIX,
};
use tracing::debug;

/// A sorted, read-optimized in-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    statements: Vec<Statement>,
    next_anon: u64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of statements
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Insert a statement, keeping sort order
    pub fn insert(&mut self, statement: Statement) {
        let at = self
            .statements
            .partition_point(|s| sort_key(s) <= sort_key(&statement));
        self.statements.insert(at, statement);
    }

    /// Insert a native value as one or more statements about `subject`
    pub fn insert_value(&mut self, subject: &str, predicate: &str, value: &Value) -> Result<()> {
        let (literal, object_type) = JsonSerializer.encode(value)?;
        self.insert(Statement::new(subject, predicate, literal, object_type));
        Ok(())
    }

    /// Load a JSON document: an array of objects, or a single object
    pub fn from_json(json: &Json) -> Result<MemoryStore> {
        let mut store = MemoryStore::new();
        match json {
            Json::Array(items) => {
                for item in items {
                    store.load_resource(item)?;
                }
            }
            Json::Object(_) => {
                store.load_resource(json)?;
            }
            other => {
                return Err(Error::Store(format!(
                    "can only load objects or arrays of objects, got {other}"
                )));
            }
        }
        debug!(statements = store.len(), "loaded json document");
        Ok(store)
    }

    /// Parse and load a JSON text
    pub fn from_json_str(text: &str) -> Result<MemoryStore> {
        let json: Json =
            serde_json::from_str(text).map_err(|e| Error::Store(format!("bad json: {e}")))?;
        Self::from_json(&json)
    }

    fn next_anon_id(&mut self) -> String {
        self.next_anon += 1;
        format!("{}{}", ANON_ID_PREFIX, self.next_anon)
    }

    /// Load one resource object, returning its id
    fn load_resource(&mut self, json: &Json) -> Result<String> {
        let Json::Object(map) = json else {
            return Err(Error::Store(format!("expected an object, got {json}")));
        };
        let id = match map.get("id") {
            Some(Json::String(id)) => id.clone(),
            Some(other) => {
                return Err(Error::Store(format!("resource id must be a string: {other}")));
            }
            None => self.next_anon_id(),
        };
        for (key, value) in map {
            if key == "id" {
                continue;
            }
            self.load_property(&id, key, value)?;
        }
        Ok(id)
    }

    fn load_property(&mut self, subject: &str, predicate: &str, value: &Json) -> Result<()> {
        match value {
            Json::Object(_) => {
                let target = self.load_resource(value)?;
                self.insert(Statement::new(subject, predicate, target, ObjectType::Ref));
            }
            Json::Array(items) if !items.is_empty() => {
                for item in items {
                    match item {
                        // nested arrays keep their JSON encoding; flattening
                        // them would lose the inner list boundary
                        Json::Array(_) => {
                            self.insert(Statement::new(
                                subject,
                                predicate,
                                item.to_string(),
                                ObjectType::Json,
                            ));
                        }
                        _ => self.load_property(subject, predicate, item)?,
                    }
                }
            }
            Json::Array(_) => {
                // empty list value
                self.insert(Statement::new(subject, predicate, "[]", ObjectType::Json));
            }
            Json::String(s) if s.starts_with('@') && s.len() > 1 => {
                self.insert(Statement::new(subject, predicate, &s[1..], ObjectType::Ref));
            }
            scalar => {
                let (literal, object_type) = JsonSerializer.encode(&Value::from_json(scalar))?;
                self.insert(Statement::new(subject, predicate, literal, object_type));
            }
        }
        Ok(())
    }
}

fn sort_key(s: &Statement) -> (&str, &str, &str) {
    (&s.subject, &s.predicate, &s.object)
}

impl Store for MemoryStore {
    fn matching(&self, pattern: &TriplePattern, hints: &MatchHints) -> Result<StatementIter<'_>> {
        let offset = hints.offset.unwrap_or(0);
        let limit = hints.limit.unwrap_or(usize::MAX);
        let pattern = pattern.clone();
        Ok(Box::new(
            self.statements
                .iter()
                .filter(move |s| pattern.matches(s))
                .skip(offset)
                .take(limit)
                .map(|s| Ok(s.clone())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::from_json(&serde_json::json!([
            {"id": "s1", "name": "Alice", "age": 30},
            {"id": "s2", "name": "Bob", "tags": ["x", "y"]},
        ]))
        .expect("load")
    }

    #[test]
    fn test_load_counts() {
        let store = store();
        // s1: name, age; s2: name, tags x 2
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_matching_by_subject() {
        let store = store();
        let rows: Vec<Statement> = store
            .matching(&TriplePattern::subject("s2"), &MatchHints::default())
            .expect("match")
            .collect::<Result<_>>()
            .expect("rows");
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|s| s.subject == "s2"));
    }

    #[test]
    fn test_matching_by_predicate_and_object() {
        let store = store();
        let pattern = TriplePattern {
            predicate: Some("name".to_string()),
            object: Some("Alice".to_string()),
            ..TriplePattern::default()
        };
        let rows: Vec<Statement> = store
            .matching(&pattern, &MatchHints::default())
            .expect("match")
            .collect::<Result<_>>()
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].subject, "s1");
    }

    #[test]
    fn test_natural_order_is_sorted_by_subject() {
        let store = store();
        let rows: Vec<Statement> = store
            .matching(&TriplePattern::any(), &MatchHints::default())
            .expect("match")
            .collect::<Result<_>>()
            .expect("rows");
        let subjects: Vec<&str> = rows.iter().map(|s| s.subject.as_str()).collect();
        let mut sorted = subjects.clone();
        sorted.sort();
        assert_eq!(subjects, sorted);
    }

    #[test]
    fn test_nested_object_becomes_anonymous_resource() {
        let store = MemoryStore::from_json(&serde_json::json!([
            {"id": "s1", "address": {"city": "Utrecht"}},
        ]))
        .expect("load");

        let rows: Vec<Statement> = store
            .matching(&TriplePattern::subject("s1"), &MatchHints::default())
            .expect("match")
            .collect::<Result<_>>()
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].object_type, ObjectType::Ref);
        assert!(tern_core::is_anonymous_id(&rows[0].object));

        let nested: Vec<Statement> = store
            .matching(
                &TriplePattern::subject(rows[0].object.clone()),
                &MatchHints::default(),
            )
            .expect("match")
            .collect::<Result<_>>()
            .expect("rows");
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].predicate, "city");
        assert_eq!(nested[0].object, "Utrecht");
    }

    #[test]
    fn test_reference_syntax() {
        let store = MemoryStore::from_json(&serde_json::json!([
            {"id": "s1", "next": "@s2", "note": "plain"},
        ]))
        .expect("load");
        let rows: Vec<Statement> = store
            .matching(&TriplePattern::subject("s1"), &MatchHints::default())
            .expect("match")
            .collect::<Result<_>>()
            .expect("rows");
        let next = rows.iter().find(|s| s.predicate == "next").expect("next");
        assert_eq!(next.object, "s2");
        assert_eq!(next.object_type, ObjectType::Ref);
        let note = rows.iter().find(|s| s.predicate == "note").expect("note");
        assert_eq!(note.object_type, ObjectType::String);
    }

    #[test]
    fn test_hints_limit_and_offset() {
        let store = store();
        let rows: Vec<Statement> = store
            .matching(
                &TriplePattern::any(),
                &MatchHints {
                    limit: Some(2),
                    offset: Some(1),
                },
            )
            .expect("match")
            .collect::<Result<_>>()
            .expect("rows");
        assert_eq!(rows.len(), 2);
    }
}
