//! Statements (triples) and match patterns
//!
//! A statement is one `(subject, predicate, object, object-type, scope)` row
//! in the store. The object is kept in its stored literal encoding; the
//! `Serializer` turns it into a native `Value` at the row boundary.

use serde::{Deserialize, Serialize};

/// Prefix of store-generated (anonymous) resource ids. Ids with this prefix
/// belong to objects that only exist embedded inside another resource: the
/// evaluator expands them inline and never surfaces them as top-level
/// results.
pub const ANON_ID_PREFIX: &str = "_:j";

/// Returns true if the id was generated by the store rather than supplied
/// by the data
pub fn is_anonymous_id(id: &str) -> bool {
    id.starts_with(ANON_ID_PREFIX)
}

/// The encoding of a statement's object literal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    /// Reference to another resource id
    Ref,
    /// UTF-8 string
    String,
    /// Number, encoded in decimal
    Number,
    /// Boolean, encoded as "true"/"false"
    Bool,
    /// Null, encoded as the empty literal
    Null,
    /// Arbitrary JSON, encoded as its text form
    Json,
}

/// A single triple row in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// Resource id this statement is about
    pub subject: String,

    /// Property name
    pub predicate: String,

    /// Object literal, encoded per `object_type`
    pub object: String,

    /// Encoding of `object`
    pub object_type: ObjectType,

    /// Statement scope (named graph / revision context); empty for none
    pub scope: String,
}

impl Statement {
    /// Create a statement in the default scope
    pub fn new<S, P, O>(subject: S, predicate: P, object: O, object_type: ObjectType) -> Self
    where
        S: Into<String>,
        P: Into<String>,
        O: Into<String>,
    {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            object_type,
            scope: String::new(),
        }
    }

    /// Create a statement in an explicit scope
    pub fn with_scope<S, P, O, C>(
        subject: S,
        predicate: P,
        object: O,
        object_type: ObjectType,
        scope: C,
    ) -> Self
    where
        S: Into<String>,
        P: Into<String>,
        O: Into<String>,
        C: Into<String>,
    {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            object_type,
            scope: scope.into(),
        }
    }
}

/// A position within a statement row that a query label can bind to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriplePos {
    Subject,
    Predicate,
    Object,
}

impl TriplePos {
    /// Offset of this position within a statement row
    pub fn index(self) -> usize {
        match self {
            TriplePos::Subject => 0,
            TriplePos::Predicate => 1,
            TriplePos::Object => 2,
        }
    }
}

/// A pattern for statement lookup; `None` slots match anything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriplePattern {
    pub subject: Option<String>,
    pub predicate: Option<String>,
    pub object: Option<String>,
    pub object_type: Option<ObjectType>,
    pub scope: Option<String>,
}

impl TriplePattern {
    /// The wildcard pattern matching every statement
    pub fn any() -> Self {
        Self::default()
    }

    /// Pattern matching all statements about one subject
    pub fn subject<S: Into<String>>(subject: S) -> Self {
        Self {
            subject: Some(subject.into()),
            ..Self::default()
        }
    }

    /// Returns true if this pattern constrains nothing
    pub fn is_wildcard(&self) -> bool {
        self.subject.is_none()
            && self.predicate.is_none()
            && self.object.is_none()
            && self.object_type.is_none()
            && self.scope.is_none()
    }

    /// Test a statement against the pattern
    pub fn matches(&self, statement: &Statement) -> bool {
        if let Some(s) = &self.subject {
            if *s != statement.subject {
                return false;
            }
        }
        if let Some(p) = &self.predicate {
            if *p != statement.predicate {
                return false;
            }
        }
        if let Some(o) = &self.object {
            if *o != statement.object {
                return false;
            }
        }
        if let Some(t) = &self.object_type {
            if *t != statement.object_type {
                return false;
            }
        }
        if let Some(c) = &self.scope {
            if *c != statement.scope {
                return false;
            }
        }
        true
    }
}

/// Lookup hints passed through to the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchHints {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_ids() {
        assert!(is_anonymous_id("_:j1"));
        assert!(!is_anonymous_id("user-1"));
        // explicitly supplied blank-node style ids are not store-generated
        assert!(!is_anonymous_id("_:1"));
    }

    #[test]
    fn test_pattern_matching() {
        let st = Statement::new("s1", "name", "Alice", ObjectType::String);

        assert!(TriplePattern::any().matches(&st));
        assert!(TriplePattern::subject("s1").matches(&st));
        assert!(!TriplePattern::subject("s2").matches(&st));

        let pattern = TriplePattern {
            predicate: Some("name".to_string()),
            object: Some("Alice".to_string()),
            ..TriplePattern::default()
        };
        assert!(pattern.matches(&st));

        let wrong_type = TriplePattern {
            object_type: Some(ObjectType::Number),
            ..TriplePattern::default()
        };
        assert!(!wrong_type.matches(&st));
    }

    #[test]
    fn test_wildcard() {
        assert!(TriplePattern::any().is_wildcard());
        assert!(!TriplePattern::subject("s1").is_wildcard());
    }
}
