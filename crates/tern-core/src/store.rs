//! Store and serializer contracts
//!
//! The engine consumes storage through two narrow traits: `Store` answers
//! pattern-matched statement lookups, `Serializer` converts between stored
//! object literals and native values. The engine never mutates a store.

use crate::error::{Error, Result};
use crate::statement::{MatchHints, ObjectType, Statement, TriplePattern};
use crate::value::Value;

/// Lazy sequence of statements returned by a lookup. Dropping it mid-way
/// must abandon the lookup without further store calls.
pub type StatementIter<'a> = Box<dyn Iterator<Item = Result<Statement>> + 'a>;

/// Read-only statement lookup contract
pub trait Store {
    /// Return all statements matching the pattern, in the store's natural
    /// order (commonly sorted by subject)
    fn matching(&self, pattern: &TriplePattern, hints: &MatchHints) -> Result<StatementIter<'_>>;
}

/// Converts stored object literals to native values and back
pub trait Serializer {
    /// Decode a stored literal/object-type pair into a native value
    fn decode(&self, literal: &str, object_type: ObjectType) -> Result<Value>;

    /// Encode a native value into the store's literal encoding, e.g. before
    /// a bind-variable value is pushed into a lookup pattern
    fn encode(&self, value: &Value) -> Result<(String, ObjectType)>;
}

/// The default serializer: literals carry their JSON text form
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn decode(&self, literal: &str, object_type: ObjectType) -> Result<Value> {
        match object_type {
            ObjectType::Ref => Ok(Value::Ref(literal.to_string())),
            ObjectType::String => Ok(Value::String(literal.to_string())),
            ObjectType::Number => literal
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| Error::Serialization(format!("bad number literal: {literal:?}"))),
            ObjectType::Bool => match literal {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(Error::Serialization(format!(
                    "bad boolean literal: {literal:?}"
                ))),
            },
            ObjectType::Null => Ok(Value::Null),
            ObjectType::Json => {
                let json: serde_json::Value = serde_json::from_str(literal).map_err(|e| {
                    Error::Serialization(format!("bad json literal {literal:?}: {e}"))
                })?;
                Ok(Value::from_json(&json))
            }
        }
    }

    fn encode(&self, value: &Value) -> Result<(String, ObjectType)> {
        Ok(match value {
            Value::Null => (String::new(), ObjectType::Null),
            Value::Bool(b) => (b.to_string(), ObjectType::Bool),
            Value::Number(n) => {
                // keep whole numbers in integer form so lookups can match
                // either spelling of the same value
                let literal = if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    (*n as i64).to_string()
                } else {
                    n.to_string()
                };
                (literal, ObjectType::Number)
            }
            Value::String(s) => (s.clone(), ObjectType::String),
            Value::Ref(id) => (id.clone(), ObjectType::Ref),
            Value::List(_) | Value::Object(_) => {
                let text = serde_json::to_string(&value.to_json())
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                (text, ObjectType::Json)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scalars() {
        let s = JsonSerializer;
        assert_eq!(
            s.decode("Alice", ObjectType::String).expect("decode"),
            Value::String("Alice".to_string())
        );
        assert_eq!(
            s.decode("42", ObjectType::Number).expect("decode"),
            Value::Number(42.0)
        );
        assert_eq!(
            s.decode("true", ObjectType::Bool).expect("decode"),
            Value::Bool(true)
        );
        assert_eq!(s.decode("", ObjectType::Null).expect("decode"), Value::Null);
        assert_eq!(
            s.decode("s2", ObjectType::Ref).expect("decode"),
            Value::Ref("s2".to_string())
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let s = JsonSerializer;
        assert!(s.decode("abc", ObjectType::Number).is_err());
        assert!(s.decode("yes", ObjectType::Bool).is_err());
    }

    #[test]
    fn test_encode_roundtrip() {
        let s = JsonSerializer;
        for value in [
            Value::Null,
            Value::Bool(false),
            Value::Number(2.0),
            Value::Number(2.5),
            Value::String("hi".into()),
            Value::Ref("s9".into()),
            Value::List(vec![Value::Number(1.0), Value::String("x".into())]),
        ] {
            let (literal, object_type) = s.encode(&value).expect("encode");
            assert_eq!(s.decode(&literal, object_type).expect("decode"), value);
        }
    }
}
