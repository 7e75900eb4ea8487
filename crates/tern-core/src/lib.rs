//! TernQL Core Library
//!
//! This crate provides the fundamental types, traits, and error handling
//! shared by the TernQL query engine and its store implementations.
//!
//! # Overview
//!
//! TernQL compiles a JSON-shaped query language into join plans over a
//! triple-oriented data store and evaluates them into nested JSON-like
//! values. This crate defines the boundary between the engine and the
//! outside world:
//!
//! - `value` - the JSON-shaped `Value` produced by queries
//! - `statement` - triples (statements) and match patterns
//! - `store` - the read-only store contract and the literal serializer
//! - `namemap` - qualified-name expansion declared with `namemap`
//! - `error` - error types and result aliases

pub mod error;
pub mod namemap;
pub mod statement;
pub mod store;
pub mod value;

pub use error::{Error, Result};
pub use namemap::NameMap;
pub use statement::{
    is_anonymous_id, MatchHints, ObjectType, Statement, TriplePattern, TriplePos, ANON_ID_PREFIX,
};
pub use store::{JsonSerializer, Serializer, StatementIter, Store};
pub use value::{Value, ValueMap};
