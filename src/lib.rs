//! TernQL - JSON-shaped query language over triple stores
//!
//! This is the main library crate that re-exports all TernQL components.
//!
//! ```
//! use ternql::{run_query, MemoryStore};
//!
//! let store = MemoryStore::from_json(&serde_json::json!([
//!     {"id": "s1", "name": "Alice"},
//!     {"id": "s2", "name": "Bob"},
//! ]))?;
//!
//! let results = run_query("{ name where (name = 'Alice') }", &store)?;
//! assert_eq!(results.len(), 1);
//! assert_eq!(results[0].to_json(), serde_json::json!({"name": "Alice"}));
//! # Ok::<(), ternql::Error>(())
//! ```

pub use tern_core as core;
pub use tern_query as query;
pub use tern_store as store;

// Re-export commonly used types
pub use tern_core::{
    is_anonymous_id, Error, JsonSerializer, MatchHints, NameMap, ObjectType, Result, Serializer,
    Statement, Store, TriplePattern, TriplePos, Value, ValueMap,
};

pub use tern_query::{
    compile, execute, get_results, run_query, CompiledQuery, ExecOptions, Execution,
    FunctionRegistry, QueryResult,
};

pub use tern_store::MemoryStore;
