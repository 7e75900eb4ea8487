//! TernQL in-memory store
//!
//! The smallest store that honors the `tern_core::Store` contract: a sorted
//! vector of statements with pattern-matched lookup. It exists so the query
//! engine can be exercised without a storage backend; persistent stores
//! implement the same contract elsewhere.

pub mod memory;

pub use memory::MemoryStore;
