//! Qualified-name expansion
//!
//! A `namemap` declared on a select maps short names to their stored form.
//! Two spellings are supported: an entry `("ex", "http://example.com/")`
//! expands the qualified name `ex:created` to `http://example.com/created`,
//! and an exact-match entry replaces the whole name. Nested selects carry
//! their own namemap merged over the enclosing one, innermost wins.

use serde::{Deserialize, Serialize};

/// Ordered prefix/replacement table for property and id names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameMap {
    entries: Vec<(String, String)>,
}

impl NameMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add an entry; later entries shadow earlier ones with the same key
    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, replacement: V) {
        let key = key.into();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, replacement.into()));
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Layer `inner` over this map: inner entries win on conflict
    pub fn merged(&self, inner: &NameMap) -> NameMap {
        let mut out = self.clone();
        for (k, v) in &inner.entries {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    /// Expand a name: exact matches replace the whole name, otherwise a
    /// `prefix:rest` name with a known prefix becomes `replacement + rest`
    pub fn resolve(&self, name: &str) -> String {
        for (key, replacement) in &self.entries {
            if key == name {
                return replacement.clone();
            }
        }
        if let Some((prefix, rest)) = name.split_once(':') {
            for (key, replacement) in &self.entries {
                if key == prefix {
                    return format!("{replacement}{rest}");
                }
            }
        }
        name.to_string()
    }
}

impl FromIterator<(String, String)> for NameMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut map = NameMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_expansion() {
        let mut map = NameMap::new();
        map.insert("ex", "http://example.com/");
        assert_eq!(map.resolve("ex:created"), "http://example.com/created");
        assert_eq!(map.resolve("other"), "other");
        assert_eq!(map.resolve("unknown:x"), "unknown:x");
    }

    #[test]
    fn test_exact_match_wins_over_prefix() {
        let mut map = NameMap::new();
        map.insert("ex", "http://example.com/");
        map.insert("ex:special", "urn:special");
        assert_eq!(map.resolve("ex:special"), "urn:special");
        assert_eq!(map.resolve("ex:other"), "http://example.com/other");
    }

    #[test]
    fn test_merged_innermost_wins() {
        let mut outer = NameMap::new();
        outer.insert("a", "outer-a/");
        outer.insert("b", "outer-b/");
        let mut inner = NameMap::new();
        inner.insert("a", "inner-a/");

        let merged = outer.merged(&inner);
        assert_eq!(merged.resolve("a:x"), "inner-a/x");
        assert_eq!(merged.resolve("b:x"), "outer-b/x");
    }
}
