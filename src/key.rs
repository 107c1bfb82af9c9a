use std::{
    fmt::{self, Debug, Display, Formatter},
    rc::Rc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A key identifying one query: an ordered sequence of JSON values
///
/// Keys that are equal by value hash identically regardless of object key
/// order, so `["todos", {"page": 1, "size": 10}]` and
/// `["todos", {"size": 10, "page": 1}]` address the same cache entry.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey {
    parts: Rc<Vec<Value>>,
}

impl QueryKey {
    /// Creates a key from its parts
    #[must_use = "Creating a key has no effect"]
    pub fn new(parts: impl Into<Vec<Value>>) -> Self {
        Self {
            parts: Rc::new(parts.into()),
        }
    }

    /// The parts of this key, in order
    #[must_use = "Has no effect other than to read the parts"]
    #[inline]
    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    /// Canonical hash of this key: the stable, recursively key-sorted
    /// serialization of its parts
    #[must_use = "Hashing a key has no effect"]
    pub fn hash(&self) -> QueryHash {
        let mut out = String::from("[");
        for (idx, part) in self.parts.iter().enumerate() {
            if idx > 0 {
                out.push(',');
            }
            write_stable(&mut out, part);
        }
        out.push(']');
        QueryHash(out.into())
    }

    /// Whether `self` partially matches `other`: `self` must be a prefix of
    /// `other` and every part must be contained in the corresponding part
    #[must_use = "Has no effect other than to compare the keys"]
    pub fn matches_partially(&self, other: &Self) -> bool {
        self.parts.len() <= other.parts.len()
            && self
                .parts
                .iter()
                .zip(other.parts.iter())
                .all(|(filter, part)| value_contains(part, filter))
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self::new(parts)
    }
}

/// A JSON array becomes the key's parts; any other value becomes a
/// single-part key
impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(parts) => Self::new(parts),
            other => Self::new(vec![other]),
        }
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        Self::new(vec![Value::String(part.to_owned())])
    }
}

impl Debug for QueryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.parts, f)
    }
}

impl Display for QueryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash())
    }
}

/// The canonical form of a [`QueryKey`], used as the cache index
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(Rc<str>);

impl QueryHash {
    /// Wraps an externally computed hash, for per-query hash overrides
    #[must_use = "Creating a hash has no effect"]
    pub fn custom(hash: impl Into<Rc<str>>) -> Self {
        Self(hash.into())
    }

    /// The canonical string form
    #[must_use = "Has no effect other than to read the hash"]
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for QueryHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for QueryHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serializes `value` with object keys sorted at every depth
fn write_stable(out: &mut String, value: &Value) {
    match *value {
        Value::Object(ref map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                // String keys always serialize
                #[allow(clippy::unwrap_used)]
                out.push_str(&serde_json::to_string(key).unwrap());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_stable(out, inner);
                }
            }
            out.push('}');
        }
        Value::Array(ref items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_stable(out, item);
            }
            out.push(']');
        }
        ref scalar => out.push_str(&scalar.to_string()),
    }
}

/// Whether `inner` is structurally contained in `outer`: objects may have
/// extra entries, everything else must be equal
fn value_contains(outer: &Value, inner: &Value) -> bool {
    match (outer, inner) {
        (&Value::Object(ref outer), &Value::Object(ref inner)) => inner
            .iter()
            .all(|(key, value)| outer.get(key).is_some_and(|o| value_contains(o, value))),
        (&Value::Array(ref outer), &Value::Array(ref inner)) => {
            inner.len() <= outer.len()
                && inner
                    .iter()
                    .zip(outer.iter())
                    .all(|(i, o)| value_contains(o, i))
        }
        (outer, inner) => outer == inner,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn hash_ignores_object_key_order() {
        let a = QueryKey::from(json!(["todos", { "page": 1, "size": 10 }]));
        let b = QueryKey::from(json!(["todos", { "size": 10, "page": 1 }]));
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn hash_sorts_nested_keys() {
        let key = QueryKey::from(json!([{ "b": { "y": 2, "x": 1 }, "a": 0 }]));
        assert_eq!(key.hash().as_str(), r#"[{"a":0,"b":{"x":1,"y":2}}]"#);
    }

    #[test]
    fn different_keys_hash_differently() {
        let a = QueryKey::from(json!(["user", 1]));
        let b = QueryKey::from(json!(["user", 2]));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn partial_match_is_prefix_based() {
        let filter = QueryKey::from(json!(["todos"]));
        let key = QueryKey::from(json!(["todos", { "page": 1 }]));
        assert!(filter.matches_partially(&key));
        assert!(!key.matches_partially(&filter));
    }

    #[test]
    fn partial_match_allows_extra_object_entries() {
        let filter = QueryKey::from(json!(["todos", { "page": 1 }]));
        let key = QueryKey::from(json!(["todos", { "page": 1, "size": 10 }]));
        assert!(filter.matches_partially(&key));

        let other_page = QueryKey::from(json!(["todos", { "page": 2, "size": 10 }]));
        assert!(!filter.matches_partially(&other_page));
    }
}
