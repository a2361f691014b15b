//! Canonical query keys.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::Result;

/// Recursively sort the keys of every JSON object in `value`.
///
/// Structurally equal parameter sets built in different orders canonicalize
/// to identical values, and therefore identical key strings.
pub fn canonicalize(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(&String, &Value)> = map.iter().collect();
      entries.sort_by(|a, b| a.0.cmp(b.0));
      Value::Object(
        entries
          .into_iter()
          .map(|(k, v)| (k.clone(), canonicalize(v)))
          .collect(),
      )
    }
    Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
    other => other.clone(),
  }
}

/// Identity of a query: a query family name plus canonical parameters.
///
/// The string form is `<name>:<canonicalParamsJson>`.
#[derive(Clone)]
pub struct QueryKey {
  name: String,
  params: Value,
  cache_key: String,
}

impl QueryKey {
  /// `name` may contain `:`; [`parse`](Self::parse) still recovers it.
  pub fn new(name: impl Into<String>, params: Value) -> Self {
    let name = name.into();
    let params = canonicalize(&params);
    let cache_key = format!("{}:{}", name, params);
    Self {
      name,
      params,
      cache_key,
    }
  }

  /// A key for a query family that takes no parameters.
  pub fn simple(name: impl Into<String>) -> Self {
    Self::new(name, Value::Null)
  }

  /// Build a key from any serializable parameter struct.
  pub fn with_params<P: Serialize + ?Sized>(name: impl Into<String>, params: &P) -> Result<Self> {
    Ok(Self::new(name, serde_json::to_value(params)?))
  }

  /// Parse the string form back into a key.
  pub fn parse(raw: &str) -> Option<Self> {
    // A name may itself contain `:`. Text of the form `<fragment>:<json>` is
    // never valid JSON, so the first split whose tail parses is the real one.
    raw
      .match_indices(':')
      .filter(|(at, _)| *at > 0)
      .find_map(|(at, _)| {
        let params: Value = serde_json::from_str(&raw[at + 1..]).ok()?;
        Some(Self::new(&raw[..at], params))
      })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn params(&self) -> &Value {
    &self.params
  }

  /// The canonical string used for lookup, de-duplication and persistence.
  pub fn cache_key(&self) -> &str {
    &self.cache_key
  }
}

impl PartialEq for QueryKey {
  fn eq(&self, other: &Self) -> bool {
    self.cache_key == other.cache_key
  }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.cache_key.hash(state);
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.cache_key)
  }
}

impl fmt::Debug for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "QueryKey({})", self.cache_key)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_canonicalize_ignores_key_order() {
    assert_eq!(
      canonicalize(&json!({"b": 1, "a": 2})).to_string(),
      canonicalize(&json!({"a": 2, "b": 1})).to_string()
    );
  }

  #[test]
  fn test_canonicalize_is_recursive() {
    let value = json!({
      "z": [{"y": 1, "x": 2}],
      "m": {"d": {"c": true, "b": null}, "a": "s"}
    });
    assert_eq!(
      canonicalize(&value).to_string(),
      r#"{"m":{"a":"s","d":{"b":null,"c":true}},"z":[{"x":2,"y":1}]}"#
    );
  }

  #[test]
  fn test_keys_from_different_call_sites_match() {
    #[derive(Serialize)]
    struct Listing {
      parent: &'static str,
      order_by: &'static str,
    }

    let from_struct = QueryKey::with_params(
      "directoryListing",
      &Listing {
        parent: "root",
        order_by: "name",
      },
    )
    .unwrap();
    let from_json = QueryKey::new(
      "directoryListing",
      json!({"orderBy": "ignored", "order_by": "name", "parent": "root"}),
    );
    let reordered = QueryKey::new(
      "directoryListing",
      json!({"parent": "root", "order_by": "name"}),
    );

    assert_ne!(from_struct, from_json);
    assert_eq!(from_struct, reordered);
    assert_eq!(
      from_struct.cache_key(),
      r#"directoryListing:{"order_by":"name","parent":"root"}"#
    );
  }

  #[test]
  fn test_parse_round_trips_cache_key() {
    let key = QueryKey::new("note", json!({"uuid": "abc", "full": true}));
    let parsed = QueryKey::parse(key.cache_key()).unwrap();
    assert_eq!(parsed, key);
    assert_eq!(parsed.name(), "note");

    assert_eq!(QueryKey::simple("notes").cache_key(), "notes:null");
    assert!(QueryKey::parse("no-separator").is_none());
    assert!(QueryKey::parse("notes:{broken").is_none());
  }

  #[test]
  fn test_parse_names_containing_colons() {
    let key = QueryKey::new("drive:listing", json!({"a": 1}));
    assert_eq!(key.cache_key(), r#"drive:listing:{"a":1}"#);

    let parsed = QueryKey::parse(key.cache_key()).unwrap();
    assert_eq!(parsed, key);
    assert_eq!(parsed.name(), "drive:listing");

    let simple = QueryKey::simple("a:b:c");
    assert_eq!(QueryKey::parse(simple.cache_key()), Some(simple));
    assert!(QueryKey::parse(":null").is_none());
  }
}
