//! Free-form metadata maps with namespace-aware merging.
//!
//! Keys are namespace-prefixed (`view`, `cmd:cwd`, `term:fontsize`). A clear
//! key of the form `"<ns>:*"` with value `true` requests that every key under
//! `<ns>:` be removed from the target before the incoming values apply.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaMap(pub BTreeMap<String, Value>);

impl MetaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.0.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => default.to_string(),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            _ => default,
        }
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        match self.0.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_map(&self, key: &str) -> Option<MetaMap> {
        match self.0.get(key) {
            Some(Value::Object(m)) => Some(MetaMap(
                m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            _ => None,
        }
    }
}

impl Deref for MetaMap {
    type Target = BTreeMap<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MetaMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<(String, Value)> for MetaMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        MetaMap(iter.into_iter().collect())
    }
}

fn is_clear_key(key: &str) -> Option<&str> {
    key.strip_suffix(":*")
}

/// Merge `incoming` into `target`. Null values delete keys in both modes.
/// With `special`, a `"<ns>:*": true` entry first erases every `<ns>:` key in
/// the target; clear keys themselves are never stored.
pub fn merge_meta(mut target: MetaMap, incoming: &MetaMap, special: bool) -> MetaMap {
    if special {
        for (key, val) in incoming.iter() {
            let Some(ns) = is_clear_key(key) else {
                continue;
            };
            if val == &Value::Bool(true) {
                let prefix = format!("{ns}:");
                target.0.retain(|k, _| !k.starts_with(&prefix));
            }
        }
    }
    for (key, val) in incoming.iter() {
        if special && is_clear_key(key).is_some() {
            continue;
        }
        if val.is_null() {
            target.0.remove(key);
        } else {
            target.0.insert(key.clone(), val.clone());
        }
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: &[(&str, Value)]) -> MetaMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_simple_merge_overwrites_and_deletes() {
        let target = meta(&[("view", json!("term")), ("cmd:cwd", json!("/tmp"))]);
        let incoming = meta(&[("view", json!("web")), ("cmd:cwd", Value::Null)]);
        let merged = merge_meta(target, &incoming, false);
        assert_eq!(merged.get_string("view", ""), "web");
        assert!(merged.get("cmd:cwd").is_none());
    }

    #[test]
    fn test_merge_with_nil_is_identity() {
        let target = meta(&[("view", json!("term"))]);
        let merged = merge_meta(target.clone(), &MetaMap::new(), false);
        assert_eq!(merged, target);
    }

    #[test]
    fn test_simple_merge_is_associative() {
        let a = meta(&[("k1", json!(1)), ("k2", json!(2))]);
        let b = meta(&[("k2", json!(20)), ("k3", Value::Null)]);
        let c = meta(&[("k3", json!(30)), ("k1", Value::Null)]);

        let left = merge_meta(merge_meta(a.clone(), &b, false), &c, false);
        let bc = merge_meta(b.clone(), &c, false);
        let right = merge_meta(a, &bc, false);
        assert_eq!(left, right);
    }

    #[test]
    fn test_special_merge_clears_namespace() {
        let target = meta(&[
            ("term:fontsize", json!(12)),
            ("term:theme", json!("dark")),
            ("view", json!("term")),
        ]);
        let incoming = meta(&[("term:*", json!(true)), ("term:fontsize", json!(14))]);
        let merged = merge_meta(target, &incoming, true);
        assert_eq!(merged.get_float("term:fontsize", 0.0), 14.0);
        assert!(merged.get("term:theme").is_none());
        assert_eq!(merged.get_string("view", ""), "term");
        // the clear key itself is not stored
        assert!(merged.get("term:*").is_none());
    }

    #[test]
    fn test_simple_merge_keeps_clear_keys_literal() {
        let target = meta(&[("term:fontsize", json!(12))]);
        let incoming = meta(&[("term:*", json!(true))]);
        let merged = merge_meta(target, &incoming, false);
        assert_eq!(merged.get_float("term:fontsize", 0.0), 12.0);
        assert!(merged.get_bool("term:*", false));
    }
}
