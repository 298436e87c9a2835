//! Live state → plain, storage-safe values.
//!
//! Anything `Serialize` becomes a detached [`Value`] tree: primitives and
//! null pass through, sequences keep their order, maps copy entry-wise.
//! [`pagebuilder_core::Live`] cells serialize as their inner value, so one
//! layer of shared-state wrapping disappears during the copy.
//!
//! Cycles cannot be expressed through `Serialize` on owned data; a graph
//! that reaches back into itself through `Live` will deadlock or recurse
//! without bound. Callers hand in trees.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::storage::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializeError(String);

impl SerializeError {
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serialization error: {}", self.0)
    }
}

impl std::error::Error for SerializeError {}

impl From<serde_json::Error> for SerializeError {
    fn from(e: serde_json::Error) -> Self {
        SerializeError(e.to_string())
    }
}

/// Deep-copy `value` into a plain [`Value`].
///
/// Non-finite floats become `null`. Map keys must serialize to strings
/// or integers; anything else is an error.
pub fn to_plain<T: Serialize + ?Sized>(value: &T) -> Result<Value, SerializeError> {
    Ok(serde_json::to_value(value)?)
}

/// Rebuild a typed value from a plain one.
pub fn from_plain<T: DeserializeOwned>(value: Value) -> Result<T, SerializeError> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagebuilder_core::Live;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};

    #[derive(Serialize)]
    struct Doc {
        title: Live<String>,
        tags: Live<Vec<String>>,
        nested: Vec<Live<u32>>,
    }

    #[test]
    fn test_primitives_pass_through() {
        assert_eq!(to_plain(&42).unwrap(), json!(42));
        assert_eq!(to_plain("hi").unwrap(), json!("hi"));
        assert_eq!(to_plain(&Option::<u8>::None).unwrap(), Value::Null);
        assert_eq!(to_plain(&true).unwrap(), json!(true));
    }

    #[test]
    fn test_sequences_keep_order() {
        assert_eq!(to_plain(&vec![3, 1, 2]).unwrap(), json!([3, 1, 2]));
    }

    #[test]
    fn test_live_cells_unwrap() {
        let doc = Doc {
            title: Live::new("Report".to_string()),
            tags: Live::new(vec!["a".into(), "b".into()]),
            nested: vec![Live::new(1), Live::new(2)],
        };
        assert_eq!(
            to_plain(&doc).unwrap(),
            json!({"title": "Report", "tags": ["a", "b"], "nested": [1, 2]})
        );
    }

    #[test]
    fn test_copy_is_detached() {
        let cell = Live::new(vec![1, 2]);
        let plain = to_plain(&cell).unwrap();
        cell.update(|v| v.push(3));
        assert_eq!(plain, json!([1, 2]));
    }

    #[test]
    fn test_integer_keys_become_strings() {
        let mut map = BTreeMap::new();
        map.insert(7, "seven");
        assert_eq!(to_plain(&map).unwrap(), json!({"7": "seven"}));
    }

    #[test]
    fn test_composite_keys_are_rejected() {
        let mut map = HashMap::new();
        map.insert((1, 2), "pair");
        let err = to_plain(&map).unwrap_err();
        assert!(err.message().contains("key must be a string"));
    }

    #[test]
    fn test_non_finite_floats_become_null() {
        assert_eq!(to_plain(&f64::NAN).unwrap(), Value::Null);
    }

    #[test]
    fn test_from_plain_reports_shape_errors() {
        let result: Result<Vec<u32>, _> = from_plain(json!({"not": "a list"}));
        assert!(result.is_err());
    }
}
