//! Structural JSON comparison with aggregated, path-qualified errors

use serde_json::{Map, Value};
use std::fmt;

/// A tree of comparison failures.
///
/// Leaves carry a message and no children; internal nodes only group their
/// children. Rendering walks the tree depth-first and emits one line per leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonError {
    pub path: Vec<String>,
    pub message: String,
    pub children: Vec<ComparisonError>,
}

impl ComparisonError {
    pub fn leaf(path: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
            children: Vec::new(),
        }
    }

    /// Group errors under a path. A single child is returned as is.
    pub fn node(path: Vec<String>, mut children: Vec<ComparisonError>) -> Self {
        if children.len() == 1 {
            return children.remove(0);
        }
        Self {
            path,
            message: String::new(),
            children,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Leaves in depth-first order
    pub fn leaves(&self) -> Vec<&ComparisonError> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(err) = stack.pop() {
            if err.is_leaf() {
                out.push(err);
            } else {
                stack.extend(err.children.iter().rev());
            }
        }
        out
    }

    pub fn dotted_path(&self) -> String {
        if self.path.is_empty() {
            "<root>".to_string()
        } else {
            self.path.join(".")
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.leaves()
            .into_iter()
            .map(|leaf| format!("field {}: {}", leaf.dotted_path(), leaf.message))
            .collect()
    }

    pub fn render(&self) -> String {
        self.lines().join("\n")
    }
}

impl fmt::Display for ComparisonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl std::error::Error for ComparisonError {}

/// Compare two arbitrary JSON values
pub fn compare_element(expected: &Value, actual: &Value) -> Result<(), ComparisonError> {
    into_result(compare_value(Vec::new(), expected, actual))
}

/// Compare two objects; `field` prefixes every reported path
pub fn compare_object(
    field: &str,
    expected: &Map<String, Value>,
    actual: &Map<String, Value>,
) -> Result<(), ComparisonError> {
    into_result(compare_maps(field_path(field), expected, actual))
}

/// Compare two arrays; `field` prefixes every reported path
pub fn compare_array(field: &str, expected: &[Value], actual: &[Value]) -> Result<(), ComparisonError> {
    into_result(compare_slices(field_path(field), expected, actual))
}

fn into_result(err: Option<ComparisonError>) -> Result<(), ComparisonError> {
    match err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn field_path(field: &str) -> Vec<String> {
    if field.is_empty() {
        Vec::new()
    } else {
        field.split('.').map(str::to_string).collect()
    }
}

fn child_path(path: &[String], segment: impl Into<String>) -> Vec<String> {
    let mut child = path.to_vec();
    child.push(segment.into());
    child
}

fn compare_value(path: Vec<String>, expected: &Value, actual: &Value) -> Option<ComparisonError> {
    let (expected_type, actual_type) = (type_name(expected), type_name(actual));
    if expected_type != actual_type {
        return Some(ComparisonError::leaf(
            path,
            format!("expect type {} but got {}", expected_type, actual_type),
        ));
    }

    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => compare_maps(path, e, a),
        (Value::Array(e), Value::Array(a)) => compare_slices(path, e, a),
        (Value::Number(_), Value::Number(_)) if numbers_equal(expected, actual) => None,
        (Value::Number(_), Value::Number(_)) => Some(mismatch(path, expected, actual)),
        _ if expected == actual => None,
        _ => Some(mismatch(path, expected, actual)),
    }
}

fn compare_maps(
    path: Vec<String>,
    expected: &Map<String, Value>,
    actual: &Map<String, Value>,
) -> Option<ComparisonError> {
    let mut keys: Vec<&String> = expected.keys().collect();
    keys.sort();

    let mut children = Vec::new();
    for key in keys {
        let item_path = child_path(&path, key.as_str());
        match actual.get(key) {
            None => children.push(ComparisonError::leaf(
                item_path,
                format!("field {} is not exist", key),
            )),
            Some(actual_value) => {
                if let Some(err) = compare_value(item_path, &expected[key], actual_value) {
                    children.push(err);
                }
            }
        }
    }

    if children.is_empty() {
        None
    } else {
        Some(ComparisonError::node(path, children))
    }
}

fn compare_slices(path: Vec<String>, expected: &[Value], actual: &[Value]) -> Option<ComparisonError> {
    if expected.len() != actual.len() {
        return Some(ComparisonError::leaf(
            path,
            format!(
                "length is not equal, expect {} fields but got {}",
                expected.len(),
                actual.len()
            ),
        ));
    }

    let children: Vec<ComparisonError> = expected
        .iter()
        .zip(actual)
        .enumerate()
        .filter_map(|(i, (e, a))| compare_value(child_path(&path, i.to_string()), e, a))
        .collect();

    if children.is_empty() {
        None
    } else {
        Some(ComparisonError::node(path, children))
    }
}

fn numbers_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn mismatch(path: Vec<String>, expected: &Value, actual: &Value) -> ComparisonError {
    ComparisonError::leaf(
        path,
        format!("expect {} but got {}", scalar(expected), scalar(actual)),
    )
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Object(_) => "object",
        Value::Array(_) => "array",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_identical_trees() {
        let value = json!({"a": [1, {"b": "c"}], "d": null, "e": true});
        assert!(compare_element(&value, &value.clone()).is_ok());
    }

    #[test]
    fn test_reports_every_mismatch() {
        let expected = json!({"data": [{"key": "hello", "value": "func() string"}]});
        let actual = json!({"data": [{"key": "hell", "value": "func() strin"}]});

        let err = compare_element(&expected, &actual).unwrap_err();
        let lines = err.lines();
        assert_eq!(
            lines,
            vec![
                "field data.0.key: expect hello but got hell".to_string(),
                "field data.0.value: expect func() string but got func() strin".to_string(),
            ]
        );
        assert_eq!(err.to_string(), lines.join("\n"));
    }

    #[test]
    fn test_single_leaf_mismatch() {
        let expected = json!({"data": [{"key": "hello", "value": "world"}]});
        let actual = json!({"data": [{"key": "hell", "value": "world"}]});

        let err = compare_element(&expected, &actual).unwrap_err();
        let leaves = err.leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].dotted_path(), "data.0.key");
        assert!(leaves[0].message.contains("hello"));
        assert!(leaves[0].message.contains("hell"));
    }

    #[test]
    fn test_missing_key_reports_full_path() {
        let expected = json!({"a": {"b": {"c": 1}}});
        let actual = json!({"a": {"b": {}}});

        let err = compare_element(&expected, &actual).unwrap_err();
        let leaves = err.leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].path, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_extra_actual_keys_are_ignored() {
        let expected = json!({"a": 1});
        let actual = json!({"a": 1, "b": 2});
        assert!(compare_element(&expected, &actual).is_ok());
    }

    #[test]
    fn test_array_length_is_one_error() {
        let expected = json!({"items": [1, 2, 3]});
        let actual = json!({"items": [1]});

        let err = compare_element(&expected, &actual).unwrap_err();
        assert_eq!(
            err.lines(),
            vec!["field items: length is not equal, expect 3 fields but got 1".to_string()]
        );
    }

    #[test_case(json!(1), json!(1.0) ; "integer and float")]
    #[test_case(json!(-3), json!(-3) ; "negative")]
    #[test_case(json!(u64::MAX), json!(u64::MAX) ; "large unsigned")]
    fn test_numbers_compare_by_value(expected: Value, actual: Value) {
        assert!(compare_element(&expected, &actual).is_ok());
    }

    #[test_case(json!("1"), json!(1), "expect type string but got number" ; "string and number")]
    #[test_case(json!({}), json!([]), "expect type object but got array" ; "object and array")]
    #[test_case(json!(null), json!(false), "expect type null but got boolean" ; "null and boolean")]
    fn test_type_mismatch(expected: Value, actual: Value, message: &str) {
        let err = compare_element(&expected, &actual).unwrap_err();
        assert_eq!(err.lines(), vec![format!("field <root>: {}", message)]);
    }

    #[test]
    fn test_object_entry_point_prefixes_field() {
        let expected = json!({"version": "v1"});
        let actual = json!({"version": "v2"});
        let err = compare_object(
            "GetVersion[0]",
            expected.as_object().unwrap(),
            actual.as_object().unwrap(),
        )
        .unwrap_err();
        assert_eq!(
            err.lines(),
            vec!["field GetVersion[0].version: expect v1 but got v2".to_string()]
        );
    }

    #[test]
    fn test_array_entry_point() {
        let expected = vec![json!({"id": 1}), json!({"id": 2})];
        let actual = vec![json!({"id": 1}), json!({"id": 3})];
        let err = compare_array("data", &expected, &actual).unwrap_err();
        assert_eq!(err.lines(), vec!["field data.1.id: expect 2 but got 3".to_string()]);
    }

    #[test]
    fn test_tree_renders_depth_first() {
        let tree = ComparisonError::node(
            vec![],
            vec![
                ComparisonError::node(
                    vec!["a".into()],
                    vec![
                        ComparisonError::leaf(vec!["a".into(), "x".into()], "one"),
                        ComparisonError::leaf(vec!["a".into(), "y".into()], "two"),
                    ],
                ),
                ComparisonError::leaf(vec!["b".into()], "three"),
            ],
        );
        assert_eq!(tree.render(), "field a.x: one\nfield a.y: two\nfield b: three");
    }
}
