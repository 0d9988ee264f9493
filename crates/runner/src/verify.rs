//! Response verification: field expectations and expression assertions

use apitest_common::ConditionalVerify;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::compare::{self, ComparisonError};
use crate::expr::{ExprEngine, ExprError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    #[error("{0}")]
    Mismatch(#[from] ComparisonError),

    #[error("failed to verify: {expr:?}{}", cause_suffix(.cause))]
    Failed {
        expr: String,
        cause: Option<ExprError>,
    },

    #[error("invalid expectation: {0}")]
    InvalidExpectation(String),
}

fn cause_suffix(cause: &Option<ExprError>) -> String {
    match cause {
        Some(cause) => format!(", {}", cause),
        None => String::new(),
    }
}

/// Run every expression in order, stopping at the first one that does not
/// evaluate to `true`
pub fn evaluate_assertions(
    engine: &ExprEngine,
    exprs: &[String],
    env: &Map<String, Value>,
) -> Result<(), VerifyError> {
    for expr in exprs {
        match engine.evaluate(expr, env) {
            Ok(true) => debug!(expr = %expr, "assertion passed"),
            Ok(false) => {
                return Err(VerifyError::Failed {
                    expr: expr.clone(),
                    cause: None,
                })
            }
            Err(cause) => {
                return Err(VerifyError::Failed {
                    expr: expr.clone(),
                    cause: Some(cause),
                })
            }
        }
    }
    Ok(())
}

/// Run each group's assertions only when all of its conditions hold.
///
/// A condition that fails to evaluate counts as false.
pub fn conditional_verify(
    engine: &ExprEngine,
    groups: &[ConditionalVerify],
    env: &Map<String, Value>,
) -> Result<(), VerifyError> {
    for (index, group) in groups.iter().enumerate() {
        let applies = group.condition.iter().all(|condition| {
            match engine.evaluate(condition, env) {
                Ok(result) => result,
                Err(e) => {
                    debug!(condition = %condition, error = %e, "condition errored, treating as false");
                    false
                }
            }
        });

        if applies {
            evaluate_assertions(engine, &group.verify, env)?;
        } else {
            debug!(group = index, "skipping conditional verification group");
        }
    }
    Ok(())
}

/// Check dotted-path expectations such as `data.0.name` against a body.
///
/// Every failing field is reported.
pub fn verify_body_fields(fields: &BTreeMap<String, Value>, body: &Value) -> Result<(), VerifyError> {
    let mut errors = Vec::new();

    for (key, expected) in fields {
        let path: Vec<String> = key.split('.').map(str::to_string).collect();
        match lookup_path(body, key) {
            None => errors.push(ComparisonError::leaf(path, format!("not found field: {}", key))),
            Some(actual) if textual_number_match(expected, actual) => {}
            Some(actual) => {
                if let Err(err) = compare::compare_element(expected, actual) {
                    errors.extend(err.leaves().into_iter().map(|leaf| {
                        let mut full = path.clone();
                        full.extend(leaf.path.iter().cloned());
                        ComparisonError::leaf(full, leaf.message.clone())
                    }));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ComparisonError::node(Vec::new(), errors).into())
    }
}

/// A number expectation matches a string rendering of the same number,
/// which is how 64-bit integers appear in protobuf JSON.
fn textual_number_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(n), Value::String(s)) => n.to_string() == *s,
        _ => false,
    }
}

/// Resolve a dotted path; numeric segments index into arrays
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> Map<String, Value> {
        match json!({"data": [{"name": "linuxsuren", "count": "3"}]}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_assertions_short_circuit() {
        let engine = ExprEngine::new();
        let exprs = vec![
            "len(data) == 1".to_string(),
            "len(data) == 2".to_string(),
            "this is not valid".to_string(),
        ];

        let err = evaluate_assertions(&engine, &exprs, &env()).unwrap_err();
        assert_eq!(
            err,
            VerifyError::Failed {
                expr: "len(data) == 2".to_string(),
                cause: None
            }
        );
        assert_eq!(err.to_string(), r#"failed to verify: "len(data) == 2""#);
    }

    #[test]
    fn test_assertion_compile_failure() {
        let engine = ExprEngine::new();
        let err = evaluate_assertions(&engine, &["data ==".to_string()], &env()).unwrap_err();
        assert!(matches!(err, VerifyError::Failed { cause: Some(ExprError::Compile { .. }), .. }));
    }

    #[test]
    fn test_conditional_group_skipped() {
        let engine = ExprEngine::new();
        let groups = vec![
            ConditionalVerify {
                condition: vec!["len(data) > 5".to_string()],
                verify: vec!["false".to_string()],
            },
            ConditionalVerify {
                condition: vec!["unknown_var == 1".to_string()],
                verify: vec!["false".to_string()],
            },
        ];
        assert!(conditional_verify(&engine, &groups, &env()).is_ok());
    }

    #[test]
    fn test_conditional_group_applies() {
        let engine = ExprEngine::new();
        let groups = vec![ConditionalVerify {
            condition: vec!["len(data) == 1".to_string(), "true".to_string()],
            verify: vec![r#"data[0].name == "unknown""#.to_string()],
        }];
        let err = conditional_verify(&engine, &groups, &env()).unwrap_err();
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn test_lookup_path() {
        let body = json!({"data": [{"name": "a"}, {"name": "b"}]});
        assert_eq!(lookup_path(&body, "data.1.name"), Some(&json!("b")));
        assert_eq!(lookup_path(&body, "data.2.name"), None);
        assert_eq!(lookup_path(&body, "data.x"), None);
    }

    #[test]
    fn test_body_fields_aggregated() {
        let body = json!({"data": [{"name": "linuxsuren", "count": "3"}]});
        let mut fields = BTreeMap::new();
        fields.insert("data.0.name".to_string(), json!("someone"));
        fields.insert("data.0.count".to_string(), json!(3));
        fields.insert("data.0.missing".to_string(), json!(true));

        let err = verify_body_fields(&fields, &body).unwrap_err();
        let VerifyError::Mismatch(tree) = err else {
            panic!("expected a mismatch");
        };
        assert_eq!(
            tree.lines(),
            vec![
                "field data.0.missing: not found field: data.0.missing".to_string(),
                "field data.0.name: expect someone but got linuxsuren".to_string(),
            ]
        );
    }
}
