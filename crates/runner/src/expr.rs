//! Boolean expression language used by assertions and jobs
//!
//! Expressions are `rhai` expressions evaluated against a named environment.
//! Every top-level key of the environment becomes a variable, so a response
//! envelope `{"data": [...]}` is reachable as `data`.

use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Scope};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// An externally injected check, e.g. "does this resource exist"
pub type Validator = Arc<dyn Fn(&[String]) -> bool + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("failed to compile {expr:?}: {reason}")]
    Compile { expr: String, reason: String },

    #[error("failed to evaluate {expr:?}: {reason}")]
    Eval { expr: String, reason: String },

    #[error("expression {expr:?} returned {type_name}, not a boolean")]
    NotBoolean { expr: String, type_name: String },
}

pub struct ExprEngine {
    engine: Engine,
}

impl Default for ExprEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExprEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExprEngine").finish_non_exhaustive()
    }
}

impl ExprEngine {
    /// Engine with the built-in helpers registered
    pub fn new() -> Self {
        let mut engine = Engine::new();

        engine.register_fn(
            "sleep",
            |duration: ImmutableString| -> Result<bool, Box<EvalAltResult>> {
                let duration = humantime::parse_duration(duration.as_str())
                    .map_err(|e| format!("invalid duration {:?}: {}", duration.as_str(), e))?;
                std::thread::sleep(duration);
                Ok(true)
            },
        );
        engine.register_fn("sleep", |seconds: i64| -> bool {
            std::thread::sleep(Duration::from_secs(seconds.max(0) as u64));
            true
        });

        Self { engine }
    }

    /// Register a validator callable with one, two or three string arguments
    pub fn register_validator(&mut self, name: &str, validator: Validator) {
        let one = validator.clone();
        self.engine
            .register_fn(name, move |a: ImmutableString| one(&[a.to_string()]));

        let two = validator.clone();
        self.engine.register_fn(
            name,
            move |a: ImmutableString, b: ImmutableString| two(&[a.to_string(), b.to_string()]),
        );

        let three = validator;
        self.engine.register_fn(
            name,
            move |a: ImmutableString, b: ImmutableString, c: ImmutableString| {
                three(&[a.to_string(), b.to_string(), c.to_string()])
            },
        );
    }

    pub fn with_validator(mut self, name: &str, validator: Validator) -> Self {
        self.register_validator(name, validator);
        self
    }

    /// Evaluate one expression; anything but a boolean result is an error
    pub fn evaluate(&self, expr: &str, env: &Map<String, Value>) -> Result<bool, ExprError> {
        let result = self.eval(expr, env)?;
        result.as_bool().map_err(|type_name| ExprError::NotBoolean {
            expr: expr.to_string(),
            type_name: type_name.to_string(),
        })
    }

    /// Evaluate one expression for its side effects, ignoring the result
    pub fn run(&self, expr: &str, env: &Map<String, Value>) -> Result<(), ExprError> {
        self.eval(expr, env).map(|_| ())
    }

    fn eval(&self, expr: &str, env: &Map<String, Value>) -> Result<Dynamic, ExprError> {
        let ast = self
            .engine
            .compile_expression(expr)
            .map_err(|e| ExprError::Compile {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;

        let mut scope = Scope::new();
        for (name, value) in env {
            let value = rhai::serde::to_dynamic(value).map_err(|e| ExprError::Eval {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;
            scope.push_dynamic(name.as_str(), value);
        }

        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut scope, &ast)
            .map_err(|e| ExprError::Eval {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;

        debug!(expr, result = %result, "evaluated expression");
        Ok(result)
    }
}
