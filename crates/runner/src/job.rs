//! Before/after jobs attached to test cases

use apitest_common::Job;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::error::{RunnerError, RunnerResult};
use crate::expr::ExprEngine;

/// Executes the side-effecting items of a job
pub trait JobRunner: Send + Sync {
    /// `ctx` is the suite-level data context, `current` the output of the
    /// test case when running an after-job
    fn run(&self, job: &Job, ctx: &Value, current: &Value) -> RunnerResult<()>;
}

/// Evaluates each item as an expression over `{ctx, current}`
#[derive(Debug, Clone, Default)]
pub struct ExprJobRunner {
    engine: Arc<ExprEngine>,
}

impl ExprJobRunner {
    pub fn new(engine: Arc<ExprEngine>) -> Self {
        Self { engine }
    }
}

impl JobRunner for ExprJobRunner {
    fn run(&self, job: &Job, ctx: &Value, current: &Value) -> RunnerResult<()> {
        let mut env = Map::new();
        env.insert("ctx".to_string(), ctx.clone());
        env.insert("current".to_string(), current.clone());

        for item in &job.items {
            debug!(item = %item, "running job item");
            self.engine
                .run(item, &env)
                .map_err(|e| RunnerError::Job(e.to_string()))?;
        }
        Ok(())
    }
}
