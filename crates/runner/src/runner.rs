//! Protocol-independent test case execution

use apitest_common::{TestCase, TestSuite};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{RunnerError, RunnerResult};

/// Runs one test case and returns its verified output
#[async_trait]
pub trait TestCaseRunner: Send + Sync {
    /// `ctx` is the data context shared by the suite; the returned value is
    /// the verified response envelope
    async fn run_test_case(
        &self,
        case: &TestCase,
        ctx: &Value,
        cancel: CancellationToken,
    ) -> RunnerResult<Value>;
}

/// Run every case of `suite` in order and stop at the first failure.
///
/// The data context starts as `{"param": <suite.param>}`; each case's output
/// is added under the case name before the next case runs. Returns the final
/// context.
pub async fn run_suite<R>(runner: &R, suite: &TestSuite, cancel: CancellationToken) -> RunnerResult<Value>
where
    R: TestCaseRunner + ?Sized,
{
    info!(suite = %suite.name, cases = suite.items.len(), "start to run suite");

    let mut ctx = json!({ "param": suite.param });
    for case in &suite.items {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        let output = runner.run_test_case(case, &ctx, cancel.clone()).await?;
        if let Some(map) = ctx.as_object_mut() {
            map.insert(case.name.clone(), output);
        }
    }
    Ok(ctx)
}
