//! Negative-test generation.
//!
//! A [`Mutator`] derives an adversarial variant of a test case, such as one
//! without credentials or with a too-short query value. [`ReverseRunner`]
//! runs every variant through a wrapped runner and expects each to be
//! rejected; a variant that succeeds exposes a validation gap.

use apitest_common::{QueryValue, TestCase, AUTHORIZATION};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::runner::TestCaseRunner;

const RANDOM_AUTH_LENGTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Mutator {
    MissingAuth,
    RandomAuth { length: usize },
    MissingRequiredQuery { field: String },
    ShortQuery { field: String, length: usize },
}

impl Mutator {
    /// Copy `case` and apply this mutation to the copy.
    ///
    /// Generated values are seeded from the original case, so applying the
    /// same mutator twice gives equal results.
    pub fn apply(&self, case: &TestCase) -> TestCase {
        let mut mutated = case.clone();
        let request = &mut mutated.request;

        match self {
            Mutator::MissingAuth => {
                request.header.retain(|k, _| !k.eq_ignore_ascii_case(AUTHORIZATION));
            }
            Mutator::RandomAuth { length } => {
                let original = case.request.header_value(AUTHORIZATION).unwrap_or_default();
                let key = auth_key(&request.header);
                let mut salt = 0u64;
                let token = loop {
                    let token = random_string(seed(case, self, salt), *length);
                    if token != original {
                        break token;
                    }
                    salt += 1;
                };
                request.header.insert(key, token);
            }
            Mutator::MissingRequiredQuery { field } => {
                request.query.remove(field);
            }
            Mutator::ShortQuery { field, length } => {
                let short = random_string(seed(case, self, 0), length.saturating_sub(1));
                match request.query.get_mut(field) {
                    Some(QueryValue::Plain(value)) => *value = short,
                    Some(QueryValue::Verified(verifier)) => verifier.value = short,
                    None => {
                        request.query.insert(field.clone(), QueryValue::Plain(short));
                    }
                }
            }
        }

        mutated
    }

    pub fn message(&self) -> String {
        match self {
            Mutator::MissingAuth => "Missing Authorization in header".to_string(),
            Mutator::RandomAuth { .. } => "Random Authorization in header".to_string(),
            Mutator::MissingRequiredQuery { field } => {
                format!("Missing required query field: {:?}", field)
            }
            Mutator::ShortQuery { field, .. } => format!("Min length query field: {:?}", field),
        }
    }
}

impl std::fmt::Display for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

/// Mutators applicable to `case`, in a stable order
pub fn discover(case: &TestCase) -> Vec<Mutator> {
    let mut mutators = Vec::new();

    if case.request.header_value(AUTHORIZATION).is_some() {
        mutators.push(Mutator::MissingAuth);
        mutators.push(Mutator::RandomAuth {
            length: RANDOM_AUTH_LENGTH,
        });
    }

    // BTreeMap iteration is already sorted by key
    for (field, value) in &case.request.query {
        let Some(verifier) = value.verifier() else {
            continue;
        };
        if verifier.required {
            mutators.push(Mutator::MissingRequiredQuery {
                field: field.clone(),
            });
        }
        if verifier.min_length > 0 {
            mutators.push(Mutator::ShortQuery {
                field: field.clone(),
                length: verifier.min_length,
            });
        }
    }

    mutators
}

/// Existing header key spelling, or the canonical one
fn auth_key(header: &std::collections::BTreeMap<String, String>) -> String {
    header
        .keys()
        .find(|k| k.eq_ignore_ascii_case(AUTHORIZATION))
        .cloned()
        .unwrap_or_else(|| AUTHORIZATION.to_string())
}

fn seed(case: &TestCase, mutator: &Mutator, salt: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    case.name.hash(&mut hasher);
    case.request.api.hash(&mut hasher);
    mutator.message().hash(&mut hasher);
    salt.hash(&mut hasher);
    hasher.finish()
}

fn random_string(seed: u64, length: usize) -> String {
    StdRng::seed_from_u64(seed)
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// A mutated variant the target rejected
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub mutator: Mutator,
    pub message: String,
    pub error: String,
}

/// Outcome of a reverse run where every variant was rejected
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MutationSummary {
    pub case: String,
    pub rejected: Vec<Rejection>,
}

impl MutationSummary {
    pub fn is_empty(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Runs mutated variants of a case and fails if any of them is accepted
pub struct ReverseRunner<R> {
    inner: R,
}

impl<R: TestCaseRunner> ReverseRunner<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Variants run one after another; the first accepted one aborts the run
    pub async fn run(
        &self,
        case: &TestCase,
        ctx: &Value,
        cancel: CancellationToken,
    ) -> RunnerResult<MutationSummary> {
        let mut summary = MutationSummary {
            case: case.name.clone(),
            rejected: Vec::new(),
        };

        for mutator in discover(case) {
            if cancel.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }

            let variant = mutator.apply(case);
            match self.inner.run_test_case(&variant, ctx, cancel.clone()).await {
                Ok(_) => {
                    return Err(RunnerError::MutationLeak {
                        case: case.name.clone(),
                        mutator: mutator.message(),
                    });
                }
                Err(RunnerError::Cancelled) => return Err(RunnerError::Cancelled),
                Err(e) => {
                    warn!(case = %case.name, mutator = %mutator, error = %e, "mutated request rejected");
                    summary.rejected.push(Rejection {
                        message: mutator.message(),
                        error: e.to_string(),
                        mutator,
                    });
                }
            }
        }

        info!(case = %case.name, variants = summary.rejected.len(), "all mutated requests rejected");
        Ok(summary)
    }
}

#[async_trait]
impl<R: TestCaseRunner> TestCaseRunner for ReverseRunner<R> {
    async fn run_test_case(
        &self,
        case: &TestCase,
        ctx: &Value,
        cancel: CancellationToken,
    ) -> RunnerResult<Value> {
        let summary = self.run(case, ctx, cancel).await?;
        Ok(serde_json::to_value(summary)?)
    }
}
