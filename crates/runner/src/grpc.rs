//! gRPC test case runner

use apitest_common::{
    DiscardTestReporter, Expect, Job, ReportRecord, Request, RpcDesc, RunnerConfig, Secure,
    TestCase, TestReporter, TestSuite,
};
use async_trait::async_trait;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

use crate::compare::{compare_array, compare_object, ComparisonError};
use crate::descriptor::{ApiName, DescriptorResolver, ResolvedMethod, RpcSource};
use crate::error::{RunnerError, RunnerResult};
use crate::expr::ExprEngine;
use crate::invoke::invoke;
use crate::job::{ExprJobRunner, JobRunner};
use crate::render::render_request;
use crate::runner::TestCaseRunner;
use crate::verify::{conditional_verify, evaluate_assertions, verify_body_fields, VerifyError};
use crate::GRPC_METHOD;

/// Runs test cases against one gRPC target
pub struct GrpcTestCaseRunner {
    host: String,
    rpc: RpcDesc,
    secure: Option<Secure>,
    config: RunnerConfig,
    reporter: Arc<dyn TestReporter>,
    job_runner: Arc<dyn JobRunner>,
    engine: Arc<ExprEngine>,
    resolver: DescriptorResolver,
    data_dir: PathBuf,
}

impl GrpcTestCaseRunner {
    /// `host` is used when a case's api does not name its own peer
    pub fn new(host: impl Into<String>, rpc: RpcDesc) -> Self {
        let engine = Arc::new(ExprEngine::new());
        Self {
            host: host.into(),
            rpc,
            secure: None,
            config: RunnerConfig::default(),
            reporter: Arc::new(DiscardTestReporter),
            job_runner: Arc::new(ExprJobRunner::new(engine.clone())),
            engine,
            resolver: DescriptorResolver::new(),
            data_dir: PathBuf::from("."),
        }
    }

    pub fn from_suite(suite: &TestSuite) -> Self {
        Self::new(suite.api.clone(), suite.spec.rpc.clone().unwrap_or_default())
            .with_secure(suite.spec.secure.clone())
    }

    pub fn with_secure(mut self, secure: Option<Secure>) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn TestReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_job_runner(mut self, job_runner: Arc<dyn JobRunner>) -> Self {
        self.job_runner = job_runner;
        self
    }

    /// Directory that `bodyFromFile` paths are relative to
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Replace the assertion engine, e.g. one carrying extra validators
    pub fn with_engine(mut self, engine: Arc<ExprEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// One skeleton test case per method the descriptor source declares
    pub async fn suggest_apis(&self, cancel: &CancellationToken) -> RunnerResult<Vec<TestCase>> {
        let source = RpcSource::from_desc(&self.rpc)?;
        let channel = match source {
            RpcSource::ServerReflection => Some(self.connect(&self.host, true, cancel).await?),
            _ => None,
        };

        let methods = self
            .resolver
            .list_methods(&source, channel.as_ref(), cancel)
            .await?;

        Ok(methods
            .into_iter()
            .map(|method| TestCase {
                name: method.method_name().to_string(),
                request: Request {
                    api: format!("/{}/{}", method.service_name(), method.method_name()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect())
    }

    async fn execute(
        &self,
        case: &TestCase,
        ctx: &Value,
        cancel: &CancellationToken,
        record: &mut ReportRecord,
    ) -> RunnerResult<Value> {
        let request = render_request(&case.request, ctx, &self.data_dir).await?;

        if let Some(job) = &case.before {
            self.run_job(job, ctx, &Value::Null).await?;
        }

        let api = ApiName::parse(&request.api)?;
        let source = RpcSource::from_desc(&self.rpc)?;
        let host = api.host.clone().unwrap_or_else(|| self.host.clone());

        info!(host = %host, api = %api, "start to send request");
        // only reflection needs the peer before the payload is decoded
        let eager = matches!(source, RpcSource::ServerReflection);
        let channel = self.connect(&host, eager, cancel).await?;
        let method = self
            .resolver
            .resolve(&source, &api, Some(&channel), cancel)
            .await?;

        let metadata = request_metadata(&request.header)?;
        let responses = invoke(
            channel,
            &method,
            request.body.as_str(),
            &metadata,
            cancel,
        )
        .await?;

        record.body = responses.first().cloned().unwrap_or_default();
        debug!(body = %record.body, responses = responses.len(), "response received");

        self.verify_responses(&method, case, &responses).await
    }

    async fn verify_responses(
        &self,
        method: &ResolvedMethod,
        case: &TestCase,
        responses: &[String],
    ) -> RunnerResult<Value> {
        let data = responses
            .iter()
            .map(|r| serde_json::from_str::<Value>(r))
            .collect::<Result<Vec<_>, _>>()?;

        verify_expected_body(&method.output(), &case.name, &case.expect, &data)?;

        let envelope = json!({ "data": data });
        if !case.expect.body_fields_expect.is_empty() {
            verify_body_fields(&case.expect.body_fields_expect, &envelope)?;
        }

        if !case.expect.verify.is_empty() || !case.expect.conditional_verify.is_empty() {
            let engine = self.engine.clone();
            let expect = case.expect.clone();
            let env = match &envelope {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };

            tokio::task::spawn_blocking(move || -> Result<(), VerifyError> {
                evaluate_assertions(&engine, &expect.verify, &env)?;
                conditional_verify(&engine, &expect.conditional_verify, &env)
            })
            .await
            .map_err(|e| RunnerError::Task(e.to_string()))??;
        }

        Ok(envelope)
    }

    async fn run_job(&self, job: &Job, ctx: &Value, current: &Value) -> RunnerResult<()> {
        let runner = self.job_runner.clone();
        let (job, ctx, current) = (job.clone(), ctx.clone(), current.clone());
        tokio::task::spawn_blocking(move || runner.run(&job, &ctx, &current))
            .await
            .map_err(|e| RunnerError::Task(e.to_string()))?
    }

    async fn connect(
        &self,
        host: &str,
        eager: bool,
        cancel: &CancellationToken,
    ) -> RunnerResult<Channel> {
        let connect_error = |reason: String| RunnerError::Connect {
            addr: host.to_string(),
            reason,
        };

        let tls = self.secure.as_ref().filter(|s| !s.insecure);
        let uri = if host.contains("://") {
            host.to_string()
        } else if tls.is_some() {
            format!("https://{}", host)
        } else {
            format!("http://{}", host)
        };

        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| connect_error(e.to_string()))?
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout);

        if let Some(secure) = tls {
            endpoint = endpoint
                .tls_config(tls_config(secure).await?)
                .map_err(|e| connect_error(e.to_string()))?;
        }

        if !eager {
            debug!(host, "deferring connection until the first call");
            return Ok(endpoint.connect_lazy());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RunnerError::Cancelled),
            channel = endpoint.connect() => channel.map_err(|e| connect_error(error_chain(&e))),
        }
    }
}

#[async_trait]
impl TestCaseRunner for GrpcTestCaseRunner {
    async fn run_test_case(
        &self,
        case: &TestCase,
        ctx: &Value,
        cancel: CancellationToken,
    ) -> RunnerResult<Value> {
        info!(case = %case.name, "start to run");

        let mut record = ReportRecord::start(GRPC_METHOD);
        record.group = case.group.clone();
        record.name = case.name.clone();
        record.api = case.request.api.clone();

        let result = match self.execute(case, ctx, &cancel, &mut record).await {
            Ok(output) => match &case.after {
                Some(job) => self.run_job(job, ctx, &output).await.map(|_| output),
                None => Ok(output),
            },
            Err(e) => Err(e),
        };

        record.finish(result.as_ref().err().map(|e| e.to_string()));
        self.reporter.put_record(record);
        result
    }
}

async fn tls_config(secure: &Secure) -> RunnerResult<ClientTlsConfig> {
    if secure.cert.is_empty() {
        return Err(RunnerError::Connect {
            addr: secure.server_name.clone(),
            reason: "a secure connection needs a CA certificate".to_string(),
        });
    }

    let pem = tokio::fs::read(&secure.cert).await?;
    let mut config = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem));
    if !secure.server_name.is_empty() {
        config = config.domain_name(secure.server_name.clone());
    }
    Ok(config)
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Request headers as gRPC metadata; names are lower-cased
pub fn request_metadata(headers: &BTreeMap<String, String>) -> RunnerResult<MetadataMap> {
    let mut metadata = MetadataMap::new();
    for (name, value) in headers {
        let key = MetadataKey::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map_err(|e| RunnerError::Format(format!("invalid header name {:?}: {}", name, e)))?;
        let value = MetadataValue::try_from(value.as_str())
            .map_err(|e| RunnerError::Format(format!("invalid value of header {:?}: {}", name, e)))?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

/// Compare `expect.body` with the responses.
///
/// The expectation is decoded through the output message first so that it
/// is rendered the same way as the responses. An array is compared with the
/// whole response list, an object with every single response.
pub fn verify_expected_body(
    output: &MessageDescriptor,
    case_name: &str,
    expect: &Expect,
    actual: &[Value],
) -> RunnerResult<()> {
    if expect.body.is_empty() {
        return Ok(());
    }

    let expected: Value = serde_json::from_str(expect.body.as_str().trim()).map_err(|e| {
        VerifyError::InvalidExpectation(format!(
            "case {:?}: expect body is not a valid JSON: {}",
            case_name, e
        ))
    })?;

    match expected {
        Value::Array(items) => {
            let items = items
                .into_iter()
                .map(|item| normalize(output, case_name, item))
                .collect::<RunnerResult<Vec<_>>>()?;
            compare_array(case_name, &items, actual).map_err(VerifyError::from)?;
            Ok(())
        }
        Value::Object(_) => {
            let expected = normalize(output, case_name, expected)?;
            let expected = expected.as_object().cloned().unwrap_or_default();
            let empty = Map::new();

            let errors: Vec<ComparisonError> = actual
                .iter()
                .enumerate()
                .filter_map(|(i, item)| {
                    let item = item.as_object().unwrap_or(&empty);
                    compare_object(&format!("{}[{}]", case_name, i), &expected, item).err()
                })
                .collect();

            if errors.is_empty() {
                Ok(())
            } else {
                Err(VerifyError::Mismatch(ComparisonError::node(Vec::new(), errors)).into())
            }
        }
        _ => Err(VerifyError::InvalidExpectation(format!(
            "case {:?}: unknown expect content",
            case_name
        ))
        .into()),
    }
}

fn normalize(output: &MessageDescriptor, case_name: &str, value: Value) -> RunnerResult<Value> {
    let message = DynamicMessage::deserialize(output.clone(), value).map_err(|e| {
        VerifyError::InvalidExpectation(format!(
            "case {:?}: expect body does not match {}: {}",
            case_name,
            output.full_name(),
            e
        ))
    })?;
    Ok(serde_json::to_value(&message)?)
}
