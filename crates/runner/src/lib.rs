//! API Testing Runner
//!
//! Executes declarative test cases against gRPC targets without generated
//! stubs:
//! - descriptor resolution from proto files, inline text, compiled sets or
//!   server reflection
//! - dynamic invocation for every streaming shape
//! - structural JSON comparison and expression assertions
//! - negative-test generation by mutating requests

pub mod codec;
pub mod compare;
pub mod descriptor;
pub mod error;
pub mod expr;
pub mod grpc;
pub mod invoke;
pub mod job;
pub mod mutation;
pub mod protolib;
pub mod reflection;
pub mod render;
pub mod runner;
pub mod verify;

pub use compare::{compare_array, compare_element, compare_object, ComparisonError};
pub use descriptor::{ApiName, DescriptorResolver, ResolvedMethod, RpcSource};
pub use error::{RunnerError, RunnerResult};
pub use expr::{ExprEngine, ExprError, Validator};
pub use grpc::GrpcTestCaseRunner;
pub use invoke::{invoke, StreamingShape};
pub use job::{ExprJobRunner, JobRunner};
pub use mutation::{discover, MutationSummary, Mutator, Rejection, ReverseRunner};
pub use render::render_request;
pub use runner::{run_suite, TestCaseRunner};
pub use verify::{conditional_verify, evaluate_assertions, verify_body_fields, VerifyError};

/// Method label written to report records
pub const GRPC_METHOD: &str = "gRPC";
