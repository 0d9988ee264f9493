//! API Testing Common Library
//!
//! Shared test-case model, report sink, configuration and logging bootstrap
//! used by the protocol runners.

pub mod config;
pub mod error;
pub mod logging;
pub mod reporter;
pub mod testing;

// Re-export commonly used types
pub use config::RunnerConfig;
pub use error::{Error, Result};
pub use reporter::{
    DiscardTestReporter, MemoryTestReporter, ReportRecord, ReportResult, TestReporter,
};
pub use testing::{
    ApiSpec, ConditionalVerify, Expect, Job, QueryValue, QueryVerifier, Request, RequestBody,
    RpcDesc, Secure, TestCase, TestSuite,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Header carrying request credentials
pub const AUTHORIZATION: &str = "Authorization";
