//! Error types for the runner

use thiserror::Error;

use crate::verify::VerifyError;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Invalid format: {0}")]
    Format(String),

    #[error("Failed to render {0}")]
    Render(String),

    #[error("Failed to compile descriptors: {0}")]
    Compile(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server reflection is not supported by {0}")]
    ReflectionUnsupported(String),

    #[error("No descriptor source configured: set protoFile, raw, protoSet or serverReflection")]
    MissingDescriptorSource,

    #[error("Failed to decode payload: {0}")]
    Decode(String),

    #[error("Failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("{}", transport_message(.status, .partial))]
    Transport {
        status: tonic::Status,
        partial: Vec<String>,
    },

    #[error(transparent)]
    Verification(#[from] VerifyError),

    #[error("testcase {case:?} failed when: {mutator:?}")]
    MutationLeak { case: String, mutator: String },

    #[error("Job failed: {0}")]
    Job(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

fn transport_message(status: &tonic::Status, partial: &[String]) -> String {
    if partial.is_empty() {
        format!("RPC failed: {}: {}", status.code(), status.message())
    } else {
        format!(
            "RPC failed after {} response(s): {}: {}",
            partial.len(),
            status.code(),
            status.message()
        )
    }
}

impl RunnerError {
    pub fn transport(status: tonic::Status) -> Self {
        RunnerError::Transport {
            status,
            partial: Vec::new(),
        }
    }

    /// Responses received before the call failed
    pub fn partial_responses(&self) -> &[String] {
        match self {
            RunnerError::Transport { partial, .. } => partial,
            _ => &[],
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_leak_message() {
        let err = RunnerError::MutationLeak {
            case: "login".to_string(),
            mutator: "Missing Authorization in header".to_string(),
        };
        assert_eq!(
            err.to_string(),
            r#"testcase "login" failed when: "Missing Authorization in header""#
        );
    }

    #[test]
    fn test_transport_message_mentions_partial() {
        let err = RunnerError::Transport {
            status: tonic::Status::internal("boom"),
            partial: vec!["{}".to_string()],
        };
        assert!(err.to_string().contains("after 1 response(s)"));
        assert_eq!(err.partial_responses().len(), 1);
        assert!(RunnerError::Cancelled.partial_responses().is_empty());
    }
}
