//! Error types for provider calls

use std::time::Duration;

use thiserror::Error;

use crate::model::FailureCause;

/// Error codes the provider uses for throttling
const RATE_LIMITED_CODES: &[&str] = &["RequestLimitExceeded"];

/// Error codes the provider uses while a resource is locked by another task
const BUSY_CODES: &[&str] = &[
    "FailedOperation.ResourceInOperation",
    "ResourceInOperation",
    "ResourceBusy",
];

/// Local code attached to items named in a provider partial-failure list
pub const PARTIAL_BATCH_FAILURE: &str = "PartialBatchFailure";

/// How a provider error code should be handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    Busy,
    Fatal,
}

impl ErrorClass {
    pub fn classify(code: &str) -> Self {
        if RATE_LIMITED_CODES
            .iter()
            .any(|c| code == *c || code.starts_with(&format!("{c}.")))
        {
            ErrorClass::RateLimited
        } else if BUSY_CODES.contains(&code) {
            ErrorClass::Busy
        } else {
            ErrorClass::Fatal
        }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, ErrorClass::Fatal)
    }
}

/// Raw transport-level error from a [`super::ClbApi`] implementation
#[derive(Error, Debug)]
pub enum ApiError {
    /// The provider answered with an error envelope
    #[error("[{code}] {message} (request {request_id})")]
    Provider {
        code: String,
        message: String,
        request_id: String,
    },

    /// Non-2xx status without an error envelope
    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

/// Errors surfaced by [`super::CloudClient`] and [`super::TaskTracker`]
#[derive(Error, Debug)]
pub enum CloudError {
    /// Provider kept reporting a transient condition
    #[error("{operation} gave up after {attempts} attempts, last code {last_code}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_code: String,
    },

    /// Non-transient provider error, not retried
    #[error("{operation} rejected by provider: [{code}] {message} (request {request_id})")]
    ProviderRejected {
        operation: String,
        code: String,
        message: String,
        request_id: String,
    },

    /// Asynchronous task reached the failed state
    #[error("{operation} task {task} failed")]
    TaskFailed { operation: String, task: String },

    /// Task still dealing once the poll budget ran out
    #[error("{operation} task {task} still in progress after {polls} polls")]
    TaskTimeout {
        operation: String,
        task: String,
        polls: u32,
    },

    /// Call deadline exceeded
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("{operation} transport error: {source}")]
    Transport {
        operation: String,
        #[source]
        source: ApiError,
    },

    #[error("{operation} returned an undecodable response: {message}")]
    Decode { operation: String, message: String },
}

impl CloudError {
    pub fn operation(&self) -> &str {
        match self {
            CloudError::RetryExhausted { operation, .. }
            | CloudError::ProviderRejected { operation, .. }
            | CloudError::TaskFailed { operation, .. }
            | CloudError::TaskTimeout { operation, .. }
            | CloudError::Timeout { operation, .. }
            | CloudError::Transport { operation, .. }
            | CloudError::Decode { operation, .. } => operation,
        }
    }

    /// Provider code for rejections, a local code otherwise
    pub fn code(&self) -> String {
        match self {
            CloudError::RetryExhausted { .. } => "RetryExhausted".to_string(),
            CloudError::ProviderRejected { code, .. } => code.clone(),
            CloudError::TaskFailed { .. } => "TaskFailed".to_string(),
            CloudError::TaskTimeout { .. } => "TaskTimeout".to_string(),
            CloudError::Timeout { .. } => "Timeout".to_string(),
            CloudError::Transport { .. } => "Transport".to_string(),
            CloudError::Decode { .. } => "Decode".to_string(),
        }
    }

    /// Convert into the value object stored in result maps
    pub fn to_cause(&self) -> FailureCause {
        FailureCause::new(self.operation(), Some(self.code()), self.to_string())
    }
}

pub type Result<T, E = CloudError> = std::result::Result<T, E>;
