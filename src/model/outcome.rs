//! Per-resource results handed back to the status-update layer

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Why one resource (listener, rule or backend) did not converge
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureCause {
    /// Provider operation that failed, e.g. `BatchRegisterTargets`
    pub operation: String,

    /// Provider error code, or a local code such as `RetryExhausted`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    pub message: String,
}

impl FailureCause {
    pub fn new(operation: impl Into<String>, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            code,
            message: message.into(),
        }
    }

    /// Prefix the message with the sub-resource it belongs to
    pub fn scoped(mut self, scope: &str) -> Self {
        self.message = format!("{scope}: {}", self.message);
        self
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} failed [{}]: {}", self.operation, code, self.message),
            None => write!(f, "{} failed: {}", self.operation, self.message),
        }
    }
}

/// Final state of one named resource after a reconciliation pass
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    Succeeded { id: String },
    Failed { causes: Vec<FailureCause> },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Outcome::Succeeded { id } => Some(id),
            Outcome::Failed { .. } => None,
        }
    }

    /// Human readable explanation, suitable for an event or status message
    pub fn message(&self) -> String {
        match self {
            Outcome::Succeeded { id } => format!("reconciled as {id}"),
            Outcome::Failed { causes } => causes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

/// Outcome per listener name
pub type ResultMap = BTreeMap<String, Outcome>;

/// One entry per input item, in input order
pub type BatchResult<T> = Vec<Result<T, FailureCause>>;
