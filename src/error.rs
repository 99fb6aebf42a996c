//! Error types for clb-controller

use thiserror::Error;

use crate::cloud::CloudError;
use crate::conflict::ClaimError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Provider error: {0}")]
    CloudError(#[from] CloudError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid port claim: {0}")]
    ClaimError(#[from] ClaimError),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Webhook error: {0}")]
    WebhookError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
