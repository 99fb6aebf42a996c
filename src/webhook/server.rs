//! Admission Webhook Server
//!
//! Kubernetes ValidatingAdmissionWebhook that rejects objects whose port
//! claims collide with an already admitted object on the same load balancer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::conflict::{object_claims, ClaimSource, ConflictDetector, ConflictVerdict};
use crate::error::{Error, Result};

/// Webhook server state
pub struct WebhookServer<S: ClaimSource> {
    detector: ConflictDetector<S>,

    /// Region used when an object names a load balancer without one
    default_region: String,

    /// Admit objects when admitted claims cannot be listed
    fail_open: bool,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub fail_open: bool,
}

impl<S: ClaimSource + 'static> WebhookServer<S> {
    pub fn new(detector: ConflictDetector<S>, default_region: impl Into<String>) -> Self {
        Self {
            detector,
            default_region: default_region.into(),
            fail_open: false,
        }
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/health", get(health_handler::<S>))
            .route("/healthz", get(health_handler::<S>))
            .route("/validate", post(validate_handler::<S>))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(Arc::new(self))
    }

    /// Start the webhook server
    pub async fn start(self, addr: SocketAddr) -> Result<()> {
        let app = self.router();

        info!("Starting webhook server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::WebhookError(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::WebhookError(format!("Server error: {e}")))?;

        Ok(())
    }

    /// Decide one admission request
    pub async fn admit(&self, req: &AdmissionRequest<DynamicObject>) -> ConflictVerdict {
        if matches!(req.operation, Operation::Delete) {
            return ConflictVerdict::allow();
        }
        let Some(object) = req.object.as_ref() else {
            return ConflictVerdict::allow();
        };

        let candidate = match object_claims(object, &self.default_region) {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                debug!("{} {} does not use a managed load balancer", req.kind.kind, req.name);
                return ConflictVerdict::allow();
            }
            Err(e) => {
                warn!("Rejecting {} {}: {}", req.kind.kind, req.name, e);
                return ConflictVerdict::deny(format!("Invalid port claims: {e}"));
            }
        };

        if !candidate.claims.is_empty() && !self.detector.tracks(&candidate.resource.kind) {
            warn!("Rejecting {}: its kind is not listed for conflict checks", candidate.resource);
            return ConflictVerdict::deny(format!(
                "Port claims of {} objects are not tracked by this webhook",
                candidate.resource.kind
            ));
        }

        match self.detector.check(&candidate).await {
            Ok(verdict) => verdict,
            Err(e) if self.fail_open => {
                warn!("Admitting {} without a conflict check: {}", candidate.resource, e);
                ConflictVerdict::allow()
            }
            Err(e) => {
                error!("Conflict check for {} failed: {}", candidate.resource, e);
                ConflictVerdict::deny(format!("Unable to check port conflicts: {e}"))
            }
        }
    }
}

// HTTP Handlers

async fn health_handler<S: ClaimSource + 'static>(
    State(state): State<Arc<WebhookServer<S>>>,
) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        fail_open: state.fail_open,
    })
}

#[instrument(skip(state, review))]
async fn validate_handler<S: ClaimSource + 'static>(
    State(state): State<Arc<WebhookServer<S>>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!("Failed to parse admission request: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid admission request: {e}"))
                        .into_review(),
                ),
            );
        }
    };

    let verdict = state.admit(&req).await;

    let response = if verdict.allowed {
        AdmissionResponse::from(&req)
    } else {
        AdmissionResponse::from(&req).deny(verdict.message)
    };

    info!(
        "Validation result for {} {}: allowed={}",
        req.kind.kind, req.name, verdict.allowed
    );

    (StatusCode::OK, Json(response.into_review()))
}
