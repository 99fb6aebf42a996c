//! Admission-time port conflict detection across resources

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::claims::PortClaim;
use crate::error::Result;

/// Identity of a Kubernetes object that claims ports
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ResourceRef {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: &str, namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            namespace,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct LoadBalancerRef {
    pub region: String,
    pub id: String,
}

impl LoadBalancerRef {
    pub fn new(region: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for LoadBalancerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.region, self.id)
    }
}

/// Everything one resource asks for on one load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceClaims {
    pub resource: ResourceRef,
    pub load_balancer: LoadBalancerRef,
    pub claims: Vec<PortClaim>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{claim} requested by {candidate} conflicts with {other_claim} of {other} on load balancer {load_balancer}")]
pub struct PortConflict {
    pub candidate: ResourceRef,
    pub claim: PortClaim,
    pub other: ResourceRef,
    pub other_claim: PortClaim,
    pub load_balancer: LoadBalancerRef,
}

/// First conflict between the candidate and any other admitted resource on
/// the same load balancer. The candidate's own admitted entry is skipped.
pub fn check_conflict(
    candidate: &ResourceClaims,
    admitted: &[ResourceClaims],
) -> std::result::Result<(), PortConflict> {
    for other in admitted {
        if other.resource == candidate.resource || other.load_balancer != candidate.load_balancer {
            continue;
        }
        for claim in &candidate.claims {
            if let Some(other_claim) = other.claims.iter().find(|c| claim.conflicts_with(c)) {
                return Err(PortConflict {
                    candidate: candidate.resource.clone(),
                    claim: claim.clone(),
                    other: other.resource.clone(),
                    other_claim: other_claim.clone(),
                    load_balancer: candidate.load_balancer.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Admission answer
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConflictVerdict {
    pub allowed: bool,
    pub message: String,
}

impl ConflictVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            message: String::new(),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: message.into(),
        }
    }
}

impl From<std::result::Result<(), PortConflict>> for ConflictVerdict {
    fn from(result: std::result::Result<(), PortConflict>) -> Self {
        match result {
            Ok(()) => Self::allow(),
            Err(conflict) => Self::deny(conflict.to_string()),
        }
    }
}

/// Supplies the claims of already admitted resources
#[async_trait]
pub trait ClaimSource: Send + Sync {
    async fn admitted_claims(&self, load_balancer: &LoadBalancerRef) -> Result<Vec<ResourceClaims>>;

    /// Whether admitted objects of `kind` are ever returned by this source
    fn tracks(&self, _kind: &str) -> bool {
        true
    }
}

pub struct ConflictDetector<S: ClaimSource> {
    source: S,
}

impl<S: ClaimSource> ConflictDetector<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Candidates of an untracked kind could never be seen by later checks
    pub fn tracks(&self, kind: &str) -> bool {
        self.source.tracks(kind)
    }

    /// Check a candidate against every admitted resource on its load balancer
    pub async fn check(&self, candidate: &ResourceClaims) -> Result<ConflictVerdict> {
        if candidate.claims.is_empty() {
            return Ok(ConflictVerdict::allow());
        }
        let admitted = self.source.admitted_claims(&candidate.load_balancer).await?;
        debug!(
            "Checking {} claims of {} against {} admitted resources on {}",
            candidate.claims.len(),
            candidate.resource,
            admitted.len(),
            candidate.load_balancer
        );
        let result = check_conflict(candidate, &admitted);
        if let Err(conflict) = &result {
            warn!("Port conflict: {}", conflict);
        }
        Ok(result.into())
    }
}
