//! Port conflict detection between resources sharing a load balancer

pub mod annotations;
pub mod claims;
pub mod detector;
pub mod source;

pub use annotations::{object_claims, ClaimError};
pub use claims::{reuse_exempt, PortClaim, PortSegment, PortStruct};
pub use detector::{
    check_conflict, ClaimSource, ConflictDetector, ConflictVerdict, LoadBalancerRef, PortConflict,
    ResourceClaims, ResourceRef,
};
pub use source::{custom_object_claims, parse_claim_resource, KubeClaimSource};
