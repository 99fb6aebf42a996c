//! Port claims declared on Kubernetes objects
//!
//! A resource takes part in conflict detection once it names a load
//! balancer through [`LOAD_BALANCER_ID_ANNOTATION`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::core::DynamicObject;
use kube::ResourceExt;
use thiserror::Error;

use super::claims::{PortClaim, PortSegment};
use super::detector::{LoadBalancerRef, ResourceClaims, ResourceRef};
use crate::model::Protocol;

pub const LOAD_BALANCER_ID_ANNOTATION: &str = "clb.cloud/loadbalancer-id";
pub const REGION_ANNOTATION: &str = "clb.cloud/region";
pub const LISTEN_PORTS_ANNOTATION: &str = "clb.cloud/listen-ports";
pub const PORT_SEGMENTS_ANNOTATION: &str = "clb.cloud/port-segments";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClaimError {
    #[error("annotation {annotation} is not valid JSON: {message}")]
    Malformed { annotation: String, message: String },

    #[error("unsupported protocol {0:?}")]
    UnknownProtocol(String),

    #[error("port {0} is outside 1-65535")]
    PortOutOfRange(i64),

    #[error("port segment [{start},{end}) is empty")]
    EmptySegment { start: u16, end: u16 },

    #[error("cannot read {kind} object: {message}")]
    Object { kind: String, message: String },
}

fn to_port(value: i64) -> Result<u16, ClaimError> {
    u16::try_from(value)
        .ok()
        .filter(|p| *p > 0)
        .ok_or(ClaimError::PortOutOfRange(value))
}

fn parse_protocol(raw: &str) -> Result<Protocol, ClaimError> {
    raw.parse()
        .map_err(|_| ClaimError::UnknownProtocol(raw.to_string()))
}

/// Accumulates `(protocol, port)` pairs, merging entries on the same port
#[derive(Default)]
struct PortSet(BTreeMap<u16, Vec<Protocol>>);

impl PortSet {
    fn add(&mut self, port: u16, protocol: Protocol) {
        let protocols = self.0.entry(port).or_default();
        if !protocols.contains(&protocol) {
            protocols.push(protocol);
        }
    }

    fn into_claims(self) -> Vec<PortClaim> {
        self.0
            .into_iter()
            .map(|(port, protocols)| PortClaim::port(port, protocols))
            .collect()
    }
}

/// Parse `[{"HTTP":80},{"HTTPS":443}]`
pub fn parse_listen_ports(value: &str) -> Result<Vec<PortClaim>, ClaimError> {
    let entries: Vec<BTreeMap<String, i64>> =
        serde_json::from_str(value).map_err(|e| ClaimError::Malformed {
            annotation: LISTEN_PORTS_ANNOTATION.to_string(),
            message: e.to_string(),
        })?;

    let mut ports = PortSet::default();
    for entry in entries {
        for (protocol, port) in entry {
            ports.add(to_port(port)?, parse_protocol(&protocol)?);
        }
    }
    Ok(ports.into_claims())
}

/// Parse `[{"start":30000,"end":30100,"protocols":["TCP","UDP"]}]`
pub fn parse_port_segments(value: &str) -> Result<Vec<PortClaim>, ClaimError> {
    let segments: Vec<PortSegment> =
        serde_json::from_str(value).map_err(|e| ClaimError::Malformed {
            annotation: PORT_SEGMENTS_ANNOTATION.to_string(),
            message: e.to_string(),
        })?;

    segments
        .into_iter()
        .map(|s| {
            if s.start >= s.end {
                Err(ClaimError::EmptySegment {
                    start: s.start,
                    end: s.end,
                })
            } else {
                Ok(PortClaim::Segment(s))
            }
        })
        .collect()
}

/// Load balancer named by the annotations, if any
pub fn load_balancer_ref(
    annotations: &BTreeMap<String, String>,
    default_region: &str,
) -> Option<LoadBalancerRef> {
    let id = annotations
        .get(LOAD_BALANCER_ID_ANNOTATION)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())?;
    let region = annotations
        .get(REGION_ANNOTATION)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(default_region);
    Some(LoadBalancerRef::new(region, id))
}

/// Claims spelled out in annotations; `None` when neither claim annotation is set
pub fn annotated_claims(
    annotations: &BTreeMap<String, String>,
) -> Result<Option<Vec<PortClaim>>, ClaimError> {
    let ports = annotations.get(LISTEN_PORTS_ANNOTATION);
    let segments = annotations.get(PORT_SEGMENTS_ANNOTATION);
    if ports.is_none() && segments.is_none() {
        return Ok(None);
    }

    let mut claims = Vec::new();
    if let Some(value) = ports {
        claims.extend(parse_listen_ports(value)?);
    }
    if let Some(value) = segments {
        claims.extend(parse_port_segments(value)?);
    }
    Ok(Some(claims))
}

/// Claims of an Ingress; HTTP:80 plus HTTPS:443 with TLS when not annotated
pub fn ingress_claims(
    ingress: &Ingress,
    default_region: &str,
) -> Result<Option<ResourceClaims>, ClaimError> {
    let annotations = ingress.annotations();
    let Some(load_balancer) = load_balancer_ref(annotations, default_region) else {
        return Ok(None);
    };

    let claims = match annotated_claims(annotations)? {
        Some(claims) => claims,
        None => {
            let mut ports = PortSet::default();
            ports.add(80, Protocol::Http);
            let has_tls = ingress
                .spec
                .as_ref()
                .and_then(|s| s.tls.as_ref())
                .is_some_and(|tls| !tls.is_empty());
            if has_tls {
                ports.add(443, Protocol::Https);
            }
            ports.into_claims()
        }
    };

    Ok(Some(ResourceClaims {
        resource: ResourceRef::new("Ingress", ingress.namespace(), ingress.name_any()),
        load_balancer,
        claims,
    }))
}

/// Claims of a Service; every `spec.ports` entry when not annotated
pub fn service_claims(
    service: &Service,
    default_region: &str,
) -> Result<Option<ResourceClaims>, ClaimError> {
    let annotations = service.annotations();
    let Some(load_balancer) = load_balancer_ref(annotations, default_region) else {
        return Ok(None);
    };

    let claims = match annotated_claims(annotations)? {
        Some(claims) => claims,
        None => {
            let mut ports = PortSet::default();
            for sp in service
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .into_iter()
                .flatten()
            {
                let protocol = parse_protocol(sp.protocol.as_deref().unwrap_or("TCP"))?;
                ports.add(to_port(i64::from(sp.port))?, protocol);
            }
            ports.into_claims()
        }
    };

    Ok(Some(ResourceClaims {
        resource: ResourceRef::new("Service", service.namespace(), service.name_any()),
        load_balancer,
        claims,
    }))
}

/// Claims of an object under admission, dispatched on its kind
pub fn object_claims(
    object: &DynamicObject,
    default_region: &str,
) -> Result<Option<ResourceClaims>, ClaimError> {
    let kind = object
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_default();

    let convert_err = |e: serde_json::Error| ClaimError::Object {
        kind: kind.clone(),
        message: e.to_string(),
    };

    match kind.as_str() {
        "Ingress" => {
            let value = serde_json::to_value(object).map_err(convert_err)?;
            let ingress: Ingress = serde_json::from_value(value).map_err(convert_err)?;
            ingress_claims(&ingress, default_region)
        }
        "Service" => {
            let value = serde_json::to_value(object).map_err(convert_err)?;
            let service: Service = serde_json::from_value(value).map_err(convert_err)?;
            service_claims(&service, default_region)
        }
        _ => {
            let annotations = object.annotations();
            let Some(load_balancer) = load_balancer_ref(annotations, default_region) else {
                return Ok(None);
            };
            let claims = annotated_claims(annotations)?.unwrap_or_default();
            Ok(Some(ResourceClaims {
                resource: ResourceRef::new(&kind, object.namespace(), object.name_any()),
                load_balancer,
                claims,
            }))
        }
    }
}
