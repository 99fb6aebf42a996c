//! Admitted claims read from the cluster

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::core::TypeMeta;
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

use super::annotations::{ingress_claims, object_claims, service_claims};
use super::detector::{ClaimSource, LoadBalancerRef, ResourceClaims};
use crate::error::{Error, Result};

/// Parse `group/version/Kind`, or `version/Kind` for the core group
pub fn parse_claim_resource(value: &str) -> Result<ApiResource> {
    let parts: Vec<&str> = value.trim().split('/').collect();
    let gvk = match parts.as_slice() {
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            GroupVersionKind::gvk(group, version, kind)
        }
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            GroupVersionKind::gvk("", version, kind)
        }
        _ => {
            return Err(Error::ConfigError(format!(
                "claim resource {value:?} must be group/version/Kind"
            )))
        }
    };
    Ok(ApiResource::from_gvk(&gvk))
}

/// Claims of listed custom objects that land on `load_balancer`.
///
/// List responses may omit `apiVersion`/`kind` on items, so they are
/// filled in from `resource` before dispatching.
pub fn custom_object_claims(
    objects: Vec<DynamicObject>,
    resource: &ApiResource,
    default_region: &str,
    load_balancer: &LoadBalancerRef,
) -> Vec<ResourceClaims> {
    let mut admitted = Vec::new();
    for mut object in objects {
        object.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        match object_claims(&object, default_region) {
            Ok(Some(claims)) if &claims.load_balancer == load_balancer => admitted.push(claims),
            Ok(_) => {}
            Err(e) => warn!(
                "Ignoring claims of {} {}: {}",
                resource.kind,
                object.name_any(),
                e
            ),
        }
    }
    admitted
}

/// Lists every Service, Ingress and configured custom kind in the cluster
/// and keeps the ones claiming ports on the requested load balancer
pub struct KubeClaimSource {
    client: Client,
    default_region: String,
    custom_resources: Vec<ApiResource>,
}

impl KubeClaimSource {
    pub fn new(client: Client, default_region: impl Into<String>) -> Self {
        Self {
            client,
            default_region: default_region.into(),
            custom_resources: Vec::new(),
        }
    }

    /// Also list these annotated kinds
    pub fn with_custom_resources(mut self, resources: Vec<ApiResource>) -> Self {
        self.custom_resources = resources;
        self
    }
}

#[async_trait]
impl ClaimSource for KubeClaimSource {
    async fn admitted_claims(&self, load_balancer: &LoadBalancerRef) -> Result<Vec<ResourceClaims>> {
        let services: Api<Service> = Api::all(self.client.clone());
        let ingresses: Api<Ingress> = Api::all(self.client.clone());

        let service_list = services
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        let ingress_list = ingresses
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;

        let mut admitted = Vec::new();

        // broken annotations on admitted objects are skipped
        for service in &service_list.items {
            match service_claims(service, &self.default_region) {
                Ok(Some(claims)) if &claims.load_balancer == load_balancer => admitted.push(claims),
                Ok(_) => {}
                Err(e) => warn!("Ignoring claims of Service {}: {}", service.name_any(), e),
            }
        }
        for ingress in &ingress_list.items {
            match ingress_claims(ingress, &self.default_region) {
                Ok(Some(claims)) if &claims.load_balancer == load_balancer => admitted.push(claims),
                Ok(_) => {}
                Err(e) => warn!("Ignoring claims of Ingress {}: {}", ingress.name_any(), e),
            }
        }

        for resource in &self.custom_resources {
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), resource);
            let list = api
                .list(&ListParams::default())
                .await
                .map_err(Error::KubeError)?;
            admitted.extend(custom_object_claims(
                list.items,
                resource,
                &self.default_region,
                load_balancer,
            ));
        }

        debug!("{} admitted resources claim ports on {}", admitted.len(), load_balancer);
        Ok(admitted)
    }

    fn tracks(&self, kind: &str) -> bool {
        matches!(kind, "Service" | "Ingress") || self.custom_resources.iter().any(|r| r.kind == kind)
    }
}
