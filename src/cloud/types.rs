//! Request and response shapes of the provider API
//!
//! Field names follow the provider's PascalCase convention. Only the fields
//! this crate reads or writes are modelled.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{
    CertificateRef, HealthCheck, Listener, ListenerAttributes, Protocol, Rule, RuleAttributes,
    Scheduler, SslMode,
};

/// Provider actions used by the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    CreateListener,
    DeleteLoadBalancerListeners,
    ModifyListener,
    CreateRule,
    DeleteRule,
    ModifyRule,
    BatchRegisterTargets,
    BatchDeregisterTargets,
    BatchModifyTargetWeight,
    DescribeListeners,
    DescribeTargets,
    DescribeTaskStatus,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateListener => "CreateListener",
            Action::DeleteLoadBalancerListeners => "DeleteLoadBalancerListeners",
            Action::ModifyListener => "ModifyListener",
            Action::CreateRule => "CreateRule",
            Action::DeleteRule => "DeleteRule",
            Action::ModifyRule => "ModifyRule",
            Action::BatchRegisterTargets => "BatchRegisterTargets",
            Action::BatchDeregisterTargets => "BatchDeregisterTargets",
            Action::BatchModifyTargetWeight => "BatchModifyTargetWeight",
            Action::DescribeListeners => "DescribeListeners",
            Action::DescribeTargets => "DescribeTargets",
            Action::DescribeTaskStatus => "DescribeTaskStatus",
        }
    }

    /// Mutating actions complete asynchronously and must be tracked
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Action::DescribeListeners | Action::DescribeTargets | Action::DescribeTaskStatus
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle of an asynchronous provider task
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub String);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reply to any mutating call
pub trait MutationResponse {
    fn task_handle(&self) -> TaskHandle;
}

// ============================================================================
// Shared attribute shapes
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheckWire {
    pub health_switch: u8,
    #[serde(default)]
    pub time_out: u32,
    #[serde(default)]
    pub interval_time: u32,
    #[serde(default)]
    pub health_num: u32,
    #[serde(default)]
    pub un_health_num: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_check_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_check_domain: Option<String>,
}

impl From<&HealthCheck> for HealthCheckWire {
    fn from(hc: &HealthCheck) -> Self {
        Self {
            health_switch: u8::from(hc.enabled),
            time_out: hc.timeout_secs,
            interval_time: hc.interval_secs,
            health_num: hc.healthy_threshold,
            un_health_num: hc.unhealthy_threshold,
            http_check_path: hc.http_path.clone(),
            http_check_domain: hc.http_domain.clone(),
        }
    }
}

impl From<&HealthCheckWire> for HealthCheck {
    fn from(w: &HealthCheckWire) -> Self {
        Self {
            enabled: w.health_switch == 1,
            interval_secs: w.interval_time,
            timeout_secs: w.time_out,
            healthy_threshold: w.health_num,
            unhealthy_threshold: w.un_health_num,
            http_path: w.http_check_path.clone(),
            http_domain: w.http_check_domain.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertificateWire {
    pub ssl_mode: SslMode,
    pub cert_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_ca_id: Option<String>,
}

impl From<&CertificateRef> for CertificateWire {
    fn from(c: &CertificateRef) -> Self {
        Self {
            ssl_mode: c.mode,
            cert_id: c.cert_id.clone(),
            cert_ca_id: c.ca_cert_id.clone(),
        }
    }
}

impl From<&CertificateWire> for CertificateRef {
    fn from(w: &CertificateWire) -> Self {
        Self {
            mode: w.ssl_mode,
            cert_id: w.cert_id.clone(),
            ca_cert_id: w.cert_ca_id.clone(),
        }
    }
}

/// Listener attribute block shared by create and modify requests
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListenerAttributesWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_expire_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<Scheduler>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni_switch: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_enable: Option<u8>,
}

impl ListenerAttributesWire {
    /// Attribute block for a listener, using the attributes the provider
    /// actually stores for its kind
    pub fn for_listener(listener: &Listener) -> Self {
        let attrs = listener.effective_attributes();
        let layer7 = listener.protocol.is_layer7();
        Self {
            session_expire_time: (!layer7).then_some(attrs.session_expire_time),
            scheduler: (!layer7).then_some(attrs.scheduler),
            health_check: attrs.health_check.as_ref().map(HealthCheckWire::from),
            certificate: listener
                .effective_certificate()
                .as_ref()
                .map(CertificateWire::from),
            sni_switch: (listener.protocol == Protocol::Https).then_some(u8::from(attrs.sni_switch)),
            keepalive_enable: Some(u8::from(attrs.keepalive)),
        }
    }

    pub fn to_attributes(&self) -> ListenerAttributes {
        ListenerAttributes {
            session_expire_time: self.session_expire_time.unwrap_or(0),
            scheduler: self.scheduler.unwrap_or_default(),
            health_check: self
                .health_check
                .as_ref()
                .filter(|hc| hc.health_switch == 1)
                .map(HealthCheck::from),
            sni_switch: self.sni_switch == Some(1),
            keepalive: self.keepalive_enable == Some(1),
        }
    }
}

// ============================================================================
// Listener requests
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateListenerRequest {
    pub load_balancer_id: String,
    pub ports: Vec<u16>,
    pub listener_names: Vec<String>,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,
    #[serde(flatten)]
    pub attributes: ListenerAttributesWire,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateListenerResponse {
    #[serde(default)]
    pub listener_ids: Vec<String>,
    pub request_id: String,
}

impl MutationResponse for CreateListenerResponse {
    fn task_handle(&self) -> TaskHandle {
        TaskHandle(self.request_id.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteListenersRequest {
    pub load_balancer_id: String,
    pub listener_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifyListenerRequest {
    pub load_balancer_id: String,
    pub listener_id: String,
    #[serde(flatten)]
    pub attributes: ListenerAttributesWire,
}

/// Reply to mutations that return nothing but a request id
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestIdResponse {
    pub request_id: String,
}

impl MutationResponse for RequestIdResponse {
    fn task_handle(&self) -> TaskHandle {
        TaskHandle(self.request_id.clone())
    }
}

// ============================================================================
// Rule requests
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuleInput {
    pub domain: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_expire_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<Scheduler>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateWire>,
}

impl From<&Rule> for RuleInput {
    fn from(rule: &Rule) -> Self {
        Self {
            domain: rule.domain.clone(),
            url: rule.path.clone(),
            session_expire_time: Some(rule.attributes.session_expire_time),
            scheduler: Some(rule.attributes.scheduler),
            health_check: rule
                .attributes
                .health_check
                .as_ref()
                .map(HealthCheckWire::from),
            certificate: rule.certificate.as_ref().map(CertificateWire::from),
        }
    }
}

impl RuleInput {
    pub fn to_attributes(&self) -> RuleAttributes {
        RuleAttributes {
            session_expire_time: self.session_expire_time.unwrap_or(0),
            scheduler: self.scheduler.unwrap_or_default(),
            health_check: self
                .health_check
                .as_ref()
                .filter(|hc| hc.health_switch == 1)
                .map(HealthCheck::from),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRuleRequest {
    pub load_balancer_id: String,
    pub listener_id: String,
    pub rules: Vec<RuleInput>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRuleResponse {
    #[serde(default)]
    pub location_ids: Vec<String>,
    pub request_id: String,
}

impl MutationResponse for CreateRuleResponse {
    fn task_handle(&self) -> TaskHandle {
        TaskHandle(self.request_id.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteRuleRequest {
    pub load_balancer_id: String,
    pub listener_id: String,
    pub location_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifyRuleRequest {
    pub load_balancer_id: String,
    pub listener_id: String,
    pub location_id: String,
    #[serde(flatten)]
    pub rule: RuleInput,
}

// ============================================================================
// Target requests
// ============================================================================

/// One backend bound to a listener, or to a rule when `location_id` is set
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchTarget {
    pub listener_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    pub eni_ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchTargetsRequest {
    pub load_balancer_id: String,
    pub targets: Vec<BatchTarget>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchTargetsResponse {
    /// Listeners whose targets in this call were not applied
    #[serde(default)]
    pub fail_listener_id_set: Vec<String>,
    pub request_id: String,
}

impl MutationResponse for BatchTargetsResponse {
    fn task_handle(&self) -> TaskHandle {
        TaskHandle(self.request_id.clone())
    }
}

// ============================================================================
// Describe requests
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeListenersRequest {
    pub load_balancer_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listener_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuleWire {
    pub location_id: String,
    #[serde(flatten)]
    pub rule: RuleInput,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListenerWire {
    pub listener_id: String,
    #[serde(default)]
    pub listener_name: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,
    #[serde(flatten)]
    pub attributes: ListenerAttributesWire,
    #[serde(default)]
    pub rules: Vec<RuleWire>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeListenersResponse {
    #[serde(default)]
    pub listeners: Vec<ListenerWire>,
    #[serde(default)]
    pub total_count: u32,
    pub request_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeTargetsRequest {
    pub load_balancer_id: String,
    pub listener_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackendWire {
    #[serde(default)]
    pub private_ip_addresses: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub weight: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuleTargetsWire {
    pub location_id: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub targets: Vec<BackendWire>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListenerBackendWire {
    pub listener_id: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default)]
    pub targets: Vec<BackendWire>,
    #[serde(default)]
    pub rules: Vec<RuleTargetsWire>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeTargetsResponse {
    #[serde(default)]
    pub listeners: Vec<ListenerBackendWire>,
    pub request_id: String,
}

// ============================================================================
// Task status
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeTaskStatusRequest {
    pub task_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeTaskStatusResponse {
    pub status: i64,
    pub request_id: String,
}

/// Provider task state as reported by `DescribeTaskStatus`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Succeeded,
    Failed,
    Dealing,
}

impl TaskState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TaskState::Succeeded),
            1 => Some(TaskState::Failed),
            2 => Some(TaskState::Dealing),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_listener_request_field_names() {
        let mut listener = Listener::new("lb-1", Protocol::Tcp, 80);
        listener.attributes.session_expire_time = 30;
        listener.attributes.health_check = Some(HealthCheck::default());

        let req = CreateListenerRequest {
            load_balancer_id: "lb-1".to_string(),
            ports: vec![80],
            listener_names: vec![listener.name()],
            protocol: listener.protocol,
            end_port: None,
            attributes: ListenerAttributesWire::for_listener(&listener),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["LoadBalancerId"], "lb-1");
        assert_eq!(json["Ports"][0], 80);
        assert_eq!(json["Protocol"], "TCP");
        assert_eq!(json["SessionExpireTime"], 30);
        assert_eq!(json["Scheduler"], "WRR");
        assert_eq!(json["HealthCheck"]["HealthSwitch"], 1);
        assert_eq!(json["HealthCheck"]["UnHealthNum"], 3);
        assert!(json.get("EndPort").is_none());
        assert!(json.get("SniSwitch").is_none());
    }

    #[test]
    fn test_attributes_wire_round_trip_for_layer4() {
        let mut listener = Listener::new("lb-1", Protocol::Udp, 53);
        listener.attributes.scheduler = Scheduler::IpHash;
        listener.attributes.keepalive = true;
        let wire = ListenerAttributesWire::for_listener(&listener);
        assert_eq!(wire.to_attributes(), listener.effective_attributes());
    }

    #[test]
    fn test_disabled_health_check_reads_back_as_none() {
        let wire = ListenerAttributesWire {
            health_check: Some(HealthCheckWire {
                health_switch: 0,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(wire.to_attributes().health_check.is_none());
    }

    #[test]
    fn test_task_state_codes() {
        assert_eq!(TaskState::from_code(0), Some(TaskState::Succeeded));
        assert_eq!(TaskState::from_code(1), Some(TaskState::Failed));
        assert_eq!(TaskState::from_code(2), Some(TaskState::Dealing));
        assert_eq!(TaskState::from_code(7), None);
    }

    #[test]
    fn test_describe_listener_parses_flattened_attributes() {
        let json = serde_json::json!({
            "ListenerId": "lbl-1",
            "Protocol": "HTTPS",
            "Port": 443,
            "SniSwitch": 1,
            "KeepaliveEnable": 0,
            "Rules": [{
                "LocationId": "loc-1",
                "Domain": "a.example.com",
                "Url": "/",
                "Scheduler": "IP_HASH"
            }]
        });
        let wire: ListenerWire = serde_json::from_value(json).unwrap();
        assert_eq!(wire.protocol, Protocol::Https);
        assert_eq!(wire.attributes.sni_switch, Some(1));
        assert_eq!(wire.rules[0].location_id, "loc-1");
        assert_eq!(
            wire.rules[0].rule.to_attributes().scheduler,
            Scheduler::IpHash
        );
    }
}
