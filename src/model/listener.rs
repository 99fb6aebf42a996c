use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum backend weight accepted by the provider
pub const MAX_BACKEND_WEIGHT: u32 = 100;

/// Listener protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
    Https,
    TcpSsl,
    Quic,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::TcpSsl => "TCP_SSL",
            Protocol::Quic => "QUIC",
        }
    }

    /// HTTP and HTTPS listeners route by rules instead of a target group
    pub fn is_layer7(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }

    /// Protocols that terminate TLS on the load balancer
    pub fn uses_certificate(&self) -> bool {
        matches!(self, Protocol::Https | Protocol::TcpSsl | Protocol::Quic)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "HTTP" => Ok(Protocol::Http),
            "HTTPS" => Ok(Protocol::Https),
            "TCP_SSL" => Ok(Protocol::TcpSsl),
            "QUIC" => Ok(Protocol::Quic),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Closed set of listener shapes. Every create/update path dispatches on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Single-port TCP/UDP/TCP_SSL/QUIC listener with one target group
    Layer4,
    /// HTTP/HTTPS listener with domain+path rules
    Layer7,
    /// Layer-4 listener over a port range; the provider cannot batch these
    Segment,
}

/// Load-balancing algorithm
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scheduler {
    #[default]
    Wrr,
    LeastConn,
    IpHash,
}

/// Health check policy
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval")]
    pub interval_secs: u32,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,

    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,

    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,

    /// Request path for HTTP health checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_path: Option<String>,

    /// Host header for HTTP health checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_domain: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u32 {
    5
}

fn default_timeout() -> u32 {
    2
}

fn default_threshold() -> u32 {
    3
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval(),
            timeout_secs: default_timeout(),
            healthy_threshold: default_threshold(),
            unhealthy_threshold: default_threshold(),
            http_path: None,
            http_domain: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SslMode {
    #[default]
    Unidirectional,
    Mutual,
}

/// Reference to a certificate stored with the provider
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRef {
    #[serde(default)]
    pub mode: SslMode,

    pub cert_id: String,

    /// Client CA, required for mutual TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_id: Option<String>,
}

/// Listener-level attributes
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerAttributes {
    /// Session affinity in seconds, 0 disables it
    #[serde(default)]
    pub session_expire_time: u32,

    #[serde(default)]
    pub scheduler: Scheduler,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,

    #[serde(default)]
    pub sni_switch: bool,

    #[serde(default)]
    pub keepalive: bool,
}

/// Rule-level attributes for layer-7 routing entries
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAttributes {
    #[serde(default)]
    pub session_expire_time: u32,

    #[serde(default)]
    pub scheduler: Scheduler,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

impl RuleAttributes {
    /// Disabled health checks read back from the provider as absent
    pub fn effective(&self) -> RuleAttributes {
        RuleAttributes {
            health_check: self.health_check.clone().filter(|hc| hc.enabled),
            ..self.clone()
        }
    }
}

/// Identity of a backend inside one target group
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendKey {
    pub ip: IpAddr,
    pub port: u16,
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{ip}:{}", self.port),
            IpAddr::V6(ip) => write!(f, "[{ip}]:{}", self.port),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Backend {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    10
}

impl Backend {
    pub fn new(ip: IpAddr, port: u16, weight: u32) -> Self {
        Self { ip, port, weight }
    }

    pub fn key(&self) -> BackendKey {
        BackendKey {
            ip: self.ip,
            port: self.port,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TargetGroup {
    #[serde(default)]
    pub backends: Vec<Backend>,
}

impl TargetGroup {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self { backends }
    }

    fn validate(&self, owner: &str) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.key()) {
                return Err(format!("{owner}: duplicate backend {}", backend.key()));
            }
            if backend.weight > MAX_BACKEND_WEIGHT {
                return Err(format!(
                    "{owner}: backend {} weight {} exceeds {MAX_BACKEND_WEIGHT}",
                    backend.key(),
                    backend.weight
                ));
            }
        }
        Ok(())
    }
}

/// Logical identity of a rule before the provider assigns an id
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleKey {
    pub domain: String,
    pub path: String,
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.domain, self.path)
    }
}

/// Layer-7 routing entry
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,

    pub domain: String,

    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default)]
    pub attributes: RuleAttributes,

    /// Per-domain certificate, used by HTTPS listeners with SNI enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateRef>,

    #[serde(default)]
    pub target_group: TargetGroup,
}

fn default_path() -> String {
    "/".to_string()
}

impl Rule {
    pub fn key(&self) -> RuleKey {
        RuleKey {
            domain: self.domain.clone(),
            path: self.path.clone(),
        }
    }

    /// Certificate the provider keeps for this rule; `None` unless the
    /// owning listener takes per-rule certificates
    pub fn effective_certificate(&self, rule_certificates: bool) -> Option<CertificateRef> {
        if !rule_certificates {
            return None;
        }
        self.certificate.clone()
    }
}

/// Unique identity of a listener on a load balancer
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerKey {
    pub load_balancer_id: String,
    pub protocol: Protocol,
    pub port: u16,
    pub end_port: Option<u16>,
}

impl ListenerKey {
    /// The port slot ignores protocol; two keys on the same slot with
    /// different protocols describe a protocol change
    pub fn same_slot(&self, other: &ListenerKey) -> bool {
        self.load_balancer_id == other.load_balancer_id
            && self.port == other.port
            && self.end_port == other.end_port
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end_port {
            Some(end) => write!(
                f,
                "{}/{}/{}-{}",
                self.load_balancer_id, self.protocol, self.port, end
            ),
            None => write!(f, "{}/{}/{}", self.load_balancer_id, self.protocol, self.port),
        }
    }
}

/// A load balancer listener with everything hanging off it
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    #[serde(default)]
    pub load_balancer_id: String,

    pub protocol: Protocol,

    pub port: u16,

    /// Last port of a port-range listener (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,

    /// Provider-assigned id; written back on successful reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateRef>,

    #[serde(default)]
    pub attributes: ListenerAttributes,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_group: Option<TargetGroup>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
}

impl Listener {
    pub fn new(load_balancer_id: impl Into<String>, protocol: Protocol, port: u16) -> Self {
        Self {
            load_balancer_id: load_balancer_id.into(),
            protocol,
            port,
            end_port: None,
            listener_id: None,
            certificate: None,
            attributes: ListenerAttributes::default(),
            target_group: None,
            rules: Vec::new(),
        }
    }

    pub fn key(&self) -> ListenerKey {
        ListenerKey {
            load_balancer_id: self.load_balancer_id.clone(),
            protocol: self.protocol,
            port: self.port,
            end_port: self.end_port,
        }
    }

    /// Logical name, unique within one load balancer
    pub fn name(&self) -> String {
        match self.end_port {
            Some(end) => format!("{}-{}-{}", self.protocol, self.port, end),
            None => format!("{}-{}", self.protocol, self.port),
        }
    }

    pub fn kind(&self) -> ListenerKind {
        if self.end_port.is_some() {
            ListenerKind::Segment
        } else if self.protocol.is_layer7() {
            ListenerKind::Layer7
        } else {
            ListenerKind::Layer4
        }
    }

    /// Attributes as the provider stores them for this kind of listener
    pub fn effective_attributes(&self) -> ListenerAttributes {
        match self.kind() {
            ListenerKind::Layer7 => ListenerAttributes {
                sni_switch: self.protocol == Protocol::Https && self.attributes.sni_switch,
                keepalive: self.attributes.keepalive,
                ..Default::default()
            },
            ListenerKind::Layer4 | ListenerKind::Segment => ListenerAttributes {
                sni_switch: false,
                health_check: self
                    .attributes
                    .health_check
                    .clone()
                    .filter(|hc| hc.enabled),
                ..self.attributes.clone()
            },
        }
    }

    /// Certificate as the provider stores it at listener level
    pub fn effective_certificate(&self) -> Option<CertificateRef> {
        if !self.protocol.uses_certificate() || self.effective_attributes().sni_switch {
            return None;
        }
        self.certificate.clone()
    }

    /// Rules carry their own certificate only on HTTPS with SNI on
    pub fn rule_certificates(&self) -> bool {
        self.protocol == Protocol::Https && self.effective_attributes().sni_switch
    }

    /// Backends of a layer-4 or segment listener
    pub fn backends(&self) -> &[Backend] {
        self.target_group
            .as_ref()
            .map(|tg| tg.backends.as_slice())
            .unwrap_or(&[])
    }

    pub fn find_rule(&self, key: &RuleKey) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|r| r.domain == key.domain && r.path == key.path)
    }

    /// Structural checks on a desired listener
    pub fn validate(&self) -> Result<(), String> {
        let name = self.name();

        if self.load_balancer_id.is_empty() {
            return Err(format!("{name}: loadBalancerId must not be empty"));
        }

        if let Some(end) = self.end_port {
            if end <= self.port {
                return Err(format!(
                    "{name}: endPort {end} must be greater than port {}",
                    self.port
                ));
            }
            if self.protocol.is_layer7() {
                return Err(format!("{name}: port ranges are only valid for layer-4 protocols"));
            }
        }

        match self.kind() {
            ListenerKind::Layer7 => {
                if self
                    .target_group
                    .as_ref()
                    .is_some_and(|tg| !tg.backends.is_empty())
                {
                    return Err(format!(
                        "{name}: layer-7 listeners route through rules, not a target group"
                    ));
                }
                let mut keys = BTreeSet::new();
                for rule in &self.rules {
                    if !keys.insert(rule.key()) {
                        return Err(format!("{name}: duplicate rule {}", rule.key()));
                    }
                    if !rule.path.starts_with('/') {
                        return Err(format!(
                            "{name}: rule path {:?} for {} must start with '/'",
                            rule.path, rule.domain
                        ));
                    }
                    let owner = format!("{name} rule {}", rule.key());
                    rule.target_group.validate(&owner)?;
                }
            }
            ListenerKind::Layer4 | ListenerKind::Segment => {
                if !self.rules.is_empty() {
                    return Err(format!("{name}: only HTTP/HTTPS listeners carry rules"));
                }
                if let Some(tg) = &self.target_group {
                    tg.validate(&name)?;
                }
            }
        }

        Ok(())
    }
}

/// Parse a YAML list of desired listeners. Entries that omit the load
/// balancer are assigned to `lb_id`.
pub fn load_desired(yaml: &str, lb_id: &str) -> crate::Result<Vec<Listener>> {
    let mut listeners: Vec<Listener> = serde_yaml::from_str(yaml)?;
    for listener in &mut listeners {
        if listener.load_balancer_id.is_empty() {
            listener.load_balancer_id = lb_id.to_string();
        }
    }
    Ok(listeners)
}
