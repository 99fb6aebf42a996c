//! Value types shared by the reconciliation engine and the conflict detector
//!
//! Everything here is rebuilt on every reconciliation pass, either from the
//! desired-state supplier or from a fresh provider read. Nothing is cached.

mod listener;
pub mod outcome;

pub use listener::{
    load_desired, Backend, BackendKey, CertificateRef, HealthCheck, Listener, ListenerAttributes,
    ListenerKey, ListenerKind, Protocol, Rule, RuleAttributes, RuleKey, Scheduler, SslMode,
    TargetGroup,
};
pub use outcome::{BatchResult, FailureCause, Outcome, ResultMap};
