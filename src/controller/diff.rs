//! Desired vs observed comparison for listeners, rules and backends
//!
//! All comparisons use effective attributes so values the provider
//! normalises away never show up as a change.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::info;

use crate::model::{Backend, BackendKey, Listener, ListenerKey, Rule, RuleKey};

/// Backend changes for one target group, keyed by `(ip, port)`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendDiff {
    pub to_register: Vec<Backend>,
    pub to_deregister: Vec<Backend>,
    /// Same key, different weight; carries the desired weight
    pub to_reweight: Vec<Backend>,
    pub unchanged: Vec<Backend>,
}

impl BackendDiff {
    pub fn is_empty(&self) -> bool {
        self.to_register.is_empty() && self.to_deregister.is_empty() && self.to_reweight.is_empty()
    }
}

pub fn diff_backends(desired: &[Backend], observed: &[Backend]) -> BackendDiff {
    let observed_by_key: BTreeMap<BackendKey, &Backend> =
        observed.iter().map(|b| (b.key(), b)).collect();
    let desired_keys: BTreeSet<BackendKey> = desired.iter().map(Backend::key).collect();

    let mut diff = BackendDiff::default();
    for backend in desired {
        match observed_by_key.get(&backend.key()) {
            None => diff.to_register.push(backend.clone()),
            Some(current) if current.weight != backend.weight => diff.to_reweight.push(backend.clone()),
            Some(_) => diff.unchanged.push(backend.clone()),
        }
    }
    diff.to_deregister = observed
        .iter()
        .filter(|b| !desired_keys.contains(&b.key()))
        .cloned()
        .collect();
    diff
}

/// A rule present on both sides
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleUpdate {
    pub desired: Rule,
    /// Carries the provider rule id
    pub observed: Rule,
    pub attributes_changed: bool,
    pub backends: BackendDiff,
}

impl RuleUpdate {
    pub fn rule_id(&self) -> Option<&str> {
        self.observed.rule_id.as_deref()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleDiff {
    pub to_add: Vec<Rule>,
    pub to_delete: Vec<Rule>,
    pub to_update: Vec<RuleUpdate>,
    pub unchanged: Vec<RuleKey>,
}

impl RuleDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty() && self.to_update.is_empty()
    }
}

fn rule_attributes_changed(desired: &Rule, observed: &Rule, rule_certificates: bool) -> bool {
    desired.attributes.effective() != observed.attributes.effective()
        || desired.effective_certificate(rule_certificates)
            != observed.effective_certificate(rule_certificates)
}

/// Diff the rules of one listener. `rule_certificates` is the owning
/// listener's [`Listener::rule_certificates`].
pub fn diff_rules(desired: &[Rule], observed: &[Rule], rule_certificates: bool) -> RuleDiff {
    let observed_by_key: BTreeMap<RuleKey, &Rule> = observed.iter().map(|r| (r.key(), r)).collect();
    let desired_keys: BTreeSet<RuleKey> = desired.iter().map(Rule::key).collect();

    let mut diff = RuleDiff::default();
    for rule in desired {
        let Some(current) = observed_by_key.get(&rule.key()) else {
            diff.to_add.push(rule.clone());
            continue;
        };
        let attributes_changed = rule_attributes_changed(rule, current, rule_certificates);
        let backends = diff_backends(&rule.target_group.backends, &current.target_group.backends);
        if attributes_changed || !backends.is_empty() {
            diff.to_update.push(RuleUpdate {
                desired: rule.clone(),
                observed: (*current).clone(),
                attributes_changed,
                backends,
            });
        } else {
            diff.unchanged.push(rule.key());
        }
    }
    diff.to_delete = observed
        .iter()
        .filter(|r| !desired_keys.contains(&r.key()))
        .cloned()
        .collect();
    diff
}

/// A listener present on both sides
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerUpdate {
    pub desired: Listener,
    /// Carries the provider listener id
    pub observed: Listener,
    pub attributes_changed: bool,
    pub rules: RuleDiff,
    pub backends: BackendDiff,
}

impl ListenerUpdate {
    pub fn listener_id(&self) -> Option<&str> {
        self.observed.listener_id.as_deref()
    }

    /// Nothing needs to be sent to the provider
    pub fn is_noop(&self) -> bool {
        !self.attributes_changed && self.rules.is_empty() && self.backends.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerDiff {
    pub to_add: Vec<Listener>,
    pub to_update: Vec<ListenerUpdate>,
    pub to_delete: Vec<Listener>,
}

/// Counts of planned work
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub deletes: usize,
    pub unchanged: usize,
}

impl ListenerDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty()
            && self.to_delete.is_empty()
            && self.to_update.iter().all(ListenerUpdate::is_noop)
    }

    pub fn summary(&self) -> DiffSummary {
        let updates = self.to_update.iter().filter(|u| !u.is_noop()).count();
        DiffSummary {
            adds: self.to_add.len(),
            updates,
            deletes: self.to_delete.len(),
            unchanged: self.to_update.len() - updates,
        }
    }
}

fn listener_attributes_changed(desired: &Listener, observed: &Listener) -> bool {
    desired.effective_attributes() != observed.effective_attributes()
        || desired.effective_certificate() != observed.effective_certificate()
}

fn diff_listener(desired: &Listener, observed: &Listener) -> ListenerUpdate {
    let (rules, backends) = if desired.protocol.is_layer7() {
        (
            diff_rules(&desired.rules, &observed.rules, desired.rule_certificates()),
            BackendDiff::default(),
        )
    } else {
        (RuleDiff::default(), diff_backends(desired.backends(), observed.backends()))
    };
    ListenerUpdate {
        desired: desired.clone(),
        observed: observed.clone(),
        attributes_changed: listener_attributes_changed(desired, observed),
        rules,
        backends,
    }
}

/// Partition desired and observed listeners into adds, updates and deletes.
///
/// Protocol is part of the key: a port slot whose protocol changes yields a
/// delete of the old listener and an add of the new one.
pub fn diff_listeners(desired: &[Listener], observed: &BTreeMap<ListenerKey, Listener>) -> ListenerDiff {
    let desired_keys: BTreeSet<ListenerKey> = desired.iter().map(Listener::key).collect();

    let mut diff = ListenerDiff::default();
    for listener in desired {
        let key = listener.key();
        match observed.get(&key) {
            Some(current) => diff.to_update.push(diff_listener(listener, current)),
            None => {
                if let Some(old) = observed.keys().find(|k| k.same_slot(&key) && k.protocol != key.protocol) {
                    info!(
                        "Protocol change on {}: {} -> {}, replacing listener",
                        key, old.protocol, key.protocol
                    );
                }
                diff.to_add.push(listener.clone());
            }
        }
    }
    diff.to_delete = observed
        .iter()
        .filter(|(key, _)| !desired_keys.contains(key))
        .map(|(_, listener)| listener.clone())
        .collect();
    diff
}
