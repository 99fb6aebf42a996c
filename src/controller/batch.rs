//! Execution of a listener diff against the provider
//!
//! One pass runs in a fixed order: deletions (awaited), creations,
//! updates, then every backend change flattened into bulk deregister,
//! reweight and register calls. Failures are attributed to the listener
//! that owns the failing listener, rule or backend; siblings carry on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::diff::{diff_listeners, DiffSummary, ListenerDiff, ListenerUpdate};
use super::fetch::fetch_listeners;
use crate::cloud::{CloudClient, TargetBinding};
use crate::error::{Error, Result};
use crate::model::{
    Backend, BatchResult, CertificateRef, FailureCause, Listener, ListenerAttributes, ListenerKind,
    Outcome, Protocol, ResultMap, Rule,
};

/// Where a listener is in the current pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerPhase {
    Planned,
    Creating,
    Updating,
    Deleting,
    Succeeded,
    Failed,
}

/// Accumulated state of one listener during a pass
#[derive(Clone, Debug)]
pub struct ListenerProgress {
    pub phase: ListenerPhase,
    pub listener_id: Option<String>,
    pub causes: Vec<FailureCause>,
}

impl ListenerProgress {
    pub fn planned(listener_id: Option<String>) -> Self {
        Self {
            phase: ListenerPhase::Planned,
            listener_id,
            causes: Vec::new(),
        }
    }

    pub fn start(&mut self, phase: ListenerPhase) {
        self.phase = phase;
    }

    /// Record a failure of the listener itself or of one of its sub-resources
    pub fn fail(&mut self, cause: FailureCause) {
        self.phase = ListenerPhase::Failed;
        self.causes.push(cause);
    }

    pub fn finish(self) -> Outcome {
        match (self.causes.is_empty(), self.listener_id) {
            (true, Some(id)) => Outcome::Succeeded { id },
            (true, None) => Outcome::Failed {
                causes: vec![FailureCause::new(
                    "Reconcile",
                    None,
                    "provider returned no listener id",
                )],
            },
            (false, _) => Outcome::Failed {
                causes: self.causes,
            },
        }
    }
}

/// Listeners that can share one create call
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CreateGroupKey {
    pub protocol: Protocol,
    pub attributes: ListenerAttributes,
    pub certificate: Option<CertificateRef>,
}

impl CreateGroupKey {
    pub fn of(listener: &Listener) -> Self {
        Self {
            protocol: listener.protocol,
            attributes: listener.effective_attributes(),
            certificate: listener.effective_certificate(),
        }
    }
}

/// Group listeners by [`CreateGroupKey`], keeping first-seen order
pub fn group_for_create(listeners: &[Listener]) -> Vec<(CreateGroupKey, Vec<Listener>)> {
    let mut groups: Vec<(CreateGroupKey, Vec<Listener>)> = Vec::new();
    for listener in listeners {
        let key = CreateGroupKey::of(listener);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(listener.clone()),
            None => groups.push((key, vec![listener.clone()])),
        }
    }
    groups
}

/// Result of one reconciliation pass
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub results: ResultMap,
    pub diff_summary: DiffSummary,
}

impl ReconcileReport {
    pub fn failed(&self) -> impl Iterator<Item = (&String, &Outcome)> {
        self.results.iter().filter(|(_, o)| !o.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Write succeeded ids back into the desired listeners' status field
pub fn apply_listener_ids(desired: &mut [Listener], results: &ResultMap) {
    for listener in desired.iter_mut() {
        if let Some(Outcome::Succeeded { id }) = results.get(&listener.name()) {
            listener.listener_id = Some(id.clone());
        }
    }
}

struct PlannedBinding {
    owner: String,
    binding: TargetBinding,
}

/// Every backend change of a pass, flattened
#[derive(Default)]
struct BackendPlan {
    deregister: Vec<PlannedBinding>,
    reweight: Vec<PlannedBinding>,
    register: Vec<PlannedBinding>,
}

impl BackendPlan {
    fn push(stage: &mut Vec<PlannedBinding>, owner: &str, listener_id: &str, rule_id: Option<&str>, backends: &[Backend]) {
        stage.extend(backends.iter().map(|backend| PlannedBinding {
            owner: owner.to_string(),
            binding: TargetBinding {
                listener_id: listener_id.to_string(),
                rule_id: rule_id.map(str::to_string),
                backend: backend.clone(),
            },
        }));
    }

    fn len(&self) -> usize {
        self.deregister.len() + self.reweight.len() + self.register.len()
    }
}

type Progress = BTreeMap<String, ListenerProgress>;

fn fail_owner(progress: &mut Progress, owner: &str, cause: FailureCause) {
    if let Some(p) = progress.get_mut(owner) {
        p.fail(cause);
    }
}

/// Drives one load balancer towards its desired listener set
pub struct BatchReconciler {
    client: Arc<CloudClient>,
    segment_concurrency: usize,
}

impl BatchReconciler {
    pub fn new(client: Arc<CloudClient>, segment_concurrency: usize) -> Self {
        Self {
            client,
            segment_concurrency,
        }
    }

    /// Reject desired state that cannot be applied as a whole
    pub fn validate(lb_id: &str, desired: &[Listener]) -> Result<()> {
        let mut names = BTreeSet::new();
        for listener in desired {
            listener.validate().map_err(Error::ValidationError)?;
            if listener.load_balancer_id != lb_id {
                return Err(Error::ValidationError(format!(
                    "{}: belongs to {}, not {}",
                    listener.name(),
                    listener.load_balancer_id,
                    lb_id
                )));
            }
            if !names.insert(listener.name()) {
                return Err(Error::ValidationError(format!(
                    "duplicate listener {}",
                    listener.name()
                )));
            }
        }
        Ok(())
    }

    /// Validate, read observed state and compute the diff without mutating anything
    #[instrument(skip(self, desired), fields(lb = %lb_id))]
    pub async fn plan(&self, lb_id: &str, desired: &[Listener]) -> Result<ListenerDiff> {
        Self::validate(lb_id, desired)?;
        let observed = fetch_listeners(&self.client, lb_id, &BTreeSet::new()).await?;
        Ok(diff_listeners(desired, &observed))
    }

    /// Full pass: plan, then apply
    #[instrument(skip(self, desired), fields(lb = %lb_id))]
    pub async fn reconcile(&self, lb_id: &str, desired: &[Listener]) -> Result<ReconcileReport> {
        let diff = self.plan(lb_id, desired).await?;
        let diff_summary = diff.summary();
        info!(
            "Planned {} adds, {} updates, {} deletes on {}",
            diff_summary.adds, diff_summary.updates, diff_summary.deletes, lb_id
        );
        let results = self.apply(lb_id, diff).await;
        Ok(ReconcileReport {
            results,
            diff_summary,
        })
    }

    /// Execute a diff. Never fails as a whole; every listener gets an outcome.
    #[instrument(skip(self, diff), fields(lb = %lb_id))]
    pub async fn apply(&self, lb_id: &str, diff: ListenerDiff) -> ResultMap {
        let mut progress: Progress = BTreeMap::new();
        let mut plan = BackendPlan::default();

        self.delete_listeners(lb_id, &diff.to_delete, &mut progress).await;
        self.create_listeners(lb_id, &diff.to_add, &mut progress, &mut plan).await;
        for update in &diff.to_update {
            self.update_listener(lb_id, update, &mut progress, &mut plan).await;
        }
        self.apply_backends(lb_id, plan, &mut progress).await;

        let results: ResultMap = progress
            .into_iter()
            .map(|(name, p)| (name, p.finish()))
            .collect();
        let failed = results.values().filter(|o| !o.is_success()).count();
        if failed > 0 {
            warn!("{} of {} listeners on {} did not converge", failed, results.len(), lb_id);
        } else {
            info!("All {} listeners on {} converged", results.len(), lb_id);
        }
        results
    }

    async fn delete_listeners(&self, lb_id: &str, listeners: &[Listener], progress: &mut Progress) {
        if listeners.is_empty() {
            return;
        }
        info!("Deleting {} listeners from {}", listeners.len(), lb_id);

        let mut names = Vec::new();
        let mut ids = Vec::new();
        for listener in listeners {
            let mut p = ListenerProgress::planned(listener.listener_id.clone());
            p.start(ListenerPhase::Deleting);
            match &listener.listener_id {
                Some(id) => {
                    names.push(listener.name());
                    ids.push(id.clone());
                }
                None => p.fail(FailureCause::new(
                    "DeleteLoadBalancerListeners",
                    None,
                    "observed listener has no id",
                )),
            }
            progress.insert(listener.name(), p);
        }

        let results = self.client.delete_listeners(lb_id, &ids).await;
        for (name, result) in names.iter().zip(results) {
            if let Some(p) = progress.get_mut(name) {
                match result {
                    Ok(()) => p.start(ListenerPhase::Succeeded),
                    Err(cause) => p.fail(cause),
                }
            }
        }
    }

    async fn create_listeners(
        &self,
        lb_id: &str,
        listeners: &[Listener],
        progress: &mut Progress,
        plan: &mut BackendPlan,
    ) {
        if listeners.is_empty() {
            return;
        }
        info!("Creating {} listeners on {}", listeners.len(), lb_id);

        let mut batched = Vec::new();
        let mut segments = Vec::new();
        for listener in listeners {
            let mut p = ListenerProgress::planned(None);
            p.start(ListenerPhase::Creating);
            progress.insert(listener.name(), p);
            match listener.kind() {
                ListenerKind::Segment => segments.push(listener.clone()),
                ListenerKind::Layer4 | ListenerKind::Layer7 => batched.push(listener.clone()),
            }
        }

        let mut created: Vec<(Listener, String)> = Vec::new();

        for (key, group) in group_for_create(&batched) {
            info!("Creating {} {} listeners in one group", group.len(), key.protocol);
            let results = self.client.create_listeners(lb_id, &group[0], &group).await;
            Self::record_created(group, results, progress, &mut created);
        }

        if !segments.is_empty() {
            let results = self
                .client
                .create_segment_listeners(lb_id, &segments, self.segment_concurrency)
                .await;
            Self::record_created(segments, results, progress, &mut created);
        }

        for (listener, listener_id) in created {
            let name = listener.name();
            match listener.kind() {
                ListenerKind::Layer7 => {
                    self.create_rules(lb_id, &name, &listener_id, &listener.rules, progress, plan)
                        .await;
                }
                ListenerKind::Layer4 | ListenerKind::Segment => {
                    BackendPlan::push(&mut plan.register, &name, &listener_id, None, listener.backends());
                }
            }
        }
    }

    fn record_created(
        listeners: Vec<Listener>,
        results: BatchResult<String>,
        progress: &mut Progress,
        created: &mut Vec<(Listener, String)>,
    ) {
        for (listener, result) in listeners.into_iter().zip(results) {
            let Some(p) = progress.get_mut(&listener.name()) else {
                continue;
            };
            match result {
                Ok(id) => {
                    p.listener_id = Some(id.clone());
                    created.push((listener, id));
                }
                Err(cause) => p.fail(cause),
            }
        }
    }

    /// Create rules on a listener and plan their backend registrations
    async fn create_rules(
        &self,
        lb_id: &str,
        owner: &str,
        listener_id: &str,
        rules: &[Rule],
        progress: &mut Progress,
        plan: &mut BackendPlan,
    ) {
        if rules.is_empty() {
            return;
        }
        let results = self.client.create_rules(lb_id, listener_id, rules).await;
        for (rule, result) in rules.iter().zip(results) {
            match result {
                Ok(rule_id) => BackendPlan::push(
                    &mut plan.register,
                    owner,
                    listener_id,
                    Some(&rule_id),
                    &rule.target_group.backends,
                ),
                Err(cause) => fail_owner(progress, owner, cause.scoped(&format!("rule {}", rule.key()))),
            }
        }
    }

    async fn update_listener(
        &self,
        lb_id: &str,
        update: &ListenerUpdate,
        progress: &mut Progress,
        plan: &mut BackendPlan,
    ) {
        let name = update.desired.name();
        let mut p = ListenerProgress::planned(update.observed.listener_id.clone());

        let Some(listener_id) = update.listener_id() else {
            p.fail(FailureCause::new("ModifyListener", None, "observed listener has no id"));
            progress.insert(name, p);
            return;
        };

        if update.is_noop() {
            p.start(ListenerPhase::Succeeded);
            progress.insert(name, p);
            return;
        }

        p.start(ListenerPhase::Updating);
        progress.insert(name.clone(), p);

        if update.attributes_changed {
            if let Err(e) = self.client.modify_listener(lb_id, listener_id, &update.desired).await {
                warn!("Failed to modify listener {}: {}", name, e);
                fail_owner(progress, &name, e.to_cause());
            }
        }

        match update.desired.kind() {
            ListenerKind::Layer7 => {
                let rules = &update.rules;

                let delete_ids: Vec<String> = rules
                    .to_delete
                    .iter()
                    .filter_map(|r| r.rule_id.clone())
                    .collect();
                if !delete_ids.is_empty() {
                    let results = self.client.delete_rules(lb_id, listener_id, &delete_ids).await;
                    for (rule_id, result) in delete_ids.iter().zip(results) {
                        if let Err(cause) = result {
                            fail_owner(progress, &name, cause.scoped(&format!("rule {rule_id}")));
                        }
                    }
                }

                for rule_update in &rules.to_update {
                    let Some(rule_id) = rule_update.rule_id() else {
                        continue;
                    };
                    let scope = format!("rule {}", rule_update.desired.key());
                    if rule_update.attributes_changed {
                        if let Err(e) = self
                            .client
                            .modify_rule(lb_id, listener_id, rule_id, &rule_update.desired)
                            .await
                        {
                            fail_owner(progress, &name, e.to_cause().scoped(&scope));
                        }
                    }
                    let backends = &rule_update.backends;
                    BackendPlan::push(&mut plan.deregister, &name, listener_id, Some(rule_id), &backends.to_deregister);
                    BackendPlan::push(&mut plan.reweight, &name, listener_id, Some(rule_id), &backends.to_reweight);
                    BackendPlan::push(&mut plan.register, &name, listener_id, Some(rule_id), &backends.to_register);
                }

                self.create_rules(lb_id, &name, listener_id, &rules.to_add, progress, plan)
                    .await;
            }
            ListenerKind::Layer4 | ListenerKind::Segment => {
                let backends = &update.backends;
                BackendPlan::push(&mut plan.deregister, &name, listener_id, None, &backends.to_deregister);
                BackendPlan::push(&mut plan.reweight, &name, listener_id, None, &backends.to_reweight);
                BackendPlan::push(&mut plan.register, &name, listener_id, None, &backends.to_register);
            }
        }
    }

    async fn apply_backends(&self, lb_id: &str, plan: BackendPlan, progress: &mut Progress) {
        if plan.len() == 0 {
            return;
        }
        info!(
            "Applying backend plan on {}: {} deregister, {} reweight, {} register",
            lb_id,
            plan.deregister.len(),
            plan.reweight.len(),
            plan.register.len()
        );

        let bindings = |stage: &[PlannedBinding]| -> Vec<TargetBinding> {
            stage.iter().map(|p| p.binding.clone()).collect()
        };

        if !plan.deregister.is_empty() {
            let results = self.client.deregister_targets(lb_id, &bindings(&plan.deregister)).await;
            Self::record_backends(&plan.deregister, results, progress);
        }
        if !plan.reweight.is_empty() {
            let results = self
                .client
                .modify_target_weights(lb_id, &bindings(&plan.reweight))
                .await;
            Self::record_backends(&plan.reweight, results, progress);
        }
        if !plan.register.is_empty() {
            let results = self.client.register_targets(lb_id, &bindings(&plan.register)).await;
            Self::record_backends(&plan.register, results, progress);
        }
    }

    fn record_backends(stage: &[PlannedBinding], results: BatchResult<()>, progress: &mut Progress) {
        for (planned, result) in stage.iter().zip(results) {
            if let Err(cause) = result {
                let scope = format!("backend {}", planned.binding.backend.key());
                fail_owner(progress, &planned.owner, cause.scoped(&scope));
            }
        }
    }
}
