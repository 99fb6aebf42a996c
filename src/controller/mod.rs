//! Listener reconciliation
//!
//! Reads observed listener state, diffs it against the desired set and
//! applies the result through a batched, retrying [`crate::cloud::CloudClient`].

pub mod batch;
pub mod diff;
pub mod fetch;

pub use batch::{
    apply_listener_ids, group_for_create, BatchReconciler, CreateGroupKey, ListenerPhase,
    ListenerProgress, ReconcileReport,
};
pub use diff::{
    diff_backends, diff_listeners, diff_rules, BackendDiff, DiffSummary, ListenerDiff,
    ListenerUpdate, RuleDiff, RuleUpdate,
};
pub use fetch::fetch_listeners;
